//! StateStore — the authoritative in-memory view of local node, stream, and
//! artifact state (§4.2), write-through to `SharedKV`.
//!
//! The write-under-lock rule is load-bearing: the lock is held across
//! mutate → serialize → SharedKV SET → publish, so a concurrent reader on
//! this replica never observes a torn state and can never race a GET
//! against the publish notification. Because the sequence includes two
//! awaits (the SET and the publish), the guard has to survive across
//! `.await` points, which is why these are `tokio::sync::RwLock` rather
//! than `parking_lot` — the in-memory reads that dominate this component's
//! traffic never touch `SharedKV` and stay sub-millisecond regardless.

use crate::config::BalancerWeights;
use crate::error::Result;
use crate::kv::SharedKV;
use crate::types::{ArtifactHash, ClusterId, GeoPoint, InstanceId, NodeId, StreamName, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: NodeId,
    pub base_url: String,
    pub geo: Option<GeoPoint>,
    pub bandwidth_limit_bps: u64,

    pub cpu_pct_x10: u32,
    pub ram_used: u64,
    pub ram_max: u64,
    pub current_bw_bps: u64,
    pub last_seen: DateTime<Utc>,
    pub maintenance: bool,
    pub online: bool,

    /// Recomputed on every telemetry update.
    pub cpu_score: i64,
    pub ram_score: i64,

    pub artifacts: std::collections::HashSet<ArtifactHash>,
}

impl NodeState {
    pub fn new(id: NodeId, base_url: String) -> Self {
        Self {
            id,
            base_url,
            geo: None,
            bandwidth_limit_bps: 0,
            cpu_pct_x10: 0,
            ram_used: 0,
            ram_max: 0,
            current_bw_bps: 0,
            last_seen: Utc::now(),
            maintenance: false,
            online: true,
            cpu_score: 0,
            ram_score: 0,
            artifacts: Default::default(),
        }
    }

    /// Recomputes `cpu_score`/`ram_score` from raw telemetry (§3); the sole
    /// source of truth `balancer::score` reads from rather than
    /// re-deriving, so the two can never disagree on an edge case like
    /// `ram_max == 0`. `pub(crate)` so tests elsewhere in this crate that
    /// build a `NodeState` by hand (rather than through
    /// `StateStore::update_node_state`) can populate it too.
    pub(crate) fn recompute_scores(&mut self, weights: &BalancerWeights) {
        self.cpu_score =
            weights.cpu_weight - (self.cpu_pct_x10 as i64 * weights.cpu_weight / 1000);
        self.ram_score = if self.ram_max == 0 {
            weights.ram_weight
        } else {
            weights.ram_weight - (self.ram_used as i64 * weights.ram_weight / self.ram_max as i64)
        };
    }

    /// `online ⇒ now − last_seen < staleness_threshold`.
    pub fn is_stale(&self, threshold: std::time::Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_seen);
        elapsed.to_std().map(|d| d >= threshold).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamInstanceStatus {
    Starting,
    Live,
    Offline,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInstanceState {
    pub stream: StreamName,
    pub node: NodeId,
    pub inputs: u32,
    pub replicated: bool,
    pub current_viewers: u64,
    pub status: StreamInstanceStatus,
    pub buffer_state: Option<String>,
    pub tracks: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl StreamInstanceState {
    /// An instance is the stream's origin iff it has active ingests and is
    /// not itself a DTSC pull from elsewhere (§3 invariant).
    pub fn is_origin(&self) -> bool {
        self.inputs > 0 && !self.replicated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream: StreamName,
    pub tenant: TenantId,
    pub primary_node: Option<NodeId>,
    pub federated: bool,
    pub origin_cluster: ClusterId,
    pub online: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactType {
    Clip,
    Dvr,
    Vod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactStatus {
    Requested,
    Processing,
    Ready,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageLocation {
    Pending,
    Local,
    Freezing,
    S3,
    Defrosting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactState {
    pub hash: ArtifactHash,
    pub kind: ArtifactType,
    pub tenant: TenantId,
    pub size: u64,
    pub status: ArtifactStatus,
    pub storage_location: StorageLocation,
    pub cold_storage_url: Option<String>,
    pub origin_cluster: ClusterId,
    pub retention_deadline: Option<DateTime<Utc>>,
    pub local_node: Option<NodeId>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChangeNotification {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    instance_id: String,
}

pub struct StateStore {
    cluster_id: ClusterId,
    instance_id: InstanceId,
    kv: Arc<dyn SharedKV>,
    weights: BalancerWeights,

    nodes: RwLock<HashMap<NodeId, NodeState>>,
    streams: RwLock<HashMap<StreamName, StreamState>>,
    stream_instances: RwLock<HashMap<(StreamName, NodeId), StreamInstanceState>>,
    artifacts: RwLock<HashMap<ArtifactHash, ArtifactState>>,
}

const CHANNEL_NODE: &str = "node";
const CHANNEL_STREAM_INSTANCE: &str = "stream_instance";
const CHANNEL_STREAM: &str = "stream";
const CHANNEL_ARTIFACT: &str = "artifact";

impl StateStore {
    pub fn new(
        cluster_id: ClusterId,
        instance_id: InstanceId,
        kv: Arc<dyn SharedKV>,
        weights: BalancerWeights,
    ) -> Self {
        Self {
            cluster_id,
            instance_id,
            kv,
            weights,
            nodes: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            stream_instances: RwLock::new(HashMap::new()),
            artifacts: RwLock::new(HashMap::new()),
        }
    }

    fn updates_channel(&self) -> String {
        format!("foghorn:{}:state_updates", self.cluster_id)
    }

    fn node_key(&self, id: &NodeId) -> String {
        format!("{}:nodes:{}", self.cluster_id, id)
    }

    fn stream_key(&self, name: &StreamName) -> String {
        format!("{}:streams:{}", self.cluster_id, name)
    }

    fn stream_instance_key(&self, stream: &StreamName, node: &NodeId) -> String {
        format!("{}:stream_instances:{}:{}", self.cluster_id, stream, node)
    }

    fn artifact_key(&self, hash: &ArtifactHash) -> String {
        format!("{}:artifacts:{}", self.cluster_id, hash)
    }

    async fn publish_change(&self, kind: &str, id: String) -> Result<()> {
        let note = ChangeNotification {
            kind: kind.to_string(),
            id,
            instance_id: self.instance_id.to_string(),
        };
        let payload = serde_json::to_string(&note)?;
        self.kv.publish(&self.updates_channel(), payload).await
    }

    /// Acquire write lock, mutate, recompute scores, write-through, publish,
    /// release — in that order, under one lock acquisition (§4.2).
    pub async fn update_node_state<F>(&self, id: NodeId, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut NodeState),
    {
        let mut guard = self.nodes.write().await;
        let entry = guard
            .entry(id.clone())
            .or_insert_with(|| NodeState::new(id.clone(), String::new()));
        mutator(entry);
        entry.recompute_scores(&self.weights);
        let serialized = serde_json::to_string(&*entry)?;
        let key = self.node_key(&id);
        self.kv.set(&key, serialized, None).await?;
        self.publish_change(CHANNEL_NODE, id.to_string()).await?;
        Ok(())
    }

    pub async fn update_stream_instance<F>(
        &self,
        stream: StreamName,
        node: NodeId,
        mutator: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut StreamInstanceState),
    {
        let mut guard = self.stream_instances.write().await;
        let key_tuple = (stream.clone(), node.clone());
        let entry = guard.entry(key_tuple).or_insert_with(|| StreamInstanceState {
            stream: stream.clone(),
            node: node.clone(),
            inputs: 0,
            replicated: false,
            current_viewers: 0,
            status: StreamInstanceStatus::Starting,
            buffer_state: None,
            tracks: Vec::new(),
            updated_at: Utc::now(),
        });
        mutator(entry);
        entry.updated_at = Utc::now();
        let serialized = serde_json::to_string(&*entry)?;
        let key = self.stream_instance_key(&stream, &node);
        self.kv.set(&key, serialized, None).await?;
        self.publish_change(CHANNEL_STREAM_INSTANCE, format!("{stream}:{node}"))
            .await?;
        Ok(())
    }

    /// Remove a `StreamInstanceState` outright. Used on `STREAM_END` per the
    /// eviction decision recorded in `SPEC_FULL.md` §E.1.
    pub async fn evict_stream_instance(&self, stream: &StreamName, node: &NodeId) -> Result<()> {
        {
            let mut guard = self.stream_instances.write().await;
            guard.remove(&(stream.clone(), node.clone()));
        }
        self.kv.del(&self.stream_instance_key(stream, node)).await?;
        self.publish_change(CHANNEL_STREAM_INSTANCE, format!("{stream}:{node}"))
            .await?;
        Ok(())
    }

    pub async fn update_stream_state<F>(&self, name: StreamName, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut StreamState),
    {
        let mut guard = self.streams.write().await;
        let entry = guard.entry(name.clone()).or_insert_with(|| StreamState {
            stream: name.clone(),
            tenant: TenantId::new(""),
            primary_node: None,
            federated: false,
            origin_cluster: self.cluster_id.clone(),
            online: true,
            updated_at: Utc::now(),
        });
        mutator(entry);
        entry.updated_at = Utc::now();
        let serialized = serde_json::to_string(&*entry)?;
        let key = self.stream_key(&name);
        self.kv.set(&key, serialized, None).await?;
        self.publish_change(CHANNEL_STREAM, name.to_string()).await?;
        Ok(())
    }

    pub async fn update_artifact_state<F>(&self, hash: ArtifactHash, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut ArtifactState),
    {
        let mut guard = self.artifacts.write().await;
        let entry = guard.entry(hash.clone()).or_insert_with(|| ArtifactState {
            hash: hash.clone(),
            kind: ArtifactType::Clip,
            tenant: TenantId::new(""),
            size: 0,
            status: ArtifactStatus::Requested,
            storage_location: StorageLocation::Pending,
            cold_storage_url: None,
            origin_cluster: self.cluster_id.clone(),
            retention_deadline: None,
            local_node: None,
            updated_at: Utc::now(),
        });
        mutator(entry);
        entry.updated_at = Utc::now();
        let serialized = serde_json::to_string(&*entry)?;
        let key = self.artifact_key(&hash);
        self.kv.set(&key, serialized, None).await?;
        self.publish_change(CHANNEL_ARTIFACT, hash.to_string()).await?;
        Ok(())
    }

    // --- sub-millisecond reads; never touch SharedKV ---

    pub async fn get_node(&self, id: &NodeId) -> Option<NodeState> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn get_stream(&self, name: &StreamName) -> Option<StreamState> {
        self.streams.read().await.get(name).cloned()
    }

    pub async fn get_stream_instances(&self, name: &StreamName) -> Vec<StreamInstanceState> {
        self.stream_instances
            .read()
            .await
            .values()
            .filter(|i| &i.stream == name)
            .cloned()
            .collect()
    }

    pub async fn all_nodes(&self) -> Vec<NodeState> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn all_streams(&self) -> Vec<StreamState> {
        self.streams.read().await.values().cloned().collect()
    }

    /// Sum of `current_viewers` across every instance of `node`, used by
    /// `PeerManager`'s edge-telemetry cadence (§4.8).
    pub async fn viewer_count_for_node(&self, node: &NodeId) -> u64 {
        self.stream_instances
            .read()
            .await
            .values()
            .filter(|i| &i.node == node)
            .map(|i| i.current_viewers)
            .sum()
    }

    pub async fn find_node_by_artifact_hash(&self, hash: &ArtifactHash) -> Option<NodeId> {
        self.nodes
            .read()
            .await
            .values()
            .find(|n| n.artifacts.contains(hash))
            .map(|n| n.id.clone())
    }

    pub async fn get_artifact(&self, hash: &ArtifactHash) -> Option<ArtifactState> {
        self.artifacts.read().await.get(hash).cloned()
    }

    pub async fn all_artifacts_for_tenant(&self, tenant: &TenantId) -> Vec<ArtifactState> {
        self.artifacts
            .read()
            .await
            .values()
            .filter(|a| &a.tenant == tenant)
            .cloned()
            .collect()
    }

    /// Scan SharedKV at startup and merge into the in-memory maps. An entry
    /// already present locally (a heartbeat that arrived mid-startup) wins
    /// if it is newer than what SharedKV holds.
    pub async fn rehydrate(&self) -> Result<()> {
        self.rehydrate_nodes().await?;
        self.rehydrate_streams().await?;
        self.rehydrate_stream_instances().await?;
        self.rehydrate_artifacts().await?;
        Ok(())
    }

    async fn rehydrate_nodes(&self) -> Result<()> {
        let prefix = format!("{}:nodes:", self.cluster_id);
        let rows = self.kv.scan(&prefix).await?;
        let mut guard = self.nodes.write().await;
        for (_, raw) in rows {
            let remote: NodeState = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "skipping malformed node state during rehydrate");
                    continue;
                }
            };
            match guard.get(&remote.id) {
                Some(local) if local.last_seen >= remote.last_seen => {}
                _ => {
                    let mut merged = remote;
                    merged.recompute_scores(&self.weights);
                    guard.insert(merged.id.clone(), merged);
                }
            }
        }
        debug!(count = guard.len(), "rehydrated node state");
        Ok(())
    }

    async fn rehydrate_streams(&self) -> Result<()> {
        let prefix = format!("{}:streams:", self.cluster_id);
        let rows = self.kv.scan(&prefix).await?;
        let mut guard = self.streams.write().await;
        for (_, raw) in rows {
            let remote: StreamState = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match guard.get(&remote.stream) {
                Some(local) if local.updated_at >= remote.updated_at => {}
                _ => {
                    guard.insert(remote.stream.clone(), remote);
                }
            }
        }
        Ok(())
    }

    async fn rehydrate_stream_instances(&self) -> Result<()> {
        let prefix = format!("{}:stream_instances:", self.cluster_id);
        let rows = self.kv.scan(&prefix).await?;
        let mut guard = self.stream_instances.write().await;
        for (_, raw) in rows {
            let remote: StreamInstanceState = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let key = (remote.stream.clone(), remote.node.clone());
            match guard.get(&key) {
                Some(local) if local.updated_at >= remote.updated_at => {}
                _ => {
                    guard.insert(key, remote);
                }
            }
        }
        Ok(())
    }

    async fn rehydrate_artifacts(&self) -> Result<()> {
        let prefix = format!("{}:artifacts:", self.cluster_id);
        let rows = self.kv.scan(&prefix).await?;
        let mut guard = self.artifacts.write().await;
        for (_, raw) in rows {
            let remote: ArtifactState = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match guard.get(&remote.hash) {
                Some(local) if local.updated_at >= remote.updated_at => {}
                _ => {
                    guard.insert(remote.hash.clone(), remote);
                }
            }
        }
        Ok(())
    }

    /// Subscriber loop: apply each pub/sub notification by re-fetching the
    /// named key and merging it in. Self-notifications are filtered by
    /// instance id so a replica never re-applies its own write.
    pub async fn run_subscriber(self: Arc<Self>) {
        let mut rx = self.kv.subscribe(&self.updates_channel());
        loop {
            let msg = match rx.recv().await {
                Ok(m) => m,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            let note: ChangeNotification = match serde_json::from_str(&msg) {
                Ok(n) => n,
                Err(_) => continue,
            };
            if note.instance_id == self.instance_id.to_string() {
                continue;
            }
            if let Err(e) = self.apply_notification(&note).await {
                warn!(error = %e, kind = %note.kind, "failed to apply state notification");
            }
        }
    }

    async fn apply_notification(&self, note: &ChangeNotification) -> Result<()> {
        match note.kind.as_str() {
            CHANNEL_NODE => {
                let key = self.node_key(&NodeId::new(note.id.clone()));
                if let Some(raw) = self.kv.get(&key).await? {
                    let mut remote: NodeState = serde_json::from_str(&raw)?;
                    remote.recompute_scores(&self.weights);
                    self.nodes.write().await.insert(remote.id.clone(), remote);
                }
            }
            CHANNEL_STREAM_INSTANCE => {
                if let Some((stream, node)) = note.id.split_once(':') {
                    let key = self.stream_instance_key(
                        &StreamName::new(stream.to_string()),
                        &NodeId::new(node.to_string()),
                    );
                    if let Some(raw) = self.kv.get(&key).await? {
                        let remote: StreamInstanceState = serde_json::from_str(&raw)?;
                        self.stream_instances
                            .write()
                            .await
                            .insert((remote.stream.clone(), remote.node.clone()), remote);
                    } else {
                        self.stream_instances.write().await.remove(&(
                            StreamName::new(stream.to_string()),
                            NodeId::new(node.to_string()),
                        ));
                    }
                }
            }
            CHANNEL_STREAM => {
                let key = self.stream_key(&StreamName::new(note.id.clone()));
                if let Some(raw) = self.kv.get(&key).await? {
                    let remote: StreamState = serde_json::from_str(&raw)?;
                    self.streams.write().await.insert(remote.stream.clone(), remote);
                }
            }
            CHANNEL_ARTIFACT => {
                let key = self.artifact_key(&ArtifactHash::new(note.id.clone()));
                if let Some(raw) = self.kv.get(&key).await? {
                    let remote: ArtifactState = serde_json::from_str(&raw)?;
                    self.artifacts.write().await.insert(remote.hash.clone(), remote);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

//! `FederationCache` — TTL'd cross-cluster records layered over `SharedKV`
//! (§4.6). Every namespace here has an explicit TTL; nothing in this module
//! is ever written without one, which is what the TTL-discipline invariant
//! (§8.9) actually checks — local state (`state::StateStore`) is the only
//! place untimed records are allowed to live.
//!
//! Grounded on the teacher's `cache` module for the namespace/TTL-constant
//! shape and `clustering::geo_replication` for the idea of a smoothed
//! cross-cluster summary record.

use crate::balancer::ScoredCandidate;
use crate::error::Result;
use crate::kv::SharedKV;
use crate::types::{ClusterId, GeoPoint, NodeId, PlaybackId, StreamName, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const TTL_REMOTE_EDGE: Duration = Duration::from_secs(30);
pub const TTL_EDGE_SUMMARY: Duration = Duration::from_secs(60);
pub const TTL_STREAM_AD: Duration = Duration::from_secs(15);
pub const TTL_PLAYBACK_INDEX: Duration = Duration::from_secs(30);
pub const TTL_ACTIVE_REPLICATION: Duration = Duration::from_secs(5 * 60);
pub const TTL_REMOTE_REPLICATION: Duration = Duration::from_secs(5 * 60);
pub const TTL_PEER_HEARTBEAT: Duration = Duration::from_secs(30);
pub const TTL_PEER_ADDRESSES: Duration = Duration::from_secs(30);
pub const TTL_LEADER_LEASE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEdgeRecord {
    pub node: NodeId,
    pub base_url: String,
    pub geo: Option<GeoPoint>,
    pub cpu_score: i64,
    pub ram_score: i64,
    pub bw_headroom_bps: i64,
    pub current_viewers: u64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSummaryRecord {
    pub peer: ClusterId,
    pub avg_cpu_score: i64,
    pub avg_ram_score: i64,
    pub avg_bw_headroom_bps: i64,
    pub edge_count: u32,
    pub smoothed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAdRecord {
    pub peer: ClusterId,
    pub stream: StreamName,
    pub edges: Vec<ScoredCandidate>,
    pub playback_id: Option<PlaybackId>,
    pub origin_cluster: ClusterId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveReplicationRecord {
    pub stream: StreamName,
    pub source_cluster: ClusterId,
    pub dest_cluster: ClusterId,
    pub dest_node: NodeId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteReplicationEntry {
    pub stream: StreamName,
    pub puller_cluster: ClusterId,
    pub dtsc_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHeartbeatRecord {
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
    pub stream_count: u64,
    pub aggregate_bw_bps: u64,
    pub edge_count: u32,
    pub geo: Option<GeoPoint>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    pub cluster: ClusterId,
    pub federation_address: String,
    pub shared_tenants: Vec<TenantId>,
}

pub struct FederationCache {
    cluster_id: ClusterId,
    kv: Arc<dyn SharedKV>,
}

impl FederationCache {
    pub fn new(cluster_id: ClusterId, kv: Arc<dyn SharedKV>) -> Self {
        Self { cluster_id, kv }
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut s = format!("{}:", self.cluster_id);
        s.push_str(&parts.join(":"));
        s
    }

    async fn put<T: Serialize>(&self, key: String, value: &T, ttl: Duration) -> Result<()> {
        let serialized = serde_json::to_string(value)?;
        self.kv.set(&key, serialized, Some(ttl)).await
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(&self, key: String) -> Result<Option<T>> {
        match self.kv.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put_remote_edge(&self, peer: &ClusterId, record: &RemoteEdgeRecord) -> Result<()> {
        let key = self.key(&["remote_edges", peer.as_str(), record.node.as_str()]);
        self.put(key, record, TTL_REMOTE_EDGE).await
    }

    pub async fn remote_edges(&self, peer: &ClusterId) -> Result<Vec<RemoteEdgeRecord>> {
        let prefix = self.key(&["remote_edges", peer.as_str(), ""]);
        let rows = self.kv.scan(&prefix).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(_, raw)| serde_json::from_str(&raw).ok())
            .collect())
    }

    pub async fn put_edge_summary(&self, peer: &ClusterId, record: &EdgeSummaryRecord) -> Result<()> {
        let key = self.key(&["edge_summary", peer.as_str()]);
        self.put(key, record, TTL_EDGE_SUMMARY).await
    }

    pub async fn edge_summary(&self, peer: &ClusterId) -> Result<Option<EdgeSummaryRecord>> {
        self.fetch(self.key(&["edge_summary", peer.as_str()])).await
    }

    pub async fn put_stream_ad(&self, record: &StreamAdRecord) -> Result<()> {
        let key = self.key(&["stream_ad", record.peer.as_str(), record.stream.as_str()]);
        self.put(key.clone(), record, TTL_STREAM_AD).await?;
        if let Some(pbid) = &record.playback_id {
            let idx_key = self.key(&["playback_index", pbid.as_str()]);
            self.put(idx_key, &key, TTL_PLAYBACK_INDEX).await?;
        }
        Ok(())
    }

    pub async fn stream_ad(&self, peer: &ClusterId, stream: &StreamName) -> Result<Option<StreamAdRecord>> {
        self.fetch(self.key(&["stream_ad", peer.as_str(), stream.as_str()])).await
    }

    /// All stream advertisements across all peers for one stream name,
    /// used by `SourceResolver`'s cross-cluster fallback when it does not
    /// yet know which peer originates the stream.
    pub async fn stream_ads_for(&self, stream: &StreamName) -> Result<Vec<StreamAdRecord>> {
        let prefix = self.key(&["stream_ad", ""]);
        let rows = self.kv.scan(&prefix).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(_, raw)| serde_json::from_str::<StreamAdRecord>(&raw).ok())
            .filter(|ad| &ad.stream == stream)
            .collect())
    }

    pub async fn resolve_playback_id(&self, pbid: &PlaybackId) -> Result<Option<StreamAdRecord>> {
        let idx_key = self.key(&["playback_index", pbid.as_str()]);
        let Some(ad_key): Option<String> = self.fetch(idx_key).await? else {
            return Ok(None);
        };
        self.fetch(ad_key).await
    }

    pub async fn put_active_replication(&self, record: &ActiveReplicationRecord) -> Result<()> {
        let key = self.key(&["active_replications", record.stream.as_str()]);
        self.put(key, record, TTL_ACTIVE_REPLICATION).await
    }

    pub async fn active_replication(&self, stream: &StreamName) -> Result<Option<ActiveReplicationRecord>> {
        self.fetch(self.key(&["active_replications", stream.as_str()])).await
    }

    pub async fn clear_active_replication(&self, stream: &StreamName) -> Result<()> {
        self.kv.del(&self.key(&["active_replications", stream.as_str()])).await
    }

    pub async fn put_remote_replication(&self, peer: &ClusterId, entry: &RemoteReplicationEntry) -> Result<()> {
        let key = self.key(&["remote_replications", entry.stream.as_str(), peer.as_str()]);
        self.put(key, entry, TTL_REMOTE_REPLICATION).await
    }

    pub async fn remote_replication(&self, stream: &StreamName, peer: &ClusterId) -> Result<Option<RemoteReplicationEntry>> {
        self.fetch(self.key(&["remote_replications", stream.as_str(), peer.as_str()])).await
    }

    pub async fn put_peer_heartbeat(&self, peer: &ClusterId, record: &PeerHeartbeatRecord) -> Result<()> {
        let key = self.key(&["peer_heartbeat", peer.as_str()]);
        self.put(key, record, TTL_PEER_HEARTBEAT).await
    }

    pub async fn peer_heartbeat(&self, peer: &ClusterId) -> Result<Option<PeerHeartbeatRecord>> {
        self.fetch(self.key(&["peer_heartbeat", peer.as_str()])).await
    }

    pub async fn put_peer_address(&self, addr: &PeerAddress) -> Result<()> {
        let key = self.key(&["peer_addresses", addr.cluster.as_str()]);
        self.put(key, addr, TTL_PEER_ADDRESSES).await
    }

    pub async fn peer_addresses(&self) -> Result<Vec<PeerAddress>> {
        let prefix = self.key(&["peer_addresses", ""]);
        let rows = self.kv.scan(&prefix).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(_, raw)| serde_json::from_str(&raw).ok())
            .collect())
    }

    /// The one peer's own record, used to check its `shared_tenants` grant
    /// before answering a `query_stream` RPC it sent (§4.7).
    pub async fn peer_address(&self, cluster: &ClusterId) -> Result<Option<PeerAddress>> {
        self.fetch(self.key(&["peer_addresses", cluster.as_str()])).await
    }

    pub fn leader_lease_key(&self) -> String {
        self.key(&["leader", "peer_manager"])
    }
}

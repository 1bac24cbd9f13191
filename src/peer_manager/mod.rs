//! `PeerManager` — owns the peer-channel lifecycle (§4.8): leader election
//! for who drives outbound cadences, connection bring-up/tear-down for every
//! federation peer, and the `InboundFrameSink` that folds received frames
//! into `FederationCache` and the artifact-advertisement index
//! `ArtifactAccess` queries through `ArtifactAdIndex`.
//!
//! Grounded on `clustering::coordinator`'s peer-lifecycle shape,
//! `networking::membership::raft::election`'s lease-based leader election
//! (generalized from Raft terms to a single `SharedKV` lease), and
//! `clustering::membership`'s peer-set reconciliation loop.

use crate::artifact_access::ArtifactAdIndex;
use crate::balancer::{self, RequestContext, ScoredCandidate};
use crate::config::{BalancerWeights, Config};
use crate::error::Result;
use crate::federation::client::{decode_frame, encode_frame, FederationClient};
use crate::federation::messages::PeerFrame;
use crate::federation::server::InboundFrameSink;
use crate::federation_cache::{
    EdgeSummaryRecord, FederationCache, PeerAddress, PeerHeartbeatRecord, RemoteEdgeRecord,
    StreamAdRecord, TTL_LEADER_LEASE,
};
use crate::kv::SharedKV;
use crate::registry_client::{PeerDescriptor, Registry};
use crate::state::StateStore;
use crate::types::{ArtifactHash, ClusterId, InstanceId, TenantId};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: u32 = 1;
const EDGE_TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);
const CLUSTER_EDGE_SUMMARY_INTERVAL: Duration = Duration::from_secs(15);
const STREAM_ADVERTISEMENT_INTERVAL: Duration = Duration::from_secs(5);
const ARTIFACT_ADVERTISEMENT_INTERVAL: Duration = Duration::from_secs(30);
const PEER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const STREAM_LIFECYCLE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);
/// A demand-discovered peer absent from this many consecutive `ListPeers`
/// reconciliations is considered genuinely gone (`SPEC_FULL.md` §E.2).
const RECONCILIATION_GRACE_MISSES: u32 = 2;
/// Capped so one advertisement frame can't grow unbounded on a node hoarding
/// many artifacts; the rest are picked up on the next cadence tick.
const MAX_ARTIFACT_ADS_PER_TICK: usize = 200;

struct PeerRuntime {
    address: String,
    shared_tenants: Vec<TenantId>,
    missed_reconciliations: u32,
}

struct Inner {
    local_cluster: ClusterId,
    instance_id: InstanceId,
    kv: Arc<dyn SharedKV>,
    fed_cache: Arc<FederationCache>,
    fed_client: Arc<FederationClient>,
    state: Arc<StateStore>,
    registry: Arc<dyn Registry>,
    weights: BalancerWeights,
    reconciliation_interval: Duration,
    peers: DashMap<ClusterId, PeerRuntime>,
    artifact_index: DashMap<ArtifactHash, ClusterId>,
    remote_capacity: DashMap<ClusterId, u64>,
    is_leader: AtomicBool,
}

/// Cheap to clone: wraps a single `Arc<Inner>`, matching the pattern used
/// anywhere this crate hands the same collaborator to several spawned
/// tasks (a connection's read loop, its cadence scheduler, and the
/// `InboundFrameSink` the federation server holds, all share one `Inner`).
#[derive(Clone)]
pub struct PeerManager(Arc<Inner>);

impl PeerManager {
    pub fn new(
        config: &Config,
        kv: Arc<dyn SharedKV>,
        fed_cache: Arc<FederationCache>,
        fed_client: Arc<FederationClient>,
        state: Arc<StateStore>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        PeerManager(Arc::new(Inner {
            local_cluster: config.cluster_id.clone(),
            instance_id: InstanceId::new(config.instance_id.clone()),
            kv,
            fed_cache,
            fed_client,
            state,
            registry,
            weights: config.weights,
            reconciliation_interval: config.reconciliation_interval,
            peers: DashMap::new(),
            artifact_index: DashMap::new(),
            remote_capacity: DashMap::new(),
            is_leader: AtomicBool::new(false),
        }))
    }

    pub fn is_leader(&self) -> bool {
        self.0.is_leader.load(Ordering::SeqCst)
    }

    /// Register a peer the moment it is learned about from a
    /// `Registry::validate_stream_key`/`resolve_playback_id` response,
    /// ahead of the next reconciliation sweep (§4.8 demand-driven path).
    pub fn note_peer(&self, descriptor: &PeerDescriptor) {
        self.0
            .fed_client
            .register_peer(descriptor.cluster_id.clone(), descriptor.federation_address.clone());
        self.0
            .peers
            .entry(descriptor.cluster_id.clone())
            .and_modify(|p| {
                p.address = descriptor.federation_address.clone();
                p.shared_tenants = descriptor.shared_tenants.clone();
            })
            .or_insert_with(|| PeerRuntime {
                address: descriptor.federation_address.clone(),
                shared_tenants: descriptor.shared_tenants.clone(),
                missed_reconciliations: 0,
            });
    }

    /// Drive leader election and, while leader, the reconciliation and
    /// connection-dial loops. Runs until `shutdown` fires, then releases
    /// the lease and disconnects every outbound channel.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let lease_key = self.0.fed_cache.leader_lease_key();
        let mut connected: HashSet<ClusterId> = HashSet::new();
        let mut last_reconcile = tokio::time::Instant::now() - self.0.reconciliation_interval;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.step_down(&mut connected).await;
                    return;
                }
                _ = tokio::time::sleep(LEASE_RENEW_INTERVAL) => {}
            }

            let leading = self.try_acquire_or_renew(&lease_key).await;
            if !leading {
                if self.0.is_leader.swap(false, Ordering::SeqCst) {
                    info!("lost peer_manager leadership, tearing down outbound connections");
                    self.step_down(&mut connected).await;
                }
                continue;
            }
            if !self.0.is_leader.swap(true, Ordering::SeqCst) {
                info!("acquired peer_manager leadership");
            }

            if last_reconcile.elapsed() >= self.0.reconciliation_interval {
                last_reconcile = tokio::time::Instant::now();
                if let Err(e) = self.reconcile().await {
                    warn!(error = %e, "peer reconciliation failed");
                }
            }

            self.ensure_connections(&mut connected).await;
        }
    }

    async fn try_acquire_or_renew(&self, lease_key: &str) -> bool {
        let owner = self.0.instance_id.to_string();
        match self.0.kv.renew_lease(lease_key, &owner, TTL_LEADER_LEASE).await {
            Ok(true) => true,
            Ok(false) => self
                .0
                .kv
                .set_if_absent(lease_key, owner.clone(), TTL_LEADER_LEASE)
                .await
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn step_down(&self, connected: &mut HashSet<ClusterId>) {
        for peer in connected.drain() {
            self.0.fed_client.clear_outbound(&peer);
        }
        if self.0.is_leader.load(Ordering::SeqCst) {
            let _ = self.0.kv.del(&self.0.fed_cache.leader_lease_key()).await;
        }
        self.0.is_leader.store(false, Ordering::SeqCst);
    }

    /// §4.8: merge `Registry::list_peers` into the known peer set, applying
    /// the grace period before closing a demand-discovered peer that drops
    /// out of one reconciliation pass.
    async fn reconcile(&self) -> Result<()> {
        let fresh = self.0.registry.list_peers(&self.0.local_cluster).await?;
        let fresh_ids: HashSet<ClusterId> = fresh.iter().map(|p| p.cluster_id.clone()).collect();

        for descriptor in &fresh {
            self.note_peer(descriptor);
            if let Some(mut rt) = self.0.peers.get_mut(&descriptor.cluster_id) {
                rt.missed_reconciliations = 0;
            }
            self.0
                .fed_cache
                .put_peer_address(&PeerAddress {
                    cluster: descriptor.cluster_id.clone(),
                    federation_address: descriptor.federation_address.clone(),
                    shared_tenants: descriptor.shared_tenants.clone(),
                })
                .await?;
        }

        let stale: Vec<ClusterId> = self
            .0
            .peers
            .iter()
            .filter(|e| !fresh_ids.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for cluster in stale {
            let should_drop = match self.0.peers.get_mut(&cluster) {
                Some(mut rt) => {
                    rt.missed_reconciliations += 1;
                    rt.missed_reconciliations >= RECONCILIATION_GRACE_MISSES
                }
                None => false,
            };
            if should_drop {
                info!(peer = %cluster, "dropping peer absent from two consecutive reconciliations");
                self.0.peers.remove(&cluster);
                self.0.fed_client.remove_peer(&cluster);
            }
        }
        Ok(())
    }

    /// Dial every known peer we are not already connected to. Connection
    /// direction is deterministic by cluster id ordering so two peers never
    /// both dial each other; the other side accepts via
    /// `federation::server::handle_peer_socket` and reaches us through
    /// `on_connect`.
    async fn ensure_connections(&self, connected: &mut HashSet<ClusterId>) {
        let targets: Vec<ClusterId> = self
            .0
            .peers
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| !connected.contains(p) && self.0.local_cluster.as_str() < p.as_str())
            .collect();

        for peer in targets {
            match self.0.fed_client.connect_peer_channel(&peer).await {
                Ok((stream,)) => {
                    connected.insert(peer.clone());
                    let this = self.clone();
                    let peer_clone = peer.clone();
                    tokio::spawn(async move { this.drive_connection(peer_clone, stream).await });
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "peer channel dial failed, will retry");
                }
            }
        }
    }

    /// Own an outbound `PeerChannel` this replica dialed: send `Hello`, run
    /// the cadence scheduler, and pump frames in both directions until the
    /// socket closes.
    async fn drive_connection(
        self,
        peer: ClusterId,
        stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    ) {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<PeerFrame>();
        self.0.fed_client.set_outbound(peer.clone(), tx.clone());

        let hello = PeerFrame::Hello {
            protocol_version: PROTOCOL_VERSION,
            cluster_id: self.0.local_cluster.clone(),
            capabilities: default_capabilities(),
        };
        let _ = tx.send(hello);

        let cadence_self = self.clone();
        let cadence_peer = peer.clone();
        let cadence_tx = tx.clone();
        let cadence_task = tokio::spawn(async move {
            cadence_self.run_cadences(cadence_peer, cadence_tx).await;
        });

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(frame) = outgoing else { break };
                    match encode_frame(&frame) {
                        Ok(msg) => if sink.send(msg).await.is_err() { break },
                        Err(_) => continue,
                    }
                }
                incoming = source.next() => {
                    let Some(Ok(msg)) = incoming else { break };
                    if let Some(frame) = decode_frame(&msg) {
                        let is_goodbye = matches!(frame, PeerFrame::Goodbye { .. });
                        self.handle_inbound_frame(peer.clone(), frame).await;
                        if is_goodbye {
                            break;
                        }
                    }
                }
            }
        }

        cadence_task.abort();
        self.0.fed_client.clear_outbound(&peer);
    }

    /// One peer connection's outbound cadence scheduler (§4.8's nine
    /// families), run for the connection's lifetime regardless of which
    /// side dialed.
    async fn run_cadences(&self, peer: ClusterId, tx: mpsc::UnboundedSender<PeerFrame>) {
        let mut edge_telemetry = tokio::time::interval(EDGE_TELEMETRY_INTERVAL);
        let mut edge_summary = tokio::time::interval(CLUSTER_EDGE_SUMMARY_INTERVAL);
        let mut stream_ads = tokio::time::interval(STREAM_ADVERTISEMENT_INTERVAL);
        let mut artifact_ads = tokio::time::interval(ARTIFACT_ADVERTISEMENT_INTERVAL);
        let mut heartbeat = tokio::time::interval(PEER_HEARTBEAT_INTERVAL);
        let mut lifecycle = tokio::time::interval(STREAM_LIFECYCLE_HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = edge_telemetry.tick() => {
                    if tx.send(self.build_edge_telemetry().await).is_err() { return }
                }
                _ = edge_summary.tick() => {
                    if tx.send(self.build_edge_summary().await).is_err() { return }
                }
                _ = stream_ads.tick() => {
                    for frame in self.build_stream_advertisements(&peer).await {
                        if tx.send(frame).is_err() { return }
                    }
                }
                _ = artifact_ads.tick() => {
                    for frame in self.build_artifact_advertisements().await {
                        if tx.send(frame).is_err() { return }
                    }
                }
                _ = heartbeat.tick() => {
                    if tx.send(self.build_peer_heartbeat().await).is_err() { return }
                }
                _ = lifecycle.tick() => {
                    for frame in self.build_stream_lifecycle_events().await {
                        if tx.send(frame).is_err() { return }
                    }
                }
            }
        }
    }

    async fn build_edge_telemetry(&self) -> PeerFrame {
        let mut edges = Vec::new();
        for node in self.0.state.all_nodes().await {
            let current_viewers = self.0.state.viewer_count_for_node(&node.id).await;
            edges.push(RemoteEdgeRecord {
                node: node.id.clone(),
                base_url: node.base_url.clone(),
                geo: node.geo,
                cpu_score: node.cpu_score,
                ram_score: node.ram_score,
                bw_headroom_bps: node.bandwidth_limit_bps as i64 - node.current_bw_bps as i64,
                current_viewers,
                observed_at: chrono::Utc::now(),
            });
        }
        PeerFrame::EdgeTelemetry { edges }
    }

    async fn build_edge_summary(&self) -> PeerFrame {
        let nodes = self.0.state.all_nodes().await;
        let edge_count = nodes.len() as u32;
        let (cpu_sum, ram_sum, bw_sum) = nodes.iter().fold((0i64, 0i64, 0i64), |(c, r, b), n| {
            (
                c + n.cpu_score,
                r + n.ram_score,
                b + (n.bandwidth_limit_bps as i64 - n.current_bw_bps as i64),
            )
        });
        let divisor = edge_count.max(1) as i64;
        PeerFrame::ClusterEdgeSummary {
            summary: EdgeSummaryRecord {
                peer: self.0.local_cluster.clone(),
                avg_cpu_score: cpu_sum / divisor,
                avg_ram_score: ram_sum / divisor,
                avg_bw_headroom_bps: bw_sum / divisor,
                edge_count,
                smoothed_at: chrono::Utc::now(),
            },
        }
    }

    async fn build_stream_advertisements(&self, peer: &ClusterId) -> Vec<PeerFrame> {
        let streams = self.0.state.all_streams().await;
        let mut frames = Vec::new();
        for stream_state in streams {
            if stream_state.origin_cluster != self.0.local_cluster {
                continue;
            }
            let ctx = RequestContext {
                stream: Some(stream_state.stream.clone()),
                tenant: Some(stream_state.tenant.clone()),
                viewer_geo: None,
                is_source_selection: false,
                local_cluster: self.0.local_cluster.clone(),
            };
            let instances = self.0.state.get_stream_instances(&stream_state.stream).await;
            let mut scored: Vec<ScoredCandidate> = Vec::new();
            for node in self.0.state.all_nodes().await {
                if !balancer::eligibility(&node, &instances, Some(&stream_state.tenant), &ctx).is_empty() {
                    continue;
                }
                let instance = instances.iter().find(|i| i.node == node.id);
                let score = balancer::score(&node, instance, false, &ctx, &self.0.weights);
                scored.push(ScoredCandidate {
                    node: node.id.clone(),
                    base_url: node.base_url.clone(),
                    geo: node.geo,
                    bw_headroom_bps: node.bandwidth_limit_bps as i64 - node.current_bw_bps as i64,
                    score,
                    is_origin: instance.map(|i| i.is_origin()).unwrap_or(false),
                });
            }
            let edges = balancer::top_n_with_scores(scored, 10);
            let _ = peer;
            frames.push(PeerFrame::StreamAdvertisement {
                stream: stream_state.stream.clone(),
                edges,
                playback_id: None,
                origin_cluster: self.0.local_cluster.clone(),
            });
        }
        frames
    }

    async fn build_artifact_advertisements(&self) -> Vec<PeerFrame> {
        self.0
            .state
            .all_nodes()
            .await
            .into_iter()
            .flat_map(|n| n.artifacts.into_iter().map(move |h| (n.id.clone(), h)))
            .take(MAX_ARTIFACT_ADS_PER_TICK)
            .map(|(node, hash)| PeerFrame::ArtifactAdvertisement {
                hash: hash.to_string(),
                node_hint: node.to_string(),
            })
            .collect()
    }

    async fn build_peer_heartbeat(&self) -> PeerFrame {
        let nodes = self.0.state.all_nodes().await;
        let streams = self.0.state.all_streams().await;
        let aggregate_bw_bps = nodes.iter().map(|n| n.current_bw_bps).sum();
        let geo = nodes.iter().find_map(|n| n.geo);
        PeerFrame::PeerHeartbeat {
            heartbeat: PeerHeartbeatRecord {
                protocol_version: PROTOCOL_VERSION,
                capabilities: default_capabilities(),
                stream_count: streams.len() as u64,
                aggregate_bw_bps,
                edge_count: nodes.len() as u32,
                geo,
                received_at: chrono::Utc::now(),
            },
        }
    }

    async fn build_stream_lifecycle_events(&self) -> Vec<PeerFrame> {
        self.0
            .state
            .all_streams()
            .await
            .into_iter()
            .filter(|s| s.origin_cluster == self.0.local_cluster)
            .map(|s| PeerFrame::StreamLifecycleEvent { stream: s.stream, online: s.online })
            .collect()
    }

    /// Shared by both the dialing side's read loop and the accepting side's
    /// `on_frame` callback: fold one received frame into local bookkeeping.
    async fn handle_inbound_frame(&self, peer: ClusterId, frame: PeerFrame) {
        match frame {
            PeerFrame::Hello { protocol_version, capabilities, .. } => {
                info!(%peer, protocol_version, ?capabilities, "peer hello");
            }
            PeerFrame::Goodbye { reason } => {
                info!(%peer, reason, "peer said goodbye");
            }
            PeerFrame::EdgeTelemetry { edges } => {
                for edge in edges {
                    if let Err(e) = self.0.fed_cache.put_remote_edge(&peer, &edge).await {
                        warn!(%peer, error = %e, "failed to store remote edge telemetry");
                    }
                }
            }
            PeerFrame::ReplicationEvent { stream, available, dtsc_url } => {
                debug!(%peer, %stream, available, ?dtsc_url, "replication event");
            }
            PeerFrame::ClusterEdgeSummary { summary } => {
                if let Err(e) = self.0.fed_cache.put_edge_summary(&peer, &summary).await {
                    warn!(%peer, error = %e, "failed to store edge summary");
                }
            }
            PeerFrame::StreamLifecycleEvent { stream, online } => {
                debug!(%peer, %stream, online, "stream lifecycle event");
            }
            PeerFrame::StreamAdvertisement { stream, edges, playback_id, origin_cluster } => {
                let record = StreamAdRecord { peer: peer.clone(), stream, edges, playback_id, origin_cluster };
                if let Err(e) = self.0.fed_cache.put_stream_ad(&record).await {
                    warn!(%peer, error = %e, "failed to store stream advertisement");
                }
            }
            PeerFrame::ArtifactAdvertisement { hash, node_hint: _ } => {
                self.0.artifact_index.insert(ArtifactHash::new(hash), peer);
            }
            PeerFrame::PeerHeartbeat { heartbeat } => {
                if let Err(e) = self.0.fed_cache.put_peer_heartbeat(&peer, &heartbeat).await {
                    warn!(%peer, error = %e, "failed to store peer heartbeat");
                }
            }
            PeerFrame::CapacitySummary { aggregate_bw_bps } => {
                self.0.remote_capacity.insert(peer, aggregate_bw_bps);
            }
        }
    }

    /// Graceful shutdown (SPEC_FULL.md §C.2): say `Goodbye` to every
    /// connected peer before the process exits.
    pub async fn broadcast_goodbye(&self, reason: &str) {
        for peer in self.0.fed_client.known_peers() {
            let _ = self.0.fed_client.send_frame(
                &peer,
                PeerFrame::Goodbye { reason: reason.to_string() },
            );
        }
    }
}

fn default_capabilities() -> Vec<String> {
    vec!["edge_telemetry".to_string(), "artifact_advertisement".to_string()]
}

#[async_trait]
impl InboundFrameSink for PeerManager {
    async fn on_connect(&self, peer: ClusterId, outbound: mpsc::UnboundedSender<PeerFrame>) {
        self.0.fed_client.set_outbound(peer.clone(), outbound.clone());
        let hello = PeerFrame::Hello {
            protocol_version: PROTOCOL_VERSION,
            cluster_id: self.0.local_cluster.clone(),
            capabilities: default_capabilities(),
        };
        let _ = outbound.send(hello);

        let cadence_self = self.clone();
        let cadence_peer = peer;
        let cadence_tx = outbound;
        tokio::spawn(async move { cadence_self.run_cadences(cadence_peer, cadence_tx).await });
    }

    async fn on_frame(&self, peer: ClusterId, frame: PeerFrame) {
        self.handle_inbound_frame(peer, frame).await;
    }

    async fn on_disconnect(&self, peer: ClusterId) {
        self.0.fed_client.clear_outbound(&peer);
    }
}

impl ArtifactAdIndex for PeerManager {
    fn peer_for_hash(&self, hash: &ArtifactHash) -> Option<ClusterId> {
        self.0.artifact_index.get(hash).map(|e| e.clone())
    }

    fn known_peers(&self) -> Vec<ClusterId> {
        self.0.fed_client.known_peers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::registry_client::FakeRegistry;
    use crate::types::NodeId;

    fn manager() -> PeerManager {
        let config = Config::default();
        let kv: Arc<dyn SharedKV> = Arc::new(MemoryKv::new());
        let fed_cache = Arc::new(FederationCache::new(config.cluster_id.clone(), kv.clone()));
        let fed_client = Arc::new(FederationClient::new(config.cluster_id.clone(), ""));
        let state = Arc::new(StateStore::new(
            config.cluster_id.clone(),
            InstanceId::new(config.instance_id.clone()),
            kv.clone(),
            config.weights,
        ));
        let registry = Arc::new(FakeRegistry::default());
        PeerManager::new(&config, kv, fed_cache, fed_client, state, registry)
    }

    #[tokio::test]
    async fn note_peer_registers_with_federation_client() {
        let pm = manager();
        pm.note_peer(&PeerDescriptor {
            cluster_id: ClusterId::new("b"),
            federation_address: "http://b.example".to_string(),
            shared_tenants: vec![],
        });
        assert!(pm.0.fed_client.known_peers().contains(&ClusterId::new("b")));
    }

    #[tokio::test]
    async fn reconcile_drops_peer_after_two_consecutive_misses() {
        let pm = manager();
        pm.note_peer(&PeerDescriptor {
            cluster_id: ClusterId::new("ghost"),
            federation_address: "http://ghost.example".to_string(),
            shared_tenants: vec![],
        });

        pm.reconcile().await.unwrap();
        assert!(pm.0.peers.contains_key(&ClusterId::new("ghost")));

        pm.reconcile().await.unwrap();
        assert!(!pm.0.peers.contains_key(&ClusterId::new("ghost")));
    }

    #[tokio::test]
    async fn artifact_ad_index_reflects_received_advertisements() {
        let pm = manager();
        pm.handle_inbound_frame(
            ClusterId::new("b"),
            PeerFrame::ArtifactAdvertisement { hash: "clip-1".to_string(), node_hint: "edge-b1".to_string() },
        )
        .await;
        assert_eq!(pm.peer_for_hash(&ArtifactHash::new("clip-1")), Some(ClusterId::new("b")));
    }

    #[tokio::test]
    async fn leader_election_round_trips_through_shared_kv() {
        let pm = manager();
        let lease_key = pm.0.fed_cache.leader_lease_key();
        assert!(pm.try_acquire_or_renew(&lease_key).await);
        assert!(pm.try_acquire_or_renew(&lease_key).await, "same instance should renew its own lease");
    }

    #[tokio::test]
    async fn edge_telemetry_reflects_current_node_state() {
        let pm = manager();
        pm.0.state
            .update_node_state(NodeId::new("edge-1"), |n| {
                n.cpu_pct_x10 = 200;
                n.online = true;
            })
            .await
            .unwrap();
        match pm.build_edge_telemetry().await {
            PeerFrame::EdgeTelemetry { edges } => {
                assert_eq!(edges.len(), 1);
                assert_eq!(edges[0].node, NodeId::new("edge-1"));
            }
            other => panic!("expected edge telemetry, got {other:?}"),
        }
    }
}

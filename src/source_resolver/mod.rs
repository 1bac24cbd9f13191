//! `SourceResolver` — answers "where should this node pull stream X from?"
//! (§4.5): local origin lookup, then cross-cluster federation query, then a
//! fallback telling the media server to use its own configured default.
//!
//! Grounded on `clustering::coordinator`'s request-routing shape (resolve
//! locally, else ask elsewhere, else fall back).

use crate::balancer::{self, RequestContext, ScoredCandidate};
use crate::config::{BalancerWeights, Config};
use crate::error::Result;
use crate::registry_client::Registry;
use crate::state::StateStore;
use crate::types::{ClusterId, GeoPoint, StreamName, TenantId};
use async_trait::async_trait;
use std::sync::Arc;

pub const DTSC_PORT: u16 = 4200;
pub const FALLBACK_URL: &str = "dtsc://localhost:4200";

/// What `SourceResolver` needs from the federation layer to ask a peer
/// cluster for scored candidates. Kept as a trait (rather than a direct
/// dependency on `federation::Client`) so unit tests can fake the network.
#[async_trait]
pub trait PeerQuery: Send + Sync {
    async fn query_stream(
        &self,
        peer: &ClusterId,
        stream: &StreamName,
        tenant: &TenantId,
        is_source_selection: bool,
    ) -> Result<Vec<ScoredCandidate>>;
}

pub struct SourceResolver {
    local_cluster: ClusterId,
    state: Arc<StateStore>,
    registry: Arc<dyn Registry>,
    peer_query: Arc<dyn PeerQuery>,
    weights: BalancerWeights,
    federation_base_url: String,
}

impl SourceResolver {
    pub fn new(
        config: &Config,
        state: Arc<StateStore>,
        registry: Arc<dyn Registry>,
        peer_query: Arc<dyn PeerQuery>,
    ) -> Self {
        Self {
            local_cluster: config.cluster_id.clone(),
            state,
            registry,
            peer_query,
            weights: config.weights,
            federation_base_url: config.federation_base_url.clone(),
        }
    }

    fn dtsc_url(&self, host: &str, stream: &StreamName) -> String {
        format!("dtsc://{host}:{}/{}", DTSC_PORT, stream)
    }

    /// `<node_id>.<cluster_id>.<federation_base_url>` is the convention
    /// node hostnames are addressed by across the federation (mirroring
    /// the `foghorn.{cluster_slug}.{base_url}` convention used for the
    /// federation listener itself, §6).
    fn node_host(&self, node_id: &str, cluster: &ClusterId) -> String {
        format!("{node_id}.{cluster}.{}", self.federation_base_url)
    }

    /// `STREAM_SOURCE` trigger handler (§4.5, §6). Must answer
    /// synchronously within the media server's ~10s budget; every branch
    /// here only touches in-memory state or one bounded peer RPC.
    pub async fn handle_get_source(
        &self,
        stream: &StreamName,
        tenant: &TenantId,
    ) -> Result<String> {
        if let Some(url) = self.local_origin(stream).await {
            return Ok(url);
        }
        if let Some(url) = self.cross_cluster_origin(stream, tenant).await? {
            return Ok(url);
        }
        Ok(FALLBACK_URL.to_string())
    }

    async fn local_origin(&self, stream: &StreamName) -> Option<String> {
        let instances = self.state.get_stream_instances(stream).await;
        let origin = instances.iter().find(|i| i.is_origin())?;
        let host = self.node_host(origin.node.as_str(), &self.local_cluster);
        Some(self.dtsc_url(&host, stream))
    }

    async fn cross_cluster_origin(
        &self,
        stream: &StreamName,
        tenant: &TenantId,
    ) -> Result<Option<String>> {
        let Some((origin_cluster, candidate)) = self.remote_origin_candidate(stream, tenant).await? else {
            return Ok(None);
        };
        let host = self.node_host(candidate.node.as_str(), &origin_cluster);
        Ok(Some(self.dtsc_url(&host, stream)))
    }

    /// The best remote origin for `stream`, if this stream is known to
    /// originate on another cluster and that cluster answers with at least
    /// one origin candidate. Exposed so callers that need the raw
    /// `(ClusterId, ScoredCandidate)` pair — `OriginPullArranger::arrange`'s
    /// redirect-vs-pull decision, rather than a bare DTSC URL — don't have
    /// to re-query the peer themselves.
    pub async fn remote_origin_candidate(
        &self,
        stream: &StreamName,
        tenant: &TenantId,
    ) -> Result<Option<(ClusterId, ScoredCandidate)>> {
        let stream_state = self.state.get_stream(stream).await;
        let origin_cluster = match stream_state {
            Some(s) if s.origin_cluster != self.local_cluster => s.origin_cluster,
            _ => return Ok(None),
        };

        let candidates = self
            .peer_query
            .query_stream(&origin_cluster, stream, tenant, true)
            .await?;
        let best = candidates
            .into_iter()
            .filter(|c| c.is_origin)
            .max_by(|a, b| a.score.cmp(&b.score).then_with(|| b.node.0.cmp(&a.node.0)));
        Ok(best.map(|c| (origin_cluster, c)))
    }

    /// Viewer routing (`is_source_selection=false`): rank every local node
    /// that passes eligibility, not just origins, and return the top `n`.
    pub async fn rank_local_candidates(
        &self,
        stream: Option<&StreamName>,
        tenant: Option<&TenantId>,
        viewer_geo: Option<GeoPoint>,
        n: usize,
    ) -> Vec<ScoredCandidate> {
        let ctx = RequestContext {
            stream: stream.cloned(),
            tenant: tenant.cloned(),
            viewer_geo,
            is_source_selection: false,
            local_cluster: self.local_cluster.clone(),
        };

        let (instances, stream_tenant) = match stream {
            Some(s) => (
                self.state.get_stream_instances(s).await,
                self.state.get_stream(s).await.map(|s| s.tenant),
            ),
            None => (Vec::new(), None),
        };

        let mut scored = Vec::new();
        for node in self.state.all_nodes().await {
            let rejections = balancer::eligibility(&node, &instances, stream_tenant.as_ref(), &ctx);
            if !rejections.is_empty() {
                continue;
            }
            let instance = instances.iter().find(|i| i.node == node.id);
            let s = balancer::score(&node, instance, false, &ctx, &self.weights);
            scored.push(ScoredCandidate {
                node: node.id.clone(),
                base_url: node.base_url.clone(),
                geo: node.geo,
                bw_headroom_bps: node.bandwidth_limit_bps as i64 - node.current_bw_bps as i64,
                score: s,
                is_origin: instance.map(|i| i.is_origin()).unwrap_or(false),
            });
        }
        balancer::top_n_with_scores(scored, n)
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::registry_client::FakeRegistry;
    use crate::state::StreamInstanceStatus;
    use crate::types::{InstanceId, NodeId};

    struct NoPeers;
    #[async_trait]
    impl PeerQuery for NoPeers {
        async fn query_stream(
            &self,
            _peer: &ClusterId,
            _stream: &StreamName,
            _tenant: &TenantId,
            _is_source_selection: bool,
        ) -> Result<Vec<ScoredCandidate>> {
            Ok(vec![])
        }
    }

    struct OnePeer(ScoredCandidate);
    #[async_trait]
    impl PeerQuery for OnePeer {
        async fn query_stream(
            &self,
            _peer: &ClusterId,
            _stream: &StreamName,
            _tenant: &TenantId,
            _is_source_selection: bool,
        ) -> Result<Vec<ScoredCandidate>> {
            Ok(vec![self.0.clone()])
        }
    }

    fn resolver(peer_query: Arc<dyn PeerQuery>) -> (SourceResolver, Arc<StateStore>) {
        let config = Config::default();
        let kv = Arc::new(MemoryKv::new());
        let state = Arc::new(StateStore::new(
            config.cluster_id.clone(),
            InstanceId::new("i1"),
            kv,
            config.weights,
        ));
        let registry = Arc::new(FakeRegistry::default());
        (
            SourceResolver::new(&config, state.clone(), registry, peer_query),
            state,
        )
    }

    #[tokio::test]
    async fn local_source_selection_picks_origin_not_replica() {
        let (resolver, state) = resolver(Arc::new(NoPeers));
        let stream = StreamName::new("live+demo");
        state
            .update_node_state(NodeId::new("edge-1"), |n| n.base_url = "edge-1.local".into())
            .await
            .unwrap();
        state
            .update_node_state(NodeId::new("edge-2"), |n| n.base_url = "edge-2.local".into())
            .await
            .unwrap();
        state
            .update_stream_instance(stream.clone(), NodeId::new("edge-1"), |i| {
                i.inputs = 1;
                i.replicated = false;
                i.status = StreamInstanceStatus::Live;
            })
            .await
            .unwrap();
        state
            .update_stream_instance(stream.clone(), NodeId::new("edge-2"), |i| {
                i.inputs = 0;
                i.replicated = true;
                i.status = StreamInstanceStatus::Live;
            })
            .await
            .unwrap();

        let url = resolver
            .handle_get_source(&stream, &TenantId::new("t1"))
            .await
            .unwrap();
        assert_eq!(url, "dtsc://edge-1.default.foghorn.local:4200/live+demo");
    }

    #[tokio::test]
    async fn cross_cluster_source_selection_uses_remote_origin() {
        let remote = ScoredCandidate {
            node: NodeId::new("edge-b7"),
            base_url: "edge-b7.cluster-b".to_string(),
            geo: None,
            bw_headroom_bps: 0,
            score: 1800,
            is_origin: true,
        };
        let (resolver, state) = resolver(Arc::new(OnePeer(remote)));
        let stream = StreamName::new("live+remote-demo");
        state
            .update_stream_state(stream.clone(), |s| {
                s.origin_cluster = ClusterId::new("cluster-b");
                s.tenant = TenantId::new("t1");
            })
            .await
            .unwrap();

        let url = resolver
            .handle_get_source(&stream, &TenantId::new("t1"))
            .await
            .unwrap();
        assert_eq!(url, "dtsc://edge-b7.cluster-b.foghorn.local:4200/live+remote-demo");
    }

    #[tokio::test]
    async fn falls_back_to_localhost_when_nothing_found() {
        let (resolver, _state) = resolver(Arc::new(NoPeers));
        let url = resolver
            .handle_get_source(&StreamName::new("live+nope"), &TenantId::new("t1"))
            .await
            .unwrap();
        assert_eq!(url, FALLBACK_URL);
    }
}

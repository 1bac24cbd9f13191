// Source resolution integration tests: local origin selection and
// cross-cluster origin selection via a federated peer query.

use async_trait::async_trait;
use foghorn::balancer::ScoredCandidate;
use foghorn::config::Config;
use foghorn::error::Result;
use foghorn::kv::memory::MemoryKv;
use foghorn::registry_client::FakeRegistry;
use foghorn::source_resolver::{PeerQuery, SourceResolver};
use foghorn::state::{StateStore, StreamInstanceStatus};
use foghorn::types::{ClusterId, InstanceId, NodeId, StreamName, TenantId};
use std::sync::Arc;

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

struct SinglePeerCandidate(ScoredCandidate);

#[async_trait]
impl PeerQuery for SinglePeerCandidate {
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
    (SourceResolver::new(&config, state.clone(), registry, peer_query), state)
}

#[tokio::test]
async fn local_source_selection_picks_the_origin_not_the_replica() {
    let (resolver, state) = resolver(Arc::new(NoPeers));
    let stream = StreamName::new("live+demo");

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

    let url = resolver.handle_get_source(&stream, &TenantId::new("t1")).await.unwrap();
    assert_eq!(url, "dtsc://edge-1.default.foghorn.local:4200/live+demo");
}

#[tokio::test]
async fn cross_cluster_source_selection_resolves_the_remote_origin() {
    let remote = ScoredCandidate {
        node: NodeId::new("edge-b7"),
        base_url: "edge-b7.cluster-b".to_string(),
        geo: None,
        bw_headroom_bps: 0,
        score: 1800,
        is_origin: true,
    };
    let (resolver, state) = resolver(Arc::new(SinglePeerCandidate(remote)));
    let stream = StreamName::new("live+remote-demo");

    state
        .update_stream_state(stream.clone(), |s| {
            s.origin_cluster = ClusterId::new("cluster-b");
            s.tenant = TenantId::new("t1");
        })
        .await
        .unwrap();

    let url = resolver.handle_get_source(&stream, &TenantId::new("t1")).await.unwrap();
    assert_eq!(url, "dtsc://edge-b7.cluster-b.foghorn.local:4200/live+remote-demo");
}

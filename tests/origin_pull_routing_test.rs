// Origin-pull arrangement integration tests: standing up a local replica
// under sufficient viewer demand, and refusing to create a pull that would
// form a replication loop with a peer already pulling from us.

use async_trait::async_trait;
use foghorn::config::BalancerWeights;
use foghorn::error::Result;
use foghorn::federation::messages::NotifyOriginPullResponse;
use foghorn::federation_cache::{FederationCache, RemoteReplicationEntry};
use foghorn::kv::memory::MemoryKv;
use foghorn::origin_pull::{OriginPullArranger, OriginPullClient, PullDecision};
use foghorn::state::StateStore;
use foghorn::types::{ClusterId, InstanceId, NodeId, StreamName, TenantId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct FakeOriginCluster {
    accepted: AtomicBool,
    dtsc_url: String,
}

#[async_trait]
impl OriginPullClient for FakeOriginCluster {
    async fn notify_origin_pull(
        &self,
        _peer: &ClusterId,
        _stream: &StreamName,
        _source_node: &str,
        _dest_node: &str,
    ) -> Result<NotifyOriginPullResponse> {
        Ok(NotifyOriginPullResponse {
            dtsc_url: self.dtsc_url.clone(),
            accepted: self.accepted.load(Ordering::SeqCst),
        })
    }
}

fn harness(client: Arc<dyn OriginPullClient>) -> (OriginPullArranger, Arc<StateStore>, Arc<FederationCache>) {
    let local_cluster = ClusterId::new("cluster-a");
    let kv = Arc::new(MemoryKv::new());
    let state = Arc::new(StateStore::new(
        local_cluster.clone(),
        InstanceId::new("i1"),
        kv.clone(),
        BalancerWeights::default(),
    ));
    let fed_cache = Arc::new(FederationCache::new(local_cluster.clone(), kv));
    let arranger = OriginPullArranger::new(
        local_cluster,
        state.clone(),
        fed_cache.clone(),
        client,
        BalancerWeights::default(),
    );
    (arranger, state, fed_cache)
}

#[tokio::test]
async fn sufficient_viewer_demand_establishes_a_local_pull_replica() {
    let client = Arc::new(FakeOriginCluster {
        accepted: AtomicBool::new(true),
        dtsc_url: "dtsc://edge-b7.cluster-b/live+x".to_string(),
    });
    let (arranger, state, fed_cache) = harness(client);

    state.update_node_state(NodeId::new("edge-a3"), |n| n.online = true).await.unwrap();

    let decision = arranger
        .arrange(
            &StreamName::new("live+x"),
            &TenantId::new("t1"),
            &ClusterId::new("cluster-b"),
            "edge-b7",
            5,
        )
        .await
        .unwrap();

    let selected = match decision {
        PullDecision::Pull { node, dtsc_url } => {
            assert_eq!(dtsc_url, "dtsc://edge-b7.cluster-b/live+x");
            node
        }
        other => panic!("expected a pull decision, got {other:?}"),
    };
    assert_eq!(selected, NodeId::new("edge-a3"));

    let instances = state.get_stream_instances(&StreamName::new("live+x")).await;
    let replica = instances.iter().find(|i| i.node == selected).unwrap();
    assert!(replica.replicated);

    let bookkeeping = fed_cache
        .remote_replication(&StreamName::new("live+x"), &ClusterId::new("cluster-b"))
        .await
        .unwrap();
    assert!(bookkeeping.is_some());
}

#[tokio::test]
async fn a_peer_already_pulling_from_us_is_refused_a_reverse_pull() {
    let client = Arc::new(FakeOriginCluster {
        accepted: AtomicBool::new(true),
        dtsc_url: "dtsc://should-not-be-used/live+x".to_string(),
    });
    let (arranger, _state, fed_cache) = harness(client);

    // cluster-b is already pulling live+x from us: seed the loop-guard entry
    // exactly as `OriginPullArranger::arrange` would have on cluster-b's side.
    fed_cache
        .put_remote_replication(
            &ClusterId::new("cluster-b"),
            &RemoteReplicationEntry {
                stream: StreamName::new("live+x"),
                puller_cluster: ClusterId::new("cluster-a"),
                dtsc_url: Some("dtsc://edge-a3.cluster-a/live+x".to_string()),
            },
        )
        .await
        .unwrap();

    let decision = arranger
        .arrange(
            &StreamName::new("live+x"),
            &TenantId::new("t1"),
            &ClusterId::new("cluster-b"),
            "edge-b7",
            5,
        )
        .await
        .unwrap();

    assert_eq!(
        decision,
        PullDecision::Redirect { dtsc_url: "dtsc://edge-a3.cluster-a/live+x".to_string() }
    );
}

//! `OriginPullArranger` — decides whether a cross-cluster viewer request
//! should redirect straight to a remote edge or stand up a local replica
//! pulled from the true origin, with loop prevention via
//! `FederationCache::remote_replication` (§4.9).
//!
//! Grounded on `clustering::geo_replication`'s replica-placement shape and
//! `clustering::migration`'s "arrange, then notify" two-phase structure;
//! destination selection reuses `balancer` directly rather than
//! reimplementing scoring.

use crate::balancer::{self, RequestContext, ScoredCandidate};
use crate::config::BalancerWeights;
use crate::error::{FoghornError, Result};
use crate::federation::messages::NotifyOriginPullResponse;
use crate::federation_cache::{FederationCache, RemoteReplicationEntry};
use crate::state::{StateStore, StreamInstanceStatus};
use crate::types::{ClusterId, NodeId, StreamName, TenantId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Below this many local viewers, a direct redirect is cheaper than the
/// bookkeeping and standing bandwidth cost of a replica.
const PULL_THRESHOLD: u64 = 1;

/// What `OriginPullArranger` needs from the federation layer: ask the
/// origin cluster to record a new replica and hand back the dtsc URL to
/// pull from. Kept as a trait so tests can fake the RPC.
#[async_trait]
pub trait OriginPullClient: Send + Sync {
    async fn notify_origin_pull(
        &self,
        peer: &ClusterId,
        stream: &StreamName,
        source_node: &str,
        dest_node: &str,
    ) -> Result<NotifyOriginPullResponse>;
}

/// Outcome of the §4.9 redirect-vs-pull decision.
#[derive(Debug, Clone, PartialEq)]
pub enum PullDecision {
    /// Tell the requester to pull directly from this remote DTSC URL; no
    /// local bookkeeping is created.
    Redirect { dtsc_url: String },
    /// A local node now owns a standing replica pulling from `dtsc_url`;
    /// its `StreamInstanceState` has already been seeded as `replicated`.
    Pull { node: NodeId, dtsc_url: String },
}

pub struct OriginPullArranger {
    local_cluster: ClusterId,
    state: Arc<StateStore>,
    fed_cache: Arc<FederationCache>,
    client: Arc<dyn OriginPullClient>,
    weights: BalancerWeights,
}

impl OriginPullArranger {
    pub fn new(
        local_cluster: ClusterId,
        state: Arc<StateStore>,
        fed_cache: Arc<FederationCache>,
        client: Arc<dyn OriginPullClient>,
        weights: BalancerWeights,
    ) -> Self {
        Self { local_cluster, state, fed_cache, client, weights }
    }

    /// Entry point: this cluster has viewer demand for `stream`, whose true
    /// origin is `origin_cluster` on node `source_node`. Decide whether to
    /// redirect the caller or stand up a local replica.
    pub async fn arrange(
        &self,
        stream: &StreamName,
        tenant: &TenantId,
        origin_cluster: &ClusterId,
        source_node: &str,
        local_viewer_demand: u64,
    ) -> Result<PullDecision> {
        if origin_cluster == &self.local_cluster {
            return Err(FoghornError::conflict("arrange called for a locally-originated stream"));
        }

        // Loop guard (§8): if we are already registered as a puller for
        // this stream from this origin, reuse that pull instead of
        // registering a second one.
        if let Some(existing) = self.fed_cache.remote_replication(stream, origin_cluster).await? {
            if let Some(url) = existing.dtsc_url {
                return Ok(PullDecision::Redirect { dtsc_url: url });
            }
        }

        if local_viewer_demand < PULL_THRESHOLD {
            let dtsc_url = format!("dtsc://{source_node}.{origin_cluster}.pull/{stream}");
            return Ok(PullDecision::Redirect { dtsc_url });
        }

        let dest_node = self.pick_destination_node(stream, tenant).await?;

        let resp = self
            .client
            .notify_origin_pull(origin_cluster, stream, source_node, dest_node.as_str())
            .await?;
        if !resp.accepted {
            return Err(FoghornError::transient(format!(
                "origin {origin_cluster} rejected origin-pull for {stream}"
            )));
        }

        self.state
            .update_stream_instance(stream.clone(), dest_node.clone(), |i| {
                i.inputs = 0;
                i.replicated = true;
                i.status = StreamInstanceStatus::Starting;
            })
            .await?;

        let entry = RemoteReplicationEntry {
            stream: stream.clone(),
            puller_cluster: self.local_cluster.clone(),
            dtsc_url: Some(resp.dtsc_url.clone()),
        };
        self.fed_cache.put_remote_replication(origin_cluster, &entry).await?;

        info!(%stream, node = %dest_node, origin = %origin_cluster, "established origin-pull replica");
        Ok(PullDecision::Pull { node: dest_node, dtsc_url: resp.dtsc_url })
    }

    /// Tear down the local side of a replica once the media server reports
    /// `STREAM_END` for it: the `StreamInstanceState` row is already evicted
    /// by the `triggers` handler, this only drops our loop-prevention
    /// bookkeeping so a later `arrange` call is free to re-establish it.
    pub async fn release(&self, stream: &StreamName, origin_cluster: &ClusterId) -> Result<()> {
        let key_entry = RemoteReplicationEntry {
            stream: stream.clone(),
            puller_cluster: self.local_cluster.clone(),
            dtsc_url: None,
        };
        // Overwrite with a tombstone rather than delete: a concurrent racer
        // that just read the old url would otherwise treat an absent key as
        // "never arranged" and skip the threshold check.
        self.fed_cache.put_remote_replication(origin_cluster, &key_entry).await
    }

    async fn pick_destination_node(&self, stream: &StreamName, tenant: &TenantId) -> Result<NodeId> {
        let ctx = RequestContext {
            stream: None,
            tenant: Some(tenant.clone()),
            viewer_geo: None,
            is_source_selection: false,
            local_cluster: self.local_cluster.clone(),
        };
        let instances = self.state.get_stream_instances(stream).await;
        let mut scored: Vec<ScoredCandidate> = Vec::new();
        for node in self.state.all_nodes().await {
            if !balancer::eligibility(&node, &instances, None, &ctx).is_empty() {
                continue;
            }
            let score = balancer::score(&node, None, false, &ctx, &self.weights);
            scored.push(ScoredCandidate {
                node: node.id.clone(),
                base_url: node.base_url.clone(),
                geo: node.geo,
                bw_headroom_bps: node.bandwidth_limit_bps as i64 - node.current_bw_bps as i64,
                score,
                is_origin: false,
            });
        }
        balancer::top_n_with_scores(scored, 1)
            .into_iter()
            .next()
            .map(|c| c.node)
            .ok_or_else(|| FoghornError::Capacity { rejected_by: vec!["no_eligible_destination".to_string()] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::types::InstanceId;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeClient {
        accepted: AtomicBool,
        url: String,
    }

    #[async_trait]
    impl OriginPullClient for FakeClient {
        async fn notify_origin_pull(
            &self,
            _peer: &ClusterId,
            _stream: &StreamName,
            _source_node: &str,
            _dest_node: &str,
        ) -> Result<NotifyOriginPullResponse> {
            Ok(NotifyOriginPullResponse {
                dtsc_url: self.url.clone(),
                accepted: self.accepted.load(Ordering::SeqCst),
            })
        }
    }

    fn arranger(client: Arc<dyn OriginPullClient>) -> (OriginPullArranger, Arc<StateStore>) {
        let local_cluster = ClusterId::new("c1");
        let kv = Arc::new(MemoryKv::new());
        let state = Arc::new(StateStore::new(
            local_cluster.clone(),
            InstanceId::new("i1"),
            kv.clone(),
            BalancerWeights::default(),
        ));
        let fed_cache = Arc::new(FederationCache::new(local_cluster.clone(), kv));
        (
            OriginPullArranger::new(local_cluster.clone(), state.clone(), fed_cache, client, BalancerWeights::default()),
            state,
        )
    }

    #[tokio::test]
    async fn low_demand_redirects_without_bookkeeping() {
        let (arranger, _state) = arranger(Arc::new(FakeClient {
            accepted: AtomicBool::new(true),
            url: "dtsc://origin/live+x".to_string(),
        }));
        let decision = arranger
            .arrange(
                &StreamName::new("live+x"),
                &TenantId::new("t1"),
                &ClusterId::new("b"),
                "edge-b1",
                0,
            )
            .await
            .unwrap();
        assert!(matches!(decision, PullDecision::Redirect { .. }));
    }

    #[tokio::test]
    async fn sufficient_demand_establishes_pull_on_eligible_node() {
        let (arranger, state) = arranger(Arc::new(FakeClient {
            accepted: AtomicBool::new(true),
            url: "dtsc://origin/live+x".to_string(),
        }));
        state
            .update_node_state(NodeId::new("edge-1"), |n| n.online = true)
            .await
            .unwrap();

        let decision = arranger
            .arrange(
                &StreamName::new("live+x"),
                &TenantId::new("t1"),
                &ClusterId::new("b"),
                "edge-b1",
                5,
            )
            .await
            .unwrap();
        match decision {
            PullDecision::Pull { node, dtsc_url } => {
                assert_eq!(node, NodeId::new("edge-1"));
                assert_eq!(dtsc_url, "dtsc://origin/live+x");
            }
            other => panic!("expected pull, got {other:?}"),
        }

        let instances = state.get_stream_instances(&StreamName::new("live+x")).await;
        let replica = instances.iter().find(|i| i.node == NodeId::new("edge-1")).unwrap();
        assert!(replica.replicated);
    }

    #[tokio::test]
    async fn rejects_arranging_a_locally_originated_stream() {
        let (arranger, _state) = arranger(Arc::new(FakeClient {
            accepted: AtomicBool::new(true),
            url: String::new(),
        }));
        let err = arranger
            .arrange(&StreamName::new("live+x"), &TenantId::new("t1"), &ClusterId::new("c1"), "edge-1", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, FoghornError::Conflict(_)));
    }

    #[tokio::test]
    async fn existing_remote_replication_short_circuits_to_redirect() {
        let (arranger, _state) = arranger(Arc::new(FakeClient {
            accepted: AtomicBool::new(true),
            url: "dtsc://new/live+x".to_string(),
        }));
        arranger
            .fed_cache
            .put_remote_replication(
                &ClusterId::new("b"),
                &RemoteReplicationEntry {
                    stream: StreamName::new("live+x"),
                    puller_cluster: ClusterId::new("c1"),
                    dtsc_url: Some("dtsc://already/live+x".to_string()),
                },
            )
            .await
            .unwrap();

        let decision = arranger
            .arrange(&StreamName::new("live+x"), &TenantId::new("t1"), &ClusterId::new("b"), "edge-b1", 5)
            .await
            .unwrap();
        assert_eq!(decision, PullDecision::Redirect { dtsc_url: "dtsc://already/live+x".to_string() });
    }
}

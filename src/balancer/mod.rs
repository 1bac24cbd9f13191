//! Balancer — pure, stateless scoring over candidate nodes (§4.3).
//!
//! Every function here is a plain computation over borrowed state; nothing
//! touches `SharedKV` or blocks. Grounded on the teacher's
//! `clustering::load_balancer` strategy-selection shape (a request context
//! plus a candidate list reduced to a ranked result), with the strategies
//! themselves replaced by the weighted composite formula this spec defines.

use crate::config::BalancerWeights;
use crate::state::{NodeState, StreamInstanceState};
use crate::types::{ClusterId, GeoPoint, NodeId, StreamName, TenantId};
use serde::{Deserialize, Serialize};

/// Everything a request needs to filter and score a candidate that isn't
/// already captured by the node's own `NodeState`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub stream: Option<StreamName>,
    pub tenant: Option<TenantId>,
    pub viewer_geo: Option<GeoPoint>,
    pub is_source_selection: bool,
    pub local_cluster: ClusterId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub node: NodeId,
    pub base_url: String,
    pub geo: Option<GeoPoint>,
    pub bw_headroom_bps: i64,
    pub score: i64,
    pub is_origin: bool,
}

/// Reasons a candidate failed the eligibility filter, surfaced verbatim in
/// a `Capacity` error so operators can see which filter rejected everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Offline,
    Maintenance,
    BandwidthSaturated,
    StreamNotPresent,
    IsReplicaNotOrigin,
    TenantNotServed,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Offline => "offline",
            Rejection::Maintenance => "maintenance",
            Rejection::BandwidthSaturated => "bandwidth",
            Rejection::StreamNotPresent => "stream_not_present",
            Rejection::IsReplicaNotOrigin => "not_origin",
            Rejection::TenantNotServed => "tenant_not_served",
        }
    }
}

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Normalized great-circle distance in `[0, 1]`: `0.0` is the same point,
/// `1.0` is antipodal.
pub fn haversine_fraction(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().asin();
    let distance_km = EARTH_RADIUS_KM * c;
    let max_distance_km = EARTH_RADIUS_KM * std::f64::consts::PI;
    (distance_km / max_distance_km).clamp(0.0, 1.0)
}

/// Eligibility filter (§4.3): a candidate must pass every check to be
/// scored at all. Returns the list of checks it failed, empty if eligible.
///
/// `stream_tenant` is the tenant that actually owns `ctx.stream` (its
/// `StreamState.tenant`), distinct from `ctx.tenant`, which is the tenant
/// a caller is filtering for: a federation peer's requested tenant, or a
/// viewer's own. Pass `None` when the caller has no stream in scope (e.g.
/// picking a destination node for a not-yet-existing replica).
pub fn eligibility(
    node: &NodeState,
    instances: &[StreamInstanceState],
    stream_tenant: Option<&TenantId>,
    ctx: &RequestContext,
) -> Vec<Rejection> {
    let mut rejections = Vec::new();

    if !node.online {
        rejections.push(Rejection::Offline);
    }
    if node.maintenance {
        rejections.push(Rejection::Maintenance);
    }
    if node.bandwidth_limit_bps > 0 && node.current_bw_bps >= node.bandwidth_limit_bps {
        rejections.push(Rejection::BandwidthSaturated);
    }

    if ctx.stream.is_some() {
        match instances.iter().find(|i| i.node == node.id) {
            None => rejections.push(Rejection::StreamNotPresent),
            Some(instance) => {
                if ctx.is_source_selection && instance.replicated {
                    rejections.push(Rejection::IsReplicaNotOrigin);
                }
                if let (Some(requested), Some(owner)) = (ctx.tenant.as_ref(), stream_tenant) {
                    if requested != owner {
                        rejections.push(Rejection::TenantNotServed);
                    }
                }
            }
        }
    }

    rejections
}

/// Composite score for one eligible node (§4.3 formula). Callers must have
/// already run `eligibility` and skip scoring any node with rejections.
/// `cpu_score`/`ram_score` are read from `node` rather than re-derived from
/// `cpu_pct_x10`/`ram_used` here: `NodeState::recompute_scores` is the one
/// place that formula lives, so a remote peer's telemetry-derived score and
/// this cluster's own scoring pass can never disagree on it.
pub fn score(
    node: &NodeState,
    instance: Option<&StreamInstanceState>,
    is_remote: bool,
    ctx: &RequestContext,
    weights: &BalancerWeights,
) -> i64 {
    let cpu_score = node.cpu_score;
    let ram_score = node.ram_score;

    let bw_score = if node.bandwidth_limit_bps == 0 {
        0
    } else {
        weights.bandwidth_weight
            - (node.current_bw_bps as i64 * weights.bandwidth_weight
                / node.bandwidth_limit_bps as i64)
    };

    let geo_score = match (ctx.viewer_geo, node.geo) {
        (Some(viewer), Some(node_geo)) => {
            let fraction = haversine_fraction(viewer, node_geo);
            weights.geo_weight - (weights.geo_weight as f64 * fraction) as i64
        }
        _ => 0,
    };

    let stream_bonus = if instance.is_some() {
        weights.stream_bonus
    } else {
        0
    };

    let cross_cluster_penalty = if is_remote {
        weights.cross_cluster_penalty
    } else {
        0
    };

    cpu_score + ram_score + bw_score + geo_score + stream_bonus - cross_cluster_penalty
}

/// Rank candidates, breaking ties deterministically by `(-score, NodeId)`
/// ascending (§4.3), and return the top `n`.
pub fn top_n_with_scores(mut candidates: Vec<ScoredCandidate>, n: usize) -> Vec<ScoredCandidate> {
    candidates.sort_by(|a, b| (-a.score, &a.node.0).cmp(&(-b.score, &b.node.0)));
    candidates.truncate(n);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StreamInstanceStatus;

    fn node(id: &str, cpu_x10: u32) -> NodeState {
        let mut n = NodeState::new(NodeId::new(id), format!("http://{id}"));
        n.cpu_pct_x10 = cpu_x10;
        n.online = true;
        n.recompute_scores(&BalancerWeights::default());
        n
    }

    fn ctx() -> RequestContext {
        RequestContext {
            stream: None,
            tenant: None,
            viewer_geo: None,
            is_source_selection: false,
            local_cluster: ClusterId::new("c1"),
        }
    }

    #[test]
    fn score_monotonic_in_cpu() {
        let weights = BalancerWeights::default();
        let a = node("a", 100); // lower cpu
        let b = node("b", 500);
        let score_a = score(&a, None, false, &ctx(), &weights);
        let score_b = score(&b, None, false, &ctx(), &weights);
        assert!(score_a > score_b, "{score_a} should exceed {score_b}");
    }

    #[test]
    fn eligibility_rejects_offline_and_maintenance() {
        let mut n = node("a", 0);
        n.online = false;
        n.maintenance = true;
        let rejections = eligibility(&n, &[], None, &ctx());
        assert!(rejections.contains(&Rejection::Offline));
        assert!(rejections.contains(&Rejection::Maintenance));
    }

    #[test]
    fn eligibility_rejects_saturated_bandwidth() {
        let mut n = node("a", 0);
        n.bandwidth_limit_bps = 1000;
        n.current_bw_bps = 1000;
        let rejections = eligibility(&n, &[], None, &ctx());
        assert_eq!(rejections, vec![Rejection::BandwidthSaturated]);
    }

    #[test]
    fn source_selection_rejects_replica_instance() {
        let n = node("edge-2", 0);
        let mut c = ctx();
        c.stream = Some(StreamName::new("demo"));
        c.is_source_selection = true;
        let instance = StreamInstanceState {
            stream: StreamName::new("demo"),
            node: NodeId::new("edge-2"),
            inputs: 0,
            replicated: true,
            current_viewers: 0,
            status: StreamInstanceStatus::Live,
            buffer_state: None,
            tracks: vec![],
            updated_at: chrono::Utc::now(),
        };
        let rejections = eligibility(&n, &[instance], None, &c);
        assert_eq!(rejections, vec![Rejection::IsReplicaNotOrigin]);
    }

    #[test]
    fn eligibility_rejects_candidate_not_serving_requested_tenant() {
        let n = node("edge-3", 0);
        let mut c = ctx();
        c.stream = Some(StreamName::new("demo"));
        c.tenant = Some(TenantId::new("tenant-a"));
        let instance = StreamInstanceState {
            stream: StreamName::new("demo"),
            node: NodeId::new("edge-3"),
            inputs: 1,
            replicated: false,
            current_viewers: 0,
            status: StreamInstanceStatus::Live,
            buffer_state: None,
            tracks: vec![],
            updated_at: chrono::Utc::now(),
        };
        let owner = TenantId::new("tenant-b");
        let rejections = eligibility(&n, &[instance], Some(&owner), &c);
        assert_eq!(rejections, vec![Rejection::TenantNotServed]);
    }

    #[test]
    fn eligibility_admits_candidate_serving_requested_tenant() {
        let n = node("edge-4", 0);
        let mut c = ctx();
        c.stream = Some(StreamName::new("demo"));
        c.tenant = Some(TenantId::new("tenant-a"));
        let instance = StreamInstanceState {
            stream: StreamName::new("demo"),
            node: NodeId::new("edge-4"),
            inputs: 1,
            replicated: false,
            current_viewers: 0,
            status: StreamInstanceStatus::Live,
            buffer_state: None,
            tracks: vec![],
            updated_at: chrono::Utc::now(),
        };
        let owner = TenantId::new("tenant-a");
        let rejections = eligibility(&n, &[instance], Some(&owner), &c);
        assert!(rejections.is_empty());
    }

    #[test]
    fn tie_break_is_deterministic_by_node_id() {
        let candidates = vec![
            ScoredCandidate {
                node: NodeId::new("zz"),
                base_url: String::new(),
                geo: None,
                bw_headroom_bps: 0,
                score: 100,
                is_origin: false,
            },
            ScoredCandidate {
                node: NodeId::new("aa"),
                base_url: String::new(),
                geo: None,
                bw_headroom_bps: 0,
                score: 100,
                is_origin: false,
            },
        ];
        let ranked = top_n_with_scores(candidates, 2);
        assert_eq!(ranked[0].node, NodeId::new("aa"));
    }

    #[test]
    fn haversine_fraction_zero_for_same_point() {
        let p = GeoPoint::new(40.0, -74.0);
        assert!(haversine_fraction(p, p) < 1e-9);
    }

    #[test]
    fn haversine_fraction_near_one_for_antipodal_points() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 180.0);
        assert!(haversine_fraction(a, b) > 0.99);
    }

    #[test]
    fn cross_cluster_penalty_reduces_remote_score() {
        let weights = BalancerWeights::default();
        let n = node("a", 0);
        let local_score = score(&n, None, false, &ctx(), &weights);
        let remote_score = score(&n, None, true, &ctx(), &weights);
        assert_eq!(local_score - remote_score, weights.cross_cluster_penalty);
    }
}

//! Federation Server: the inbound half of the peer protocol (§4.7, §4.8).
//! Exposes the six unary RPCs as JSON-over-HTTP handlers and the
//! `PeerChannel` multiplexed websocket everything else rides on.
//!
//! Grounded on `api::rest::server`'s `Router` assembly (merge sub-routers,
//! layer CORS/trace/timeout, inject one shared `Arc<State>`) and
//! `websocket::connection`'s accept-loop shape for the upgrade handler.

use crate::artifact_access::{ArtifactAccess, ArtifactCommand as AccessCommand};
use crate::balancer::{self, RequestContext, ScoredCandidate};
use crate::config::{BalancerWeights, Config};
use crate::federation::messages::{
    ArtifactCommand, ArtifactKind, ArtifactSummary, ForwardArtifactCommandRequest,
    ForwardArtifactCommandResponse, ListTenantArtifactsResponse, MigrateArtifactMetadataRequest,
    MigrateArtifactMetadataResponse, NotifyOriginPullRequest, NotifyOriginPullResponse, PeerFrame,
    PrepareArtifactRequest, PrepareArtifactResponse, QueryStreamRequest, QueryStreamResponse,
};
use crate::federation_cache::{ActiveReplicationRecord, FederationCache};
use crate::state::{ArtifactType, StateStore};
use crate::types::{ArtifactHash, ClusterId, StreamName, TenantId};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// What the server needs to do with a frame that arrives on an inbound
/// `PeerChannel` connection, and how to learn about the channel closing.
/// `PeerManager` is the real implementation; tests use a recording fake.
#[async_trait]
pub trait InboundFrameSink: Send + Sync {
    async fn on_connect(&self, peer: ClusterId, outbound: mpsc::UnboundedSender<PeerFrame>);
    async fn on_frame(&self, peer: ClusterId, frame: PeerFrame);
    async fn on_disconnect(&self, peer: ClusterId);
}

#[derive(Clone)]
pub struct FederationState {
    pub cluster_id: ClusterId,
    pub service_token: String,
    pub state: Arc<StateStore>,
    pub fed_cache: Arc<FederationCache>,
    pub weights: BalancerWeights,
    pub artifacts: Arc<ArtifactAccess>,
    pub inbound: Arc<dyn InboundFrameSink>,
}

impl FederationState {
    pub fn new(
        config: &Config,
        state: Arc<StateStore>,
        fed_cache: Arc<FederationCache>,
        artifacts: Arc<ArtifactAccess>,
        inbound: Arc<dyn InboundFrameSink>,
    ) -> Self {
        Self {
            cluster_id: config.cluster_id.clone(),
            service_token: config.service_token.clone(),
            state,
            fed_cache,
            weights: config.weights,
            artifacts,
            inbound,
        }
    }
}

pub fn build_router(state: FederationState) -> Router {
    Router::new()
        .route("/federation/query_stream", post(query_stream))
        .route("/federation/notify_origin_pull", post(notify_origin_pull))
        .route("/federation/prepare_artifact", post(prepare_artifact))
        .route(
            "/federation/tenants/{tenant}/artifacts",
            get(list_tenant_artifacts),
        )
        .route(
            "/federation/migrate_artifact_metadata",
            post(migrate_artifact_metadata),
        )
        .route(
            "/federation/forward_artifact_command",
            post(forward_artifact_command),
        )
        .route("/federation/peer_channel", get(peer_channel))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn authorized(state: &FederationState, headers: &HeaderMap) -> bool {
    if state.service_token.is_empty() {
        return true;
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").trim() == state.service_token)
        .unwrap_or(false)
}

async fn query_stream(
    State(state): State<FederationState>,
    headers: HeaderMap,
    Json(req): Json<QueryStreamRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let tenant = TenantId::new(req.tenant.clone());
    let grant = match state.fed_cache.peer_address(&req.peer_cluster).await {
        Ok(grant) => grant,
        Err(e) => {
            warn!(error = %e, peer = %req.peer_cluster, "failed to load peer address for tenant check");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let shares_tenant = grant.map(|g| g.shared_tenants.contains(&tenant)).unwrap_or(false);
    if !shares_tenant {
        return (
            StatusCode::FORBIDDEN,
            Json(QueryStreamResponse { candidates: vec![] }),
        )
            .into_response();
    }

    let stream_tenant = state.state.get_stream(&req.stream).await.map(|s| s.tenant);
    let ctx = RequestContext {
        stream: Some(req.stream.clone()),
        tenant: Some(tenant),
        viewer_geo: None,
        is_source_selection: req.is_source_selection,
        local_cluster: state.cluster_id.clone(),
    };
    let instances = state.state.get_stream_instances(&req.stream).await;

    let mut scored = Vec::new();
    for node in state.state.all_nodes().await {
        let rejections = balancer::eligibility(&node, &instances, stream_tenant.as_ref(), &ctx);
        if !rejections.is_empty() {
            continue;
        }
        let instance = instances.iter().find(|i| i.node == node.id);
        if req.is_source_selection && !instance.map(|i| i.is_origin()).unwrap_or(false) {
            continue;
        }
        let s = balancer::score(&node, instance, true, &ctx, &state.weights);
        scored.push(ScoredCandidate {
            node: node.id.clone(),
            base_url: node.base_url.clone(),
            geo: node.geo,
            bw_headroom_bps: node.bandwidth_limit_bps as i64 - node.current_bw_bps as i64,
            score: s,
            is_origin: instance.map(|i| i.is_origin()).unwrap_or(false),
        });
    }
    let candidates = balancer::top_n_with_scores(scored, 10);
    Json(QueryStreamResponse { candidates }).into_response()
}

async fn notify_origin_pull(
    State(state): State<FederationState>,
    headers: HeaderMap,
    Json(req): Json<NotifyOriginPullRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let instances = state.state.get_stream_instances(&req.stream).await;
    let origin = instances.iter().find(|i| i.node.as_str() == req.source_node);
    let Some(origin) = origin else {
        return (StatusCode::NOT_FOUND, "no such origin").into_response();
    };
    if !origin.is_origin() {
        return (StatusCode::CONFLICT, "node is not an origin").into_response();
    }

    let record = ActiveReplicationRecord {
        stream: req.stream.clone(),
        source_cluster: state.cluster_id.clone(),
        dest_cluster: req.dest_cluster.clone(),
        dest_node: crate::types::NodeId::new(req.dest_node.clone()),
        created_at: Utc::now(),
    };
    if let Err(e) = state.fed_cache.put_active_replication(&record).await {
        warn!(error = %e, "failed to record active replication");
    }

    let node_state = state.state.get_node(&origin.node).await;
    let base_url = node_state.map(|n| n.base_url).unwrap_or_default();
    let dtsc_url = format!("dtsc://{base_url}:4200/{}", req.stream);
    Json(NotifyOriginPullResponse { dtsc_url, accepted: true }).into_response()
}

fn to_access_kind(kind: ArtifactKind) -> ArtifactType {
    match kind {
        ArtifactKind::Clip => ArtifactType::Clip,
        ArtifactKind::Dvr => ArtifactType::Dvr,
        ArtifactKind::Vod => ArtifactType::Vod,
    }
}

fn from_access_kind(kind: ArtifactType) -> ArtifactKind {
    match kind {
        ArtifactType::Clip => ArtifactKind::Clip,
        ArtifactType::Dvr => ArtifactKind::Dvr,
        ArtifactType::Vod => ArtifactKind::Vod,
    }
}

async fn prepare_artifact(
    State(state): State<FederationState>,
    headers: HeaderMap,
    Json(req): Json<PrepareArtifactRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let hash = ArtifactHash::new(req.hash.clone());
    match state
        .artifacts
        .prepare_for_peer(&hash, &req.requesting_cluster, to_access_kind(req.kind))
        .await
    {
        Ok(outcome) => Json(PrepareArtifactResponse {
            url: outcome.url,
            segment_urls: outcome.segment_urls,
            size_bytes: outcome.size_bytes,
            ready: outcome.ready,
            est_ready_seconds: outcome.est_ready_seconds,
            format: outcome.format,
            internal_name: outcome.internal_name,
        })
        .into_response(),
        Err(e) => e.to_user_facing().into_response(),
    }
}

async fn list_tenant_artifacts(
    State(state): State<FederationState>,
    headers: HeaderMap,
    axum::extract::Path(tenant): axum::extract::Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let artifacts = state
        .artifacts
        .list_tenant_artifacts(&TenantId::new(tenant))
        .await
        .into_iter()
        .map(|a| ArtifactSummary {
            hash: a.hash.to_string(),
            kind: from_access_kind(a.kind),
            size: a.size,
            status: format!("{:?}", a.status),
        })
        .collect();
    Json(ListTenantArtifactsResponse { artifacts }).into_response()
}

async fn migrate_artifact_metadata(
    State(state): State<FederationState>,
    headers: HeaderMap,
    Json(req): Json<MigrateArtifactMetadataRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let tenant = TenantId::new(req.tenant);
    let migrated = state.artifacts.list_tenant_artifacts(&tenant).await.len() as u64;
    info!(tenant = %tenant, source_cluster = %req.source_cluster, migrated, "migrate_artifact_metadata served");
    Json(MigrateArtifactMetadataResponse { migrated }).into_response()
}

async fn forward_artifact_command(
    State(state): State<FederationState>,
    headers: HeaderMap,
    Json(req): Json<ForwardArtifactCommandRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let command = match req.command {
        ArtifactCommand::Delete => AccessCommand::Delete,
        ArtifactCommand::Stop => AccessCommand::Stop,
    };
    let hash = ArtifactHash::new(req.hash);
    let tenant = TenantId::new(req.tenant);
    let handled = state
        .artifacts
        .handle_local_command(command, &hash, &tenant)
        .await
        .unwrap_or(false);
    Json(ForwardArtifactCommandResponse { handled }).into_response()
}

async fn peer_channel(
    State(state): State<FederationState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_peer_socket(socket, state))
}

/// One accepted `PeerChannel` connection: pumps inbound frames into
/// `InboundFrameSink` and drains an outbound queue registered with it,
/// until the peer says `Goodbye` or the socket drops.
async fn handle_peer_socket(mut socket: WebSocket, state: FederationState) {
    let mut peer_id: Option<ClusterId> = None;
    let (tx, mut rx) = mpsc::unbounded_channel::<PeerFrame>();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        let frame: PeerFrame = match serde_json::from_str(&text) {
                            Ok(f) => f,
                            Err(e) => {
                                warn!(error = %e, "malformed peer frame, dropping connection");
                                break;
                            }
                        };
                        match &frame {
                            PeerFrame::Hello { cluster_id, .. } if peer_id.is_none() => {
                                peer_id = Some(cluster_id.clone());
                                state.inbound.on_connect(cluster_id.clone(), tx.clone()).await;
                            }
                            PeerFrame::Goodbye { .. } => {
                                if let Some(peer) = frame_peer_or(&peer_id) {
                                    state.inbound.on_frame(peer, frame).await;
                                }
                                break;
                            }
                            _ => {
                                if let Some(peer) = &peer_id {
                                    state.inbound.on_frame(peer.clone(), frame).await;
                                }
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            outgoing = rx.recv() => {
                let Some(frame) = outgoing else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(peer) = peer_id {
        state.inbound.on_disconnect(peer).await;
    }
}

fn frame_peer_or(peer_id: &Option<ClusterId>) -> Option<ClusterId> {
    peer_id.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_when_token_mismatched() {
        let state = FederationState {
            cluster_id: ClusterId::new("c1"),
            service_token: "secret".to_string(),
            state: Arc::new(StateStore::new(
                ClusterId::new("c1"),
                crate::types::InstanceId::new("i1"),
                Arc::new(crate::kv::memory::MemoryKv::new()),
                BalancerWeights::default(),
            )),
            fed_cache: Arc::new(FederationCache::new(
                ClusterId::new("c1"),
                Arc::new(crate::kv::memory::MemoryKv::new()),
            )),
            weights: BalancerWeights::default(),
            artifacts: Arc::new(ArtifactAccess::new(
                ClusterId::new("c1"),
                Arc::new(StateStore::new(
                    ClusterId::new("c1"),
                    crate::types::InstanceId::new("i1"),
                    Arc::new(crate::kv::memory::MemoryKv::new()),
                    BalancerWeights::default(),
                )),
                Arc::new(NoPeers),
                Arc::new(EmptyIndex),
                b"k".to_vec(),
                "https://cdn",
            )),
            inbound: Arc::new(NoopSink),
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer wrong".parse().unwrap(),
        );
        assert!(!authorized(&state, &headers));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer secret".parse().unwrap(),
        );
        assert!(authorized(&state, &headers));
    }

    struct NoPeers;
    #[async_trait]
    impl crate::artifact_access::PeerArtifactClient for NoPeers {
        async fn prepare_artifact(
            &self,
            _peer: &ClusterId,
            _hash: &ArtifactHash,
            _tenant: &TenantId,
            _kind: ArtifactType,
        ) -> crate::error::Result<crate::artifact_access::PrepareArtifactOutcome> {
            Err(crate::error::FoghornError::not_found("no peers"))
        }
        async fn forward_command(
            &self,
            _peer: &ClusterId,
            _command: AccessCommand,
            _hash: &ArtifactHash,
            _tenant: &TenantId,
        ) -> crate::error::Result<bool> {
            Ok(false)
        }
    }

    struct EmptyIndex;
    impl crate::artifact_access::ArtifactAdIndex for EmptyIndex {
        fn peer_for_hash(&self, _hash: &ArtifactHash) -> Option<ClusterId> {
            None
        }
        fn known_peers(&self) -> Vec<ClusterId> {
            vec![]
        }
    }

    struct NoopSink;
    #[async_trait]
    impl InboundFrameSink for NoopSink {
        async fn on_connect(&self, _peer: ClusterId, _outbound: mpsc::UnboundedSender<PeerFrame>) {}
        async fn on_frame(&self, _peer: ClusterId, _frame: PeerFrame) {}
        async fn on_disconnect(&self, _peer: ClusterId) {}
    }
}

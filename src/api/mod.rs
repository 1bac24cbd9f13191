//! Wire surfaces the media server and viewers talk to directly (§6):
//! `GET /?source=` (the STREAM_SOURCE-equivalent HTTP entry point used by
//! components that can't speak the sidecar trigger protocol directly),
//! `GET /play/*`/`GET /resolve/*` (viewer-facing playback routing), and
//! `POST /trigger` (the webhook the media-server sidecar forwards its
//! eight trigger callbacks through). `/healthz` and `/metrics` are the
//! supplemented ambient endpoints (`SPEC_FULL.md` §C.1).
//!
//! Grounded on `api::rest::server`'s router-building shape; `cors`/tracing
//! layering carried from the same module.

use crate::error::UserFacingError;
use crate::events::EventEmitter;
use crate::origin_pull::{OriginPullArranger, PullDecision};
use crate::source_resolver::{SourceResolver, DTSC_PORT, FALLBACK_URL};
use crate::triggers::{Trigger, TriggerHandler, TriggerResponse};
use crate::types::{ClusterId, NodeId, StreamName, TenantId};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub federation_base_url: String,
    pub resolver: Arc<SourceResolver>,
    pub events: EventEmitter,
    pub triggers: Arc<TriggerHandler>,
    pub origin_pull: Arc<OriginPullArranger>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(get_source))
        .route("/play/{*rest}", get(play))
        .route("/resolve/{*rest}", get(play))
        .route("/trigger", post(trigger))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Webhook body the sidecar posts for every media-server callback. Not
/// every field applies to every `kind`; unused ones are ignored.
#[derive(Debug, Deserialize)]
struct TriggerRequest {
    kind: String,
    stream: String,
    node: Option<String>,
    tenant: Option<String>,
    buffer_state: Option<String>,
    origin_cluster: Option<String>,
}

impl TriggerRequest {
    fn into_trigger(self) -> Result<Trigger, String> {
        let node = || NodeId::new(self.node.clone().unwrap_or_default());
        let tenant = || TenantId::new(self.tenant.clone().unwrap_or_default());
        Ok(match self.kind.as_str() {
            "PUSH_REWRITE" => Trigger::PushRewrite { raw_stream: self.stream, node: node() },
            "STREAM_SOURCE" => Trigger::StreamSource { raw_stream: self.stream, tenant: tenant() },
            "USER_NEW" => Trigger::UserNew { raw_stream: self.stream, node: node(), tenant: tenant() },
            "USER_END" => Trigger::UserEnd { raw_stream: self.stream, node: node(), tenant: tenant() },
            "STREAM_BUFFER" => Trigger::StreamBuffer {
                raw_stream: self.stream,
                node: node(),
                buffer_state: self.buffer_state.unwrap_or_default(),
            },
            "STREAM_END" => Trigger::StreamEnd {
                raw_stream: self.stream,
                node: node(),
                origin_cluster: self.origin_cluster.map(ClusterId::new),
            },
            "PUSH_OUT_START" => Trigger::PushOutStart { raw_stream: self.stream, node: node() },
            "PUSH_END" => Trigger::PushEnd { raw_stream: self.stream, node: node() },
            other => return Err(format!("unrecognized trigger kind: {other}")),
        })
    }
}

/// `POST /trigger`: the sidecar's forwarded webhook. Plain-text response
/// body per the media server's trigger convention — empty for every
/// trigger except `STREAM_SOURCE`, which answers with a URL.
async fn trigger(State(state): State<ApiState>, Json(body): Json<TriggerRequest>) -> Response {
    let trigger = match body.into_trigger() {
        Ok(t) => t,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    match state.triggers.dispatch(trigger).await {
        Ok(TriggerResponse::Empty) => String::new().into_response(),
        Ok(TriggerResponse::Url(url)) => url.into_response(),
        Err(e) => e.to_user_facing().into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SourceQuery {
    source: String,
    tenant: Option<String>,
}

/// `GET /?source=<stream>` — plain-text DTSC URL, or the DTSC-default
/// fallback if nothing local or federated can serve the stream.
async fn get_source(State(state): State<ApiState>, Query(q): Query<SourceQuery>) -> String {
    let tenant = TenantId::new(q.tenant.unwrap_or_default());
    let stream = StreamName::normalize(&q.source);
    state
        .resolver
        .handle_get_source(&stream, &tenant)
        .await
        .unwrap_or_else(|_| FALLBACK_URL.to_string())
}

#[derive(Debug, Deserialize)]
struct PlayQuery {
    tenant: Option<String>,
}

#[derive(Debug, Serialize)]
struct PlaybackTarget {
    host: String,
    port: u16,
    protocol: &'static str,
    node_id: String,
}

#[derive(Debug, Serialize)]
struct PlaybackResponse {
    primary: PlaybackTarget,
    fallbacks: Vec<PlaybackTarget>,
    outputs: HashMap<String, String>,
}

/// A single `GET /play` request is itself the viewer demand signal that
/// drives the §4.9 redirect-vs-pull decision; `OriginPullArranger`'s own
/// threshold compares against this rather than a running counter this
/// stateless handler has no cheap way to maintain.
const PLAY_REQUEST_DEMAND: u64 = 1;

/// `GET /play/*` and `GET /resolve/*`: rank eligible local nodes for the
/// requested stream. If none are eligible and the stream is known to
/// originate on another cluster, ask `OriginPullArranger` whether to stand
/// up a local pull replica or redirect straight to the remote edge. If
/// neither a local node nor a remote origin resolves, the request fails
/// capacity (503).
async fn play(
    State(state): State<ApiState>,
    Path(rest): Path<String>,
    Query(q): Query<PlayQuery>,
) -> Response {
    let stream = StreamName::normalize(&rest);
    let tenant = TenantId::new(q.tenant.clone().unwrap_or_default());
    let candidates = state.resolver.rank_local_candidates(Some(&stream), Some(&tenant), None, 4).await;

    if let Some((primary, fallbacks)) = candidates.split_first() {
        let to_target = |c: &crate::balancer::ScoredCandidate| PlaybackTarget {
            host: format!("{}.{}", c.node, state.federation_base_url),
            port: DTSC_PORT,
            protocol: "dtsc",
            node_id: c.node.to_string(),
        };
        let mut outputs = HashMap::new();
        outputs.insert("hls".to_string(), format!("{}/hls/{}.m3u8", primary.base_url, stream));
        outputs.insert("whep".to_string(), format!("{}/whep/{}", primary.base_url, stream));
        outputs.insert("dash".to_string(), format!("{}/dash/{}.mpd", primary.base_url, stream));

        return Json(PlaybackResponse {
            primary: to_target(primary),
            fallbacks: fallbacks.iter().map(to_target).collect(),
            outputs,
        })
        .into_response();
    }

    match state.resolver.remote_origin_candidate(&stream, &tenant).await {
        Ok(Some((origin_cluster, origin))) => {
            let decision = state
                .origin_pull
                .arrange(&stream, &tenant, &origin_cluster, origin.node.as_str(), PLAY_REQUEST_DEMAND)
                .await;
            return match decision {
                Ok(PullDecision::Pull { node, dtsc_url: _ }) => Json(PlaybackResponse {
                    primary: PlaybackTarget {
                        host: format!("{}.{}", node, state.federation_base_url),
                        port: DTSC_PORT,
                        protocol: "dtsc",
                        node_id: node.to_string(),
                    },
                    fallbacks: vec![],
                    outputs: HashMap::new(),
                })
                .into_response(),
                Ok(PullDecision::Redirect { dtsc_url }) => {
                    (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, dtsc_url)]).into_response()
                }
                Err(e) => e.to_user_facing().into_response(),
            };
        }
        Ok(None) => {}
        Err(e) => return e.to_user_facing().into_response(),
    }

    match state.resolver.handle_get_source(&stream, &tenant).await {
        Ok(url) if url != FALLBACK_URL => {
            (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, url)]).into_response()
        }
        Ok(_) => UserFacingError::Capacity { rejected_by: vec!["no_eligible_node".to_string()] }
            .into_response(),
        Err(e) => e.to_user_facing().into_response(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<ApiState>) -> String {
    state.events.render_prometheus()
}

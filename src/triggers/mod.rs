//! Media-server sidecar trigger dispatch (§6, §9): each HTTP callback the
//! media server fires carries one of eight trigger kinds, multiplexed here
//! onto one handler per variant. `STREAM_SOURCE` is the only trigger the
//! media server blocks on (~10s budget); every other trigger is answered
//! immediately and only updates local bookkeeping and analytics.
//!
//! Grounded on `orchestration::actor`'s tagged-dispatch loop: one enum, one
//! `match` arm per tag, no dynamic dispatch.

use crate::error::Result;
use crate::events::{AnalyticsEvent, EventEmitter};
use crate::origin_pull::OriginPullArranger;
use crate::source_resolver::SourceResolver;
use crate::state::{StateStore, StreamInstanceStatus};
use crate::types::{ClusterId, NodeId, StreamName, TenantId};
use std::sync::Arc;
use tracing::{info, warn};

/// One parsed media-server callback. `stream` carries the raw key exactly
/// as the media server sent it (with its `live+`/`vod+` prefix, if any) —
/// callers that need the canonical name call `StreamName::normalize`.
#[derive(Debug, Clone)]
pub enum Trigger {
    PushRewrite { raw_stream: String, node: NodeId },
    StreamSource { raw_stream: String, tenant: TenantId },
    UserNew { raw_stream: String, node: NodeId, tenant: TenantId },
    UserEnd { raw_stream: String, node: NodeId, tenant: TenantId },
    StreamBuffer { raw_stream: String, node: NodeId, buffer_state: String },
    StreamEnd { raw_stream: String, node: NodeId, origin_cluster: Option<ClusterId> },
    PushOutStart { raw_stream: String, node: NodeId },
    PushEnd { raw_stream: String, node: NodeId },
}

/// Response the HTTP layer writes back to the media server. Only
/// `StreamSource` ever produces `Url`; every other trigger acknowledges
/// with an empty body per §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResponse {
    Empty,
    Url(String),
}

pub struct TriggerHandler {
    local_cluster: ClusterId,
    state: Arc<StateStore>,
    resolver: Arc<SourceResolver>,
    origin_pull: Arc<OriginPullArranger>,
    events: EventEmitter,
}

impl TriggerHandler {
    pub fn new(
        local_cluster: ClusterId,
        state: Arc<StateStore>,
        resolver: Arc<SourceResolver>,
        origin_pull: Arc<OriginPullArranger>,
        events: EventEmitter,
    ) -> Self {
        Self { local_cluster, state, resolver, origin_pull, events }
    }

    pub async fn dispatch(&self, trigger: Trigger) -> Result<TriggerResponse> {
        match trigger {
            Trigger::PushRewrite { raw_stream, node } => self.push_rewrite(raw_stream, node).await,
            Trigger::StreamSource { raw_stream, tenant } => {
                self.stream_source(raw_stream, tenant).await
            }
            Trigger::UserNew { raw_stream, node, tenant } => {
                self.user_new(raw_stream, node, tenant).await
            }
            Trigger::UserEnd { raw_stream, node, tenant } => {
                self.user_end(raw_stream, node, tenant).await
            }
            Trigger::StreamBuffer { raw_stream, node, buffer_state } => {
                self.stream_buffer(raw_stream, node, buffer_state).await
            }
            Trigger::StreamEnd { raw_stream, node, origin_cluster } => {
                self.stream_end(raw_stream, node, origin_cluster).await
            }
            Trigger::PushOutStart { raw_stream, node } => {
                self.push_out_start(raw_stream, node).await
            }
            Trigger::PushEnd { raw_stream, node } => self.push_end(raw_stream, node).await,
        }
    }

    /// Ingest validation point: the media server is about to accept a push
    /// from an encoder. Registers (or reuses) the `StreamInstanceState` as
    /// an active input; rejection paths (bad stream key, over-quota tenant)
    /// live in the registry lookup the caller performs before this point.
    async fn push_rewrite(&self, raw_stream: String, node: NodeId) -> Result<TriggerResponse> {
        let stream = StreamName::normalize(&raw_stream);
        self.state
            .update_stream_instance(stream.clone(), node.clone(), |i| {
                i.inputs += 1;
                i.replicated = false;
                i.status = StreamInstanceStatus::Starting;
            })
            .await?;
        self.state
            .update_stream_state(stream.clone(), |s| {
                s.primary_node = Some(node.clone());
                s.online = true;
            })
            .await?;
        info!(%stream, %node, "push rewrite accepted");
        Ok(TriggerResponse::Empty)
    }

    /// The only blocking trigger. `live+*` streams answer empty so the
    /// media server falls back to its configured load-balancer endpoint;
    /// everything else (VOD, artifacts) resolves to a concrete URL.
    async fn stream_source(&self, raw_stream: String, tenant: TenantId) -> Result<TriggerResponse> {
        if StreamName::is_live(&raw_stream) {
            return Ok(TriggerResponse::Empty);
        }
        let stream = StreamName::normalize(&raw_stream);
        let url = self.resolver.handle_get_source(&stream, &tenant).await?;
        self.events.emit(AnalyticsEvent::RoutingDecision {
            tenant_id: tenant.clone(),
            stream_tenant_id: tenant,
            cluster_id: self.local_cluster.clone(),
            origin_cluster_id: self.local_cluster.clone(),
            selected_node: None,
            score: 0,
            status: "stream_source_resolved".to_string(),
            client_bucket: None,
            node_bucket: None,
        });
        Ok(TriggerResponse::Url(url))
    }

    async fn user_new(&self, raw_stream: String, node: NodeId, tenant: TenantId) -> Result<TriggerResponse> {
        let stream = StreamName::normalize(&raw_stream);
        self.state
            .update_stream_instance(stream.clone(), node.clone(), |i| {
                i.current_viewers += 1;
            })
            .await?;
        self.events.emit(AnalyticsEvent::ViewerConnect {
            tenant_id: tenant,
            stream,
            cluster_id: self.local_cluster.clone(),
            node,
        });
        Ok(TriggerResponse::Empty)
    }

    async fn user_end(&self, raw_stream: String, node: NodeId, tenant: TenantId) -> Result<TriggerResponse> {
        let stream = StreamName::normalize(&raw_stream);
        self.state
            .update_stream_instance(stream.clone(), node.clone(), |i| {
                i.current_viewers = i.current_viewers.saturating_sub(1);
            })
            .await?;
        self.events.emit(AnalyticsEvent::ViewerDisconnect {
            tenant_id: tenant,
            stream,
            cluster_id: self.local_cluster.clone(),
            node,
        });
        Ok(TriggerResponse::Empty)
    }

    async fn stream_buffer(&self, raw_stream: String, node: NodeId, buffer_state: String) -> Result<TriggerResponse> {
        let stream = StreamName::normalize(&raw_stream);
        self.state
            .update_stream_instance(stream, node, |i| {
                i.buffer_state = Some(buffer_state);
            })
            .await?;
        Ok(TriggerResponse::Empty)
    }

    /// Evicts the `StreamInstanceState` row outright (§E.1: conservative
    /// choice over marking it offline in place, since a lingering origin
    /// row would violate the origin-uniqueness invariant the moment a new
    /// push lands on a different node). Marks the stream itself offline
    /// only once no instance remains. Releases origin-pull bookkeeping so a
    /// later viewer demand can re-arrange a fresh replica.
    async fn stream_end(
        &self,
        raw_stream: String,
        node: NodeId,
        origin_cluster: Option<ClusterId>,
    ) -> Result<TriggerResponse> {
        let stream = StreamName::normalize(&raw_stream);
        self.state.evict_stream_instance(&stream, &node).await?;

        let remaining = self.state.get_stream_instances(&stream).await;
        if remaining.is_empty() {
            self.state
                .update_stream_state(stream.clone(), |s| {
                    s.online = false;
                    s.primary_node = None;
                })
                .await?;
        }

        if let Some(origin) = origin_cluster {
            if let Err(e) = self.origin_pull.release(&stream, &origin).await {
                warn!(%stream, error = %e, "failed to release origin-pull bookkeeping");
            }
        }

        self.events.emit(AnalyticsEvent::StreamLifecycle {
            stream: stream.clone(),
            cluster_id: self.local_cluster.clone(),
            node,
            online: !remaining.is_empty(),
        });
        info!(%stream, "stream end processed");
        Ok(TriggerResponse::Empty)
    }

    async fn push_out_start(&self, raw_stream: String, node: NodeId) -> Result<TriggerResponse> {
        let stream = StreamName::normalize(&raw_stream);
        self.state
            .update_stream_instance(stream, node, |i| {
                i.status = StreamInstanceStatus::Live;
            })
            .await?;
        Ok(TriggerResponse::Empty)
    }

    async fn push_end(&self, raw_stream: String, node: NodeId) -> Result<TriggerResponse> {
        let stream = StreamName::normalize(&raw_stream);
        self.state
            .update_stream_instance(stream.clone(), node.clone(), |i| {
                i.inputs = i.inputs.saturating_sub(1);
                if i.inputs == 0 {
                    i.status = StreamInstanceStatus::Offline;
                }
            })
            .await?;
        Ok(TriggerResponse::Empty)
    }
}

//! Analytics event emission (§6): a single fire-and-forget send path for
//! the typed events the orchestrator produces as a side effect of routing
//! and lifecycle decisions. Errors from the sink are logged with full
//! context and never propagated to the caller — an analytics outage must
//! never affect a viewer's playback.
//!
//! Grounded on `monitoring::metrics`'s `Counter`/`Gauge` shape: each event
//! kind also bumps a counter on the same registry exposed at `/metrics`.

use crate::types::{ClusterId, NodeId, StreamName, TenantId};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// One analytics record. Field sets follow §6 verbatim; `RoutingDecision`
/// covers both the load-balancing and the cross-cluster routing cases,
/// since both describe the same "picked this node, here's why" shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum AnalyticsEvent {
    ViewerConnect {
        tenant_id: TenantId,
        stream: StreamName,
        cluster_id: ClusterId,
        node: NodeId,
    },
    ViewerDisconnect {
        tenant_id: TenantId,
        stream: StreamName,
        cluster_id: ClusterId,
        node: NodeId,
    },
    StreamLifecycle {
        stream: StreamName,
        cluster_id: ClusterId,
        node: NodeId,
        online: bool,
    },
    ArtifactLifecycle {
        hash: String,
        tenant_id: TenantId,
        status: String,
    },
    RoutingDecision {
        tenant_id: TenantId,
        stream_tenant_id: TenantId,
        cluster_id: ClusterId,
        origin_cluster_id: ClusterId,
        selected_node: Option<NodeId>,
        score: i64,
        status: String,
        client_bucket: Option<String>,
        node_bucket: Option<String>,
    },
}

impl AnalyticsEvent {
    fn counter_name(&self) -> &'static str {
        match self {
            AnalyticsEvent::ViewerConnect { .. } => "foghorn_events_viewer_connect_total",
            AnalyticsEvent::ViewerDisconnect { .. } => "foghorn_events_viewer_disconnect_total",
            AnalyticsEvent::StreamLifecycle { .. } => "foghorn_events_stream_lifecycle_total",
            AnalyticsEvent::ArtifactLifecycle { .. } => "foghorn_events_artifact_lifecycle_total",
            AnalyticsEvent::RoutingDecision { .. } => "foghorn_events_routing_decision_total",
        }
    }
}

/// Where emitted events go. Kept as a trait so tests can capture events
/// instead of logging them, and so a future wire-format (Kafka, webhook)
/// can be swapped in without touching callers.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &AnalyticsEvent);
}

/// Default sink: structured `tracing` output. There is no analytics
/// time-series store in this build (§D Non-goals); this is the ambient
/// observability surface that carries regardless.
pub struct LoggingEventSink;

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn record(&self, event: &AnalyticsEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "foghorn::events", event = %json, "analytics event"),
            Err(e) => error!(error = %e, "failed to serialize analytics event"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EventCounters {
    values: Arc<RwLock<HashMap<&'static str, u64>>>,
}

impl EventCounters {
    fn bump(&self, name: &'static str) {
        *self.values.write().entry(name).or_insert(0) += 1;
    }

    fn snapshot(&self) -> Vec<(&'static str, u64)> {
        self.values.read().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

/// Entry point used by `triggers` and `source_resolver` to emit analytics.
/// `emit` never blocks the caller beyond spawning a task; the sink itself
/// may be slow or briefly unavailable without affecting playback.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    counters: EventCounters,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink, counters: EventCounters::default() }
    }

    pub fn emit(&self, event: AnalyticsEvent) {
        self.counters.bump(event.counter_name());
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sink.record(&event).await;
        });
    }

    /// Render current counters in Prometheus text exposition format, for
    /// the `api` module's `/metrics` handler.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.counters.snapshot() {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        out
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(Arc::new(LoggingEventSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CapturingSink {
        events: Mutex<Vec<AnalyticsEvent>>,
    }

    #[async_trait]
    impl EventSink for CapturingSink {
        async fn record(&self, event: &AnalyticsEvent) {
            self.events.lock().await.push(event.clone());
        }
    }

    #[tokio::test]
    async fn emit_reaches_sink_asynchronously() {
        let sink = Arc::new(CapturingSink::default());
        let emitter = EventEmitter::new(sink.clone());
        emitter.emit(AnalyticsEvent::ViewerConnect {
            tenant_id: TenantId::new("t1"),
            stream: StreamName::new("live+x"),
            cluster_id: ClusterId::new("c1"),
            node: NodeId::new("edge-1"),
        });
        // Give the spawned task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(sink.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn counters_increment_per_event_kind() {
        let emitter = EventEmitter::default();
        emitter.emit(AnalyticsEvent::StreamLifecycle {
            stream: StreamName::new("live+x"),
            cluster_id: ClusterId::new("c1"),
            node: NodeId::new("edge-1"),
            online: true,
        });
        emitter.emit(AnalyticsEvent::StreamLifecycle {
            stream: StreamName::new("live+y"),
            cluster_id: ClusterId::new("c1"),
            node: NodeId::new("edge-1"),
            online: false,
        });
        let rendered = emitter.render_prometheus();
        assert!(rendered.contains("foghorn_events_stream_lifecycle_total 2"));
    }
}

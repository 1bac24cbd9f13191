//! Wire messages: the nine peer-channel families (§4.8) and the request/
//! response bodies for the unary federation RPCs (§4.7).
//!
//! Grounded on `websocket::message`'s tagged-enum shape
//! (`#[serde(tag = "type", content = "data")]`) for the multiplexed
//! peer-channel frame, generalized from one connection's worth of SQL
//! protocol messages to nine independent cadences sharing one socket.

use crate::balancer::ScoredCandidate;
use crate::federation_cache::{EdgeSummaryRecord, PeerHeartbeatRecord, RemoteEdgeRecord};
use crate::types::{ClusterId, PlaybackId, StreamName};
use serde::{Deserialize, Serialize};

/// One frame on the bidirectional peer channel. FIFO within one direction;
/// no ordering is promised across families multiplexed on the same
/// connection (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", content = "body")]
pub enum PeerFrame {
    Hello {
        protocol_version: u32,
        cluster_id: ClusterId,
        capabilities: Vec<String>,
    },
    Goodbye {
        reason: String,
    },
    EdgeTelemetry {
        edges: Vec<RemoteEdgeRecord>,
    },
    ReplicationEvent {
        stream: StreamName,
        available: bool,
        dtsc_url: Option<String>,
    },
    ClusterEdgeSummary {
        summary: EdgeSummaryRecord,
    },
    StreamLifecycleEvent {
        stream: StreamName,
        online: bool,
    },
    StreamAdvertisement {
        stream: StreamName,
        edges: Vec<ScoredCandidate>,
        playback_id: Option<PlaybackId>,
        origin_cluster: ClusterId,
    },
    ArtifactAdvertisement {
        hash: String,
        node_hint: String,
    },
    PeerHeartbeat {
        heartbeat: PeerHeartbeatRecord,
    },
    CapacitySummary {
        aggregate_bw_bps: u64,
    },
}

impl PeerFrame {
    /// Droppable families (§5 backpressure): if a per-family send queue is
    /// full, the oldest droppable frame is discarded. `ReplicationEvent`
    /// and control frames are never droppable — a persistent stall there
    /// resets the channel instead.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            PeerFrame::EdgeTelemetry { .. }
                | PeerFrame::ClusterEdgeSummary { .. }
                | PeerFrame::StreamAdvertisement { .. }
                | PeerFrame::ArtifactAdvertisement { .. }
                | PeerFrame::PeerHeartbeat { .. }
                | PeerFrame::CapacitySummary { .. }
        )
    }

    pub fn family_name(&self) -> &'static str {
        match self {
            PeerFrame::Hello { .. } => "hello",
            PeerFrame::Goodbye { .. } => "goodbye",
            PeerFrame::EdgeTelemetry { .. } => "edge_telemetry",
            PeerFrame::ReplicationEvent { .. } => "replication_event",
            PeerFrame::ClusterEdgeSummary { .. } => "cluster_edge_summary",
            PeerFrame::StreamLifecycleEvent { .. } => "stream_lifecycle_event",
            PeerFrame::StreamAdvertisement { .. } => "stream_advertisement",
            PeerFrame::ArtifactAdvertisement { .. } => "artifact_advertisement",
            PeerFrame::PeerHeartbeat { .. } => "peer_heartbeat",
            PeerFrame::CapacitySummary { .. } => "capacity_summary",
        }
    }
}

// --- unary RPC bodies (§4.7) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStreamRequest {
    pub stream: StreamName,
    pub tenant: String,
    pub is_source_selection: bool,
    pub peer_cluster: ClusterId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStreamResponse {
    pub candidates: Vec<ScoredCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyOriginPullRequest {
    pub stream: StreamName,
    pub source_node: String,
    pub dest_cluster: ClusterId,
    pub dest_node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyOriginPullResponse {
    pub dtsc_url: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    Clip,
    Dvr,
    Vod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareArtifactRequest {
    pub hash: String,
    pub tenant: String,
    pub requesting_cluster: ClusterId,
    pub kind: ArtifactKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareArtifactResponse {
    pub url: Option<String>,
    pub segment_urls: Option<std::collections::HashMap<String, String>>,
    pub size_bytes: u64,
    pub ready: bool,
    pub est_ready_seconds: Option<u64>,
    pub format: String,
    pub internal_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub hash: String,
    pub kind: ArtifactKind,
    pub size: u64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTenantArtifactsResponse {
    pub artifacts: Vec<ArtifactSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateArtifactMetadataRequest {
    pub tenant: String,
    pub source_cluster: ClusterId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateArtifactMetadataResponse {
    pub migrated: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ArtifactCommand {
    Delete,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardArtifactCommandRequest {
    pub command: ArtifactCommand,
    pub hash: String,
    pub tenant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardArtifactCommandResponse {
    pub handled: bool,
}

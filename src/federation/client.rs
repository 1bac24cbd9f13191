//! Federation Client: the outbound half of the peer protocol. One
//! `PeerConnection` per configured peer cluster, owning a pooled
//! `reqwest::Client` for the six unary RPCs and an outbound `PeerChannel`
//! websocket the sender-cadence tasks in `peer_manager` write to.
//!
//! Grounded on `registry_client::HttpRegistryClient` for the pooled-client,
//! bearer-token, per-request-deadline shape, generalized from one registry
//! endpoint to six peer RPCs plus a persistent socket.

use crate::artifact_access::{ArtifactCommand as AccessCommand, PeerArtifactClient, PrepareArtifactOutcome};
use crate::balancer::ScoredCandidate;
use crate::error::{FoghornError, Result};
use crate::federation::messages::{
    ArtifactCommand, ArtifactKind, ForwardArtifactCommandRequest, ForwardArtifactCommandResponse,
    ListTenantArtifactsResponse, MigrateArtifactMetadataRequest, MigrateArtifactMetadataResponse,
    NotifyOriginPullRequest, NotifyOriginPullResponse, PeerFrame, PrepareArtifactRequest,
    PrepareArtifactResponse, QueryStreamRequest, QueryStreamResponse,
};
use crate::source_resolver::PeerQuery;
use crate::state::ArtifactType;
use crate::types::{ArtifactHash, ClusterId, StreamName, TenantId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// One peer's federation HTTP address plus its live outbound `PeerChannel`
/// sender, if a channel is currently connected. `PeerManager` populates and
/// tears these down as peers come and go.
struct PeerConnection {
    federation_address: String,
    outbound: Option<mpsc::UnboundedSender<PeerFrame>>,
}

pub struct FederationClient {
    local_cluster: ClusterId,
    service_token: String,
    http: reqwest::Client,
    peers: DashMap<ClusterId, PeerConnection>,
}

impl FederationClient {
    pub fn new(local_cluster: ClusterId, service_token: impl Into<String>) -> Self {
        Self {
            local_cluster,
            service_token: service_token.into(),
            http: reqwest::Client::new(),
            peers: DashMap::new(),
        }
    }

    pub fn register_peer(&self, cluster: ClusterId, federation_address: impl Into<String>) {
        self.peers
            .entry(cluster)
            .and_modify(|c| c.federation_address = federation_address.into())
            .or_insert_with(|| PeerConnection {
                federation_address: "".to_string(),
                outbound: None,
            });
    }

    pub fn remove_peer(&self, cluster: &ClusterId) {
        self.peers.remove(cluster);
    }

    pub fn known_peers(&self) -> Vec<ClusterId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn set_outbound(&self, cluster: ClusterId, sender: mpsc::UnboundedSender<PeerFrame>) {
        if let Some(mut entry) = self.peers.get_mut(&cluster) {
            entry.outbound = Some(sender);
        }
    }

    pub fn clear_outbound(&self, cluster: &ClusterId) {
        if let Some(mut entry) = self.peers.get_mut(cluster) {
            entry.outbound = None;
        }
    }

    /// Send one frame on the peer's outbound `PeerChannel`, if connected.
    /// Droppable frames (per `PeerFrame::is_droppable`) are silently
    /// discarded when no channel exists; non-droppable frames return an
    /// error so the caller can decide whether to reconnect and retry.
    pub fn send_frame(&self, peer: &ClusterId, frame: PeerFrame) -> Result<()> {
        let Some(entry) = self.peers.get(peer) else {
            return if frame.is_droppable() {
                Ok(())
            } else {
                Err(FoghornError::transient(format!("no channel to {peer}")))
            };
        };
        match &entry.outbound {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| FoghornError::transient(format!("send to {peer} failed, channel closed"))),
            None => {
                if frame.is_droppable() {
                    Ok(())
                } else {
                    Err(FoghornError::transient(format!("no channel to {peer}")))
                }
            }
        }
    }

    fn address_of(&self, peer: &ClusterId) -> Result<String> {
        self.peers
            .get(peer)
            .map(|c| c.federation_address.clone())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| FoghornError::not_found(format!("no known address for peer {peer}")))
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url).timeout(RPC_TIMEOUT);
        if !self.service_token.is_empty() {
            builder = builder.bearer_auth(&self.service_token);
        }
        builder
    }

    async fn send_json<T: for<'de> serde::Deserialize<'de>>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let resp = req
            .send()
            .await
            .map_err(|e| FoghornError::transient(format!("peer rpc failed: {e}")))?;
        if !resp.status().is_success() {
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(FoghornError::not_found("peer resource"));
            }
            return Err(FoghornError::transient(format!("peer returned {}", resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| FoghornError::transient(format!("peer response decode failed: {e}")))
    }

    pub async fn query_stream_rpc(
        &self,
        peer: &ClusterId,
        stream: &StreamName,
        tenant: &TenantId,
        is_source_selection: bool,
    ) -> Result<Vec<ScoredCandidate>> {
        let base = self.address_of(peer)?;
        let body = QueryStreamRequest {
            stream: stream.clone(),
            tenant: tenant.to_string(),
            is_source_selection,
            peer_cluster: self.local_cluster.clone(),
        };
        let req = self
            .request(reqwest::Method::POST, format!("{base}/federation/query_stream"))
            .json(&body);
        let resp: QueryStreamResponse = self.send_json(req).await?;
        Ok(resp.candidates)
    }

    pub async fn notify_origin_pull(
        &self,
        peer: &ClusterId,
        stream: &StreamName,
        source_node: &str,
        dest_node: &str,
    ) -> Result<NotifyOriginPullResponse> {
        let base = self.address_of(peer)?;
        let body = NotifyOriginPullRequest {
            stream: stream.clone(),
            source_node: source_node.to_string(),
            dest_cluster: self.local_cluster.clone(),
            dest_node: dest_node.to_string(),
        };
        let req = self
            .request(reqwest::Method::POST, format!("{base}/federation/notify_origin_pull"))
            .json(&body);
        self.send_json(req).await
    }

    pub async fn migrate_artifact_metadata(
        &self,
        peer: &ClusterId,
        tenant: &TenantId,
    ) -> Result<u64> {
        let base = self.address_of(peer)?;
        let body = MigrateArtifactMetadataRequest {
            tenant: tenant.to_string(),
            source_cluster: self.local_cluster.clone(),
        };
        let req = self
            .request(reqwest::Method::POST, format!("{base}/federation/migrate_artifact_metadata"))
            .json(&body);
        let resp: MigrateArtifactMetadataResponse = self.send_json(req).await?;
        Ok(resp.migrated)
    }

    pub async fn list_tenant_artifacts(
        &self,
        peer: &ClusterId,
        tenant: &TenantId,
    ) -> Result<ListTenantArtifactsResponse> {
        let base = self.address_of(peer)?;
        let req = self.request(
            reqwest::Method::GET,
            format!("{base}/federation/tenants/{tenant}/artifacts"),
        );
        self.send_json(req).await
    }

    /// Dial a peer's `PeerChannel` websocket and hand the connection's
    /// outbound sender back to the caller (`peer_manager` drives the
    /// receive loop and registers the sender via `set_outbound`).
    pub async fn connect_peer_channel(
        &self,
        peer: &ClusterId,
    ) -> Result<(
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    )> {
        let base = self.address_of(peer)?;
        let ws_url = base.replacen("http", "ws", 1) + "/federation/peer_channel";
        let (stream, _resp) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| FoghornError::transient(format!("peer channel dial to {peer} failed: {e}")))?;
        Ok((stream,))
    }
}

#[async_trait]
impl crate::origin_pull::OriginPullClient for FederationClient {
    async fn notify_origin_pull(
        &self,
        peer: &ClusterId,
        stream: &StreamName,
        source_node: &str,
        dest_node: &str,
    ) -> Result<NotifyOriginPullResponse> {
        FederationClient::notify_origin_pull(self, peer, stream, source_node, dest_node).await
    }
}

#[async_trait]
impl PeerQuery for FederationClient {
    async fn query_stream(
        &self,
        peer: &ClusterId,
        stream: &StreamName,
        tenant: &TenantId,
        is_source_selection: bool,
    ) -> Result<Vec<ScoredCandidate>> {
        self.query_stream_rpc(peer, stream, tenant, is_source_selection).await
    }
}

#[async_trait]
impl PeerArtifactClient for FederationClient {
    async fn prepare_artifact(
        &self,
        peer: &ClusterId,
        hash: &ArtifactHash,
        tenant: &TenantId,
        kind: ArtifactType,
    ) -> Result<PrepareArtifactOutcome> {
        let base = self.address_of(peer)?;
        let body = PrepareArtifactRequest {
            hash: hash.to_string(),
            tenant: tenant.to_string(),
            requesting_cluster: self.local_cluster.clone(),
            kind: match kind {
                ArtifactType::Clip => ArtifactKind::Clip,
                ArtifactType::Dvr => ArtifactKind::Dvr,
                ArtifactType::Vod => ArtifactKind::Vod,
            },
        };
        let req = self
            .request(reqwest::Method::POST, format!("{base}/federation/prepare_artifact"))
            .json(&body);
        let resp: PrepareArtifactResponse = self.send_json(req).await?;
        Ok(PrepareArtifactOutcome {
            url: resp.url,
            segment_urls: resp.segment_urls,
            size_bytes: resp.size_bytes,
            ready: resp.ready,
            est_ready_seconds: resp.est_ready_seconds,
            format: resp.format,
            internal_name: resp.internal_name,
        })
    }

    async fn forward_command(
        &self,
        peer: &ClusterId,
        command: AccessCommand,
        hash: &ArtifactHash,
        tenant: &TenantId,
    ) -> Result<bool> {
        let base = self.address_of(peer)?;
        let body = ForwardArtifactCommandRequest {
            command: match command {
                AccessCommand::Delete => ArtifactCommand::Delete,
                AccessCommand::Stop => ArtifactCommand::Stop,
            },
            hash: hash.to_string(),
            tenant: tenant.to_string(),
        };
        let req = self
            .request(reqwest::Method::POST, format!("{base}/federation/forward_artifact_command"))
            .json(&body);
        let resp: ForwardArtifactCommandResponse = self.send_json(req).await?;
        Ok(resp.handled)
    }
}

/// Encode one outbound frame as a tungstenite text message, matching the
/// JSON encoding the server side decodes in `handle_peer_socket`.
pub fn encode_frame(frame: &PeerFrame) -> Result<WsMessage> {
    let text = serde_json::to_string(frame)?;
    Ok(WsMessage::Text(text.into()))
}

pub fn decode_frame(msg: &WsMessage) -> Option<PeerFrame> {
    match msg {
        WsMessage::Text(text) => serde_json::from_str(text).ok(),
        _ => None,
    }
}

//! `Registry` collaborator (§6): the external tenant/stream-metadata and
//! peer-discovery service. Modeled as a trait so `SourceResolver` and
//! `PeerManager` can be tested against an in-memory fake without a live
//! registry, following the out-of-process-client shape of
//! `networking::discovery::etcd` in the teacher.

use crate::error::Result;
use crate::types::{ClusterId, PlaybackId, StreamName, TenantId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateStreamKeyResponse {
    pub tenant_id: TenantId,
    pub stream_id: String,
    pub stream_name: StreamName,
    pub origin_cluster_id: ClusterId,
    pub cluster_peers: Vec<PeerDescriptor>,
    pub push_targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvePlaybackIdResponse {
    pub stream_name: StreamName,
    pub origin_cluster_id: ClusterId,
    pub cluster_peers: Vec<PeerDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub cluster_id: ClusterId,
    pub federation_address: String,
    pub shared_tenants: Vec<TenantId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInternalName {
    pub internal_name: String,
    pub format: String,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn validate_stream_key(
        &self,
        stream_key: &str,
        cluster_id: &ClusterId,
    ) -> Result<ValidateStreamKeyResponse>;

    async fn resolve_playback_id(&self, pbid: &PlaybackId) -> Result<ResolvePlaybackIdResponse>;

    async fn list_peers(&self, cluster_id: &ClusterId) -> Result<Vec<PeerDescriptor>>;

    async fn resolve_artifact_playback_id(&self, pbid: &PlaybackId) -> Result<String>;

    async fn resolve_artifact_internal_name(&self, hash: &str) -> Result<ArtifactInternalName>;

    async fn resolve_clip_hash(&self, pbid: &PlaybackId) -> Result<String>;

    async fn resolve_dvr_hash(&self, pbid: &PlaybackId) -> Result<String>;
}

/// `reqwest`-based client. Every call carries the caller's deadline as a
/// per-request timeout, per §5's cancellation rules.
pub struct HttpRegistryClient {
    base_url: String,
    service_token: String,
    client: reqwest::Client,
}

impl HttpRegistryClient {
    pub fn new(base_url: impl Into<String>, service_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            service_token: service_token.into(),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.service_token)
            .timeout(Duration::from_secs(2))
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let resp = req
            .send()
            .await
            .map_err(|e| crate::error::FoghornError::transient(format!("registry request failed: {e}")))?;
        if !resp.status().is_success() {
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(crate::error::FoghornError::not_found("registry resource"));
            }
            return Err(crate::error::FoghornError::transient(format!(
                "registry returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| crate::error::FoghornError::transient(format!("registry response decode failed: {e}")))
    }
}

#[async_trait]
impl Registry for HttpRegistryClient {
    async fn validate_stream_key(
        &self,
        stream_key: &str,
        cluster_id: &ClusterId,
    ) -> Result<ValidateStreamKeyResponse> {
        let req = self
            .request(reqwest::Method::GET, "/streams/validate")
            .query(&[("stream_key", stream_key), ("cluster_id", cluster_id.as_str())]);
        self.send_json(req).await
    }

    async fn resolve_playback_id(&self, pbid: &PlaybackId) -> Result<ResolvePlaybackIdResponse> {
        let req = self.request(reqwest::Method::GET, &format!("/playback/{}", pbid));
        self.send_json(req).await
    }

    async fn list_peers(&self, cluster_id: &ClusterId) -> Result<Vec<PeerDescriptor>> {
        let req = self
            .request(reqwest::Method::GET, "/peers")
            .query(&[("cluster_id", cluster_id.as_str())]);
        self.send_json(req).await
    }

    async fn resolve_artifact_playback_id(&self, pbid: &PlaybackId) -> Result<String> {
        let req = self.request(reqwest::Method::GET, &format!("/artifacts/playback/{}", pbid));
        self.send_json(req).await
    }

    async fn resolve_artifact_internal_name(&self, hash: &str) -> Result<ArtifactInternalName> {
        let req = self.request(reqwest::Method::GET, &format!("/artifacts/{}/internal-name", hash));
        self.send_json(req).await
    }

    async fn resolve_clip_hash(&self, pbid: &PlaybackId) -> Result<String> {
        let req = self.request(reqwest::Method::GET, &format!("/clips/{}/hash", pbid));
        self.send_json(req).await
    }

    async fn resolve_dvr_hash(&self, pbid: &PlaybackId) -> Result<String> {
        let req = self.request(reqwest::Method::GET, &format!("/dvr/{}/hash", pbid));
        self.send_json(req).await
    }
}

/// In-memory fake used by tests and by `foghorn-ctl`'s offline planner
/// dry-run, where no live registry exists to ask.
#[derive(Default)]
pub struct FakeRegistry {
    pub peers: Vec<PeerDescriptor>,
    pub origin_cluster: Option<ClusterId>,
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn validate_stream_key(
        &self,
        stream_key: &str,
        cluster_id: &ClusterId,
    ) -> Result<ValidateStreamKeyResponse> {
        Ok(ValidateStreamKeyResponse {
            tenant_id: TenantId::new("tenant-1"),
            stream_id: stream_key.to_string(),
            stream_name: StreamName::normalize(stream_key),
            origin_cluster_id: self.origin_cluster.clone().unwrap_or_else(|| cluster_id.clone()),
            cluster_peers: self.peers.clone(),
            push_targets: Vec::new(),
        })
    }

    async fn resolve_playback_id(&self, pbid: &PlaybackId) -> Result<ResolvePlaybackIdResponse> {
        Ok(ResolvePlaybackIdResponse {
            stream_name: StreamName::new(pbid.as_str().to_string()),
            origin_cluster_id: self.origin_cluster.clone().unwrap_or_else(|| ClusterId::new("local")),
            cluster_peers: self.peers.clone(),
        })
    }

    async fn list_peers(&self, _cluster_id: &ClusterId) -> Result<Vec<PeerDescriptor>> {
        Ok(self.peers.clone())
    }

    async fn resolve_artifact_playback_id(&self, pbid: &PlaybackId) -> Result<String> {
        Ok(pbid.as_str().to_string())
    }

    async fn resolve_artifact_internal_name(&self, hash: &str) -> Result<ArtifactInternalName> {
        Ok(ArtifactInternalName {
            internal_name: hash.to_string(),
            format: "mp4".to_string(),
        })
    }

    async fn resolve_clip_hash(&self, pbid: &PlaybackId) -> Result<String> {
        Ok(pbid.as_str().to_string())
    }

    async fn resolve_dvr_hash(&self, pbid: &PlaybackId) -> Result<String> {
        Ok(pbid.as_str().to_string())
    }
}

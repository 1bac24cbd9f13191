//! `ArtifactAccess` — resolves a clip/DVR/VOD hash to a local path, a peer
//! cluster, or a cold-storage presigned URL (§4.10), plus the two-tier
//! command propagation model (push via `origin_cluster_id`, forward via
//! fan-out) for cross-cluster delete/stop commands.
//!
//! Grounded on `clustering::dht`'s hash-keyed node-lookup shape for the
//! local/peer resolution path; presigned-URL signing is new, built on the
//! `hmac`/`sha2`/`base64` crates the teacher already carries (there, for
//! at-rest encryption; here, for their literal HMAC-signing purpose).

use crate::error::{FoghornError, Result};
use crate::state::{ArtifactState, ArtifactStatus, ArtifactType, StateStore, StorageLocation};
use crate::types::{ArtifactHash, ClusterId, TenantId};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const CLIP_VOD_URL_TTL: Duration = Duration::from_secs(15 * 60);
pub const DVR_URL_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub enum ArtifactLocation {
    Local { path: String },
    Presigned { url: String },
    PresignedSegments { segments: HashMap<String, String> },
    RemotePending { est_ready_seconds: u64 },
}

/// What `PrepareArtifact` (§4.7) returns to a peer calling us.
#[derive(Debug, Clone)]
pub struct PrepareArtifactOutcome {
    pub url: Option<String>,
    pub segment_urls: Option<HashMap<String, String>>,
    pub size_bytes: u64,
    pub ready: bool,
    pub est_ready_seconds: Option<u64>,
    pub format: String,
    pub internal_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactCommand {
    Delete,
    Stop,
}

/// What `ArtifactAccess` needs from the federation layer to reach a peer:
/// ask it to prepare an artifact, or forward a command to it. Kept as a
/// trait so tests can fake federation without a live client.
#[async_trait]
pub trait PeerArtifactClient: Send + Sync {
    async fn prepare_artifact(
        &self,
        peer: &ClusterId,
        hash: &ArtifactHash,
        tenant: &TenantId,
        kind: ArtifactType,
    ) -> Result<PrepareArtifactOutcome>;

    async fn forward_command(
        &self,
        peer: &ClusterId,
        command: ArtifactCommand,
        hash: &ArtifactHash,
        tenant: &TenantId,
    ) -> Result<bool>;
}

/// Where to find a peer that might be holding a given hash. Backed by the
/// `ArtifactAdvertisement` index `PeerManager` maintains from the peer
/// channel (§4.8).
pub trait ArtifactAdIndex: Send + Sync {
    fn peer_for_hash(&self, hash: &ArtifactHash) -> Option<ClusterId>;
    fn known_peers(&self) -> Vec<ClusterId>;
}

pub struct ArtifactAccess {
    local_cluster: ClusterId,
    state: Arc<StateStore>,
    peers: Arc<dyn PeerArtifactClient>,
    ad_index: Arc<dyn ArtifactAdIndex>,
    hmac_secret: Vec<u8>,
    presign_base_url: String,
}

impl ArtifactAccess {
    pub fn new(
        local_cluster: ClusterId,
        state: Arc<StateStore>,
        peers: Arc<dyn PeerArtifactClient>,
        ad_index: Arc<dyn ArtifactAdIndex>,
        hmac_secret: Vec<u8>,
        presign_base_url: impl Into<String>,
    ) -> Self {
        Self {
            local_cluster,
            state,
            peers,
            ad_index,
            hmac_secret,
            presign_base_url: presign_base_url.into(),
        }
    }

    fn sign(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_secret).expect("hmac accepts any key length");
        mac.update(message.as_bytes());
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Produce a presigned GET URL valid until `ttl` from now.
    fn presign(&self, hash: &ArtifactHash, filename: &str, ttl: Duration) -> String {
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .checked_add(ttl)
            .unwrap_or_default()
            .as_secs();
        let to_sign = format!("{}:{}:{}", hash, filename, expires);
        let sig = self.sign(&to_sign);
        format!(
            "{}/artifacts/{}/{}?expires={}&sig={}",
            self.presign_base_url, hash, filename, expires, sig
        )
    }

    /// Viewer-facing resolution (§4.10 steps 1-3): local file, then
    /// cold-storage presigned URL, then a peer's `PrepareArtifact`.
    pub async fn resolve(
        &self,
        hash: &ArtifactHash,
        tenant: &TenantId,
    ) -> Result<ArtifactLocation> {
        if let Some(node) = self.state.find_node_by_artifact_hash(hash).await {
            if let Some(node_state) = self.state.get_node(&node).await {
                return Ok(ArtifactLocation::Local {
                    path: format!("{}/artifacts/{}", node_state.base_url, hash),
                });
            }
        }

        if let Some(artifact) = self.state.get_artifact(hash).await {
            if artifact.storage_location == StorageLocation::S3 {
                return Ok(self.presign_for(&artifact));
            }
        }

        let Some(peer) = self.ad_index.peer_for_hash(hash) else {
            return Err(FoghornError::not_found(format!("artifact {hash} has no known location")));
        };

        let artifact_kind = self
            .state
            .get_artifact(hash)
            .await
            .map(|a| a.kind)
            .unwrap_or(ArtifactType::Vod);

        let outcome = self
            .peers
            .prepare_artifact(&peer, hash, tenant, artifact_kind)
            .await?;

        if !outcome.ready {
            return Ok(ArtifactLocation::RemotePending {
                est_ready_seconds: outcome.est_ready_seconds.unwrap_or(30),
            });
        }
        if let Some(segments) = outcome.segment_urls {
            return Ok(ArtifactLocation::PresignedSegments { segments });
        }
        match outcome.url {
            Some(url) => Ok(ArtifactLocation::Presigned { url }),
            None => Err(FoghornError::not_found(format!("artifact {hash} not resolvable"))),
        }
    }

    fn presign_for(&self, artifact: &ArtifactState) -> ArtifactLocation {
        match artifact.kind {
            ArtifactType::Dvr => {
                // DVR artifacts are a set of segment files; a real
                // implementation would enumerate the segment manifest.
                // Without one, vend a single presigned URL for the
                // manifest itself under the same TTL class.
                let mut segments = HashMap::new();
                segments.insert(
                    "manifest.m3u8".to_string(),
                    self.presign(&artifact.hash, "manifest.m3u8", DVR_URL_TTL),
                );
                ArtifactLocation::PresignedSegments { segments }
            }
            ArtifactType::Clip | ArtifactType::Vod => ArtifactLocation::Presigned {
                url: self.presign(&artifact.hash, "asset", CLIP_VOD_URL_TTL),
            },
        }
    }

    /// Federation Server's `PrepareArtifact` handler (§4.7): answer a
    /// peer's request for an artifact we might hold.
    pub async fn prepare_for_peer(
        &self,
        hash: &ArtifactHash,
        _requesting_cluster: &ClusterId,
        kind: ArtifactType,
    ) -> Result<PrepareArtifactOutcome> {
        let artifact = self
            .state
            .get_artifact(hash)
            .await
            .ok_or_else(|| FoghornError::not_found(format!("artifact {hash}")))?;

        match artifact.storage_location {
            StorageLocation::S3 => {
                let location = self.presign_for(&artifact);
                let (url, segment_urls) = match location {
                    ArtifactLocation::Presigned { url } => (Some(url), None),
                    ArtifactLocation::PresignedSegments { segments } => (None, Some(segments)),
                    _ => (None, None),
                };
                Ok(PrepareArtifactOutcome {
                    url,
                    segment_urls,
                    size_bytes: artifact.size,
                    ready: true,
                    est_ready_seconds: None,
                    format: format_for(kind),
                    internal_name: hash.to_string(),
                })
            }
            StorageLocation::Local => {
                // Trigger an async freeze to cold storage and tell the
                // caller to retry; this crate does not itself perform the
                // freeze (that is the media-server sidecar's job), only
                // flips bookkeeping so the next `PrepareArtifact` sees
                // progress.
                self.state
                    .update_artifact_state(hash.clone(), |a| a.storage_location = StorageLocation::Freezing)
                    .await?;
                Ok(PrepareArtifactOutcome {
                    url: None,
                    segment_urls: None,
                    size_bytes: artifact.size,
                    ready: false,
                    est_ready_seconds: Some(30),
                    format: format_for(kind),
                    internal_name: hash.to_string(),
                })
            }
            _ => Ok(PrepareArtifactOutcome {
                url: None,
                segment_urls: None,
                size_bytes: artifact.size,
                ready: false,
                est_ready_seconds: Some(60),
                format: format_for(kind),
                internal_name: hash.to_string(),
            }),
        }
    }

    pub async fn list_tenant_artifacts(&self, tenant: &TenantId) -> Vec<ArtifactState> {
        self.state.all_artifacts_for_tenant(tenant).await
    }

    /// `ForwardArtifactCommand` handler (§4.7): applied only if the
    /// artifact is known locally. The first peer to answer `handled=true`
    /// wins; callers fan out via `fan_out_command`.
    pub async fn handle_local_command(
        &self,
        command: ArtifactCommand,
        hash: &ArtifactHash,
        _tenant: &TenantId,
    ) -> Result<bool> {
        let Some(artifact) = self.state.get_artifact(hash).await else {
            return Ok(false);
        };
        match command {
            ArtifactCommand::Delete => {
                self.state
                    .update_artifact_state(artifact.hash.clone(), |a| a.status = ArtifactStatus::Deleted)
                    .await?;
            }
            ArtifactCommand::Stop => {
                self.state
                    .update_artifact_state(artifact.hash.clone(), |a| a.status = ArtifactStatus::Failed)
                    .await?;
            }
        }
        Ok(true)
    }

    /// Push-then-forward command routing (§4.10). If the artifact's
    /// recorded `origin_cluster_id` is us, handle locally. If it is
    /// unknown locally, fan out to all known peers and accept the first
    /// `handled=true`.
    pub async fn route_command(
        &self,
        command: ArtifactCommand,
        hash: &ArtifactHash,
        tenant: &TenantId,
    ) -> Result<bool> {
        if let Some(artifact) = self.state.get_artifact(hash).await {
            if artifact.origin_cluster == self.local_cluster {
                return self.handle_local_command(command, hash, tenant).await;
            }
            return self
                .peers
                .forward_command(&artifact.origin_cluster, command, hash, tenant)
                .await;
        }

        for peer in self.ad_index.known_peers() {
            match self.peers.forward_command(&peer, command, hash, tenant).await {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "forward_command failed, trying next peer");
                    continue;
                }
            }
        }
        Err(FoghornError::not_found(format!("artifact {hash} not found on any peer")))
    }
}

fn format_for(kind: ArtifactType) -> String {
    match kind {
        ArtifactType::Clip => "mp4".to_string(),
        ArtifactType::Dvr => "hls".to_string(),
        ArtifactType::Vod => "mp4".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kv::memory::MemoryKv;
    use crate::types::InstanceId;

    struct NoPeers;
    #[async_trait]
    impl PeerArtifactClient for NoPeers {
        async fn prepare_artifact(
            &self,
            _peer: &ClusterId,
            _hash: &ArtifactHash,
            _tenant: &TenantId,
            _kind: ArtifactType,
        ) -> Result<PrepareArtifactOutcome> {
            Err(FoghornError::not_found("no peers"))
        }
        async fn forward_command(
            &self,
            _peer: &ClusterId,
            _command: ArtifactCommand,
            _hash: &ArtifactHash,
            _tenant: &TenantId,
        ) -> Result<bool> {
            Ok(false)
        }
    }

    struct EmptyAdIndex;
    impl ArtifactAdIndex for EmptyAdIndex {
        fn peer_for_hash(&self, _hash: &ArtifactHash) -> Option<ClusterId> {
            None
        }
        fn known_peers(&self) -> Vec<ClusterId> {
            vec![]
        }
    }

    fn access() -> (ArtifactAccess, Arc<StateStore>) {
        let config = Config::default();
        let kv = Arc::new(MemoryKv::new());
        let state = Arc::new(StateStore::new(
            config.cluster_id.clone(),
            InstanceId::new("i1"),
            kv,
            config.weights,
        ));
        let access = ArtifactAccess::new(
            config.cluster_id.clone(),
            state.clone(),
            Arc::new(NoPeers),
            Arc::new(EmptyAdIndex),
            b"test-secret".to_vec(),
            "https://cdn.example",
        );
        (access, state)
    }

    #[tokio::test]
    async fn resolves_local_artifact_by_node_hash() {
        let (access, state) = access();
        let hash = ArtifactHash::new("abc123");
        state
            .update_node_state(crate::types::NodeId::new("edge-1"), |n| {
                n.base_url = "http://edge-1".to_string();
                n.artifacts.insert(hash.clone());
            })
            .await
            .unwrap();

        let loc = access.resolve(&hash, &TenantId::new("t1")).await.unwrap();
        assert!(matches!(loc, ArtifactLocation::Local { .. }));
    }

    #[tokio::test]
    async fn presigned_url_generated_for_s3_artifact() {
        let (access, state) = access();
        let hash = ArtifactHash::new("clip-1");
        state
            .update_artifact_state(hash.clone(), |a| {
                a.kind = ArtifactType::Clip;
                a.storage_location = StorageLocation::S3;
            })
            .await
            .unwrap();

        let loc = access.resolve(&hash, &TenantId::new("t1")).await.unwrap();
        match loc {
            ArtifactLocation::Presigned { url } => {
                assert!(url.contains("sig="));
                assert!(url.contains("expires="));
            }
            other => panic!("expected presigned url, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn not_found_when_no_local_no_peer() {
        let (access, _state) = access();
        let err = access
            .resolve(&ArtifactHash::new("missing"), &TenantId::new("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FoghornError::NotFound(_)));
    }

    #[tokio::test]
    async fn route_command_handles_locally_owned_artifact() {
        let (access, state) = access();
        let hash = ArtifactHash::new("own-1");
        state
            .update_artifact_state(hash.clone(), |a| a.origin_cluster = access_local_cluster())
            .await
            .unwrap();
        let handled = access
            .route_command(ArtifactCommand::Delete, &hash, &TenantId::new("t1"))
            .await
            .unwrap();
        assert!(handled);
        let artifact = state.get_artifact(&hash).await.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Deleted);
    }

    fn access_local_cluster() -> ClusterId {
        Config::default().cluster_id
    }
}

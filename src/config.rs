//! Process configuration, loaded entirely from environment variables.
//!
//! `spec.md` names environment variables as the authoritative configuration
//! surface and specifies no config file format, so `Config::from_env` is the
//! only constructor that matters in production; `Config::default()` exists
//! for tests and for `foghorn-ctl`'s offline planner dry-run.

use crate::types::ClusterId;
use std::env;
use std::time::Duration;

/// Balancer scoring weights (§4.3). Defaults match the spec exactly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancerWeights {
    pub cpu_weight: i64,
    pub ram_weight: i64,
    pub bandwidth_weight: i64,
    pub geo_weight: i64,
    pub stream_bonus: i64,
    pub cross_cluster_penalty: i64,
}

impl Default for BalancerWeights {
    fn default() -> Self {
        Self {
            cpu_weight: 500,
            ram_weight: 500,
            bandwidth_weight: 1000,
            geo_weight: 1000,
            stream_bonus: 50,
            cross_cluster_penalty: 200,
        }
    }
}

/// Selectable `SharedKV` deployment topology (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvTopology {
    Single,
    Replicated,
    Sharded,
}

impl KvTopology {
    fn from_env(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "replicated" => KvTopology::Replicated,
            "sharded" => KvTopology::Sharded,
            _ => KvTopology::Single,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cluster_id: ClusterId,
    pub instance_id: String,
    pub shared_kv_url: Option<String>,
    pub kv_topology: KvTopology,
    /// Base URL of the tenant/registry collaborator (§6). Absent in
    /// development, where `registry_client::FakeRegistry` stands in.
    pub registry_url: Option<String>,
    pub weights: BalancerWeights,
    pub geoip_mmdb_path: Option<String>,
    pub tls: TlsConfig,
    pub service_token: String,
    pub federation_base_url: String,
    pub http_bind: String,
    pub federation_bind: String,
    /// How often `PeerManager` runs a full `ListPeers` reconciliation (§4.8).
    pub reconciliation_interval: Duration,
    /// Staleness threshold behind the `NodeState` online invariant (§3).
    pub node_staleness_threshold: Duration,
}

impl Config {
    /// Load configuration from the environment variables named in `spec.md`
    /// §6. Panics only where the source specifies a variable is required;
    /// everything else falls back to a documented default.
    pub fn from_env() -> Self {
        let cluster_id = ClusterId::new(
            env::var("CLUSTER_ID").unwrap_or_else(|_| "default".to_string()),
        );
        let instance_id = env::var("FOGHORN_INSTANCE_ID")
            .expect("FOGHORN_INSTANCE_ID is required: used as the leader-lease value");

        let weights = BalancerWeights {
            cpu_weight: env_i64("CPU_WEIGHT", 500),
            ram_weight: env_i64("RAM_WEIGHT", 500),
            bandwidth_weight: env_i64("BANDWIDTH_WEIGHT", 1000),
            geo_weight: env_i64("GEO_WEIGHT", 1000),
            stream_bonus: env_i64("STREAM_BONUS", 50),
            cross_cluster_penalty: env_i64("CROSS_CLUSTER_PENALTY", 200),
        };

        Self {
            cluster_id,
            instance_id,
            shared_kv_url: env::var("SHARED_KV_URL").ok(),
            kv_topology: env::var("SHARED_KV_MODE")
                .map(|v| KvTopology::from_env(&v))
                .unwrap_or(KvTopology::Single),
            registry_url: env::var("REGISTRY_URL").ok(),
            weights,
            geoip_mmdb_path: env::var("GEOIP_MMDB_PATH").ok(),
            tls: TlsConfig {
                cert_path: env::var("GRPC_TLS_CERT_PATH").ok(),
                key_path: env::var("GRPC_TLS_KEY_PATH").ok(),
            },
            service_token: env::var("SERVICE_TOKEN").unwrap_or_default(),
            federation_base_url: env::var("FEDERATION_BASE_URL")
                .unwrap_or_else(|_| "foghorn.local".to_string()),
            http_bind: env::var("HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            federation_bind: env::var("FEDERATION_BIND")
                .unwrap_or_else(|_| "0.0.0.0:18019".to_string()),
            reconciliation_interval: Duration::from_secs(300),
            node_staleness_threshold: Duration::from_secs(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_id: ClusterId::new("default"),
            instance_id: "dev-instance".to_string(),
            shared_kv_url: None,
            kv_topology: KvTopology::Single,
            registry_url: None,
            weights: BalancerWeights::default(),
            geoip_mmdb_path: None,
            tls: TlsConfig {
                cert_path: None,
                key_path: None,
            },
            service_token: String::new(),
            federation_base_url: "foghorn.local".to_string(),
            http_bind: "0.0.0.0:8080".to_string(),
            federation_bind: "0.0.0.0:18019".to_string(),
            reconciliation_interval: Duration::from_secs(300),
            node_staleness_threshold: Duration::from_secs(30),
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_match_spec() {
        let w = BalancerWeights::default();
        assert_eq!(w.cpu_weight, 500);
        assert_eq!(w.ram_weight, 500);
        assert_eq!(w.bandwidth_weight, 1000);
        assert_eq!(w.geo_weight, 1000);
        assert_eq!(w.stream_bonus, 50);
        assert_eq!(w.cross_cluster_penalty, 200);
    }

    #[test]
    fn topology_parses_case_insensitively() {
        assert_eq!(KvTopology::from_env("Replicated"), KvTopology::Replicated);
        assert_eq!(KvTopology::from_env("SHARDED"), KvTopology::Sharded);
        assert_eq!(KvTopology::from_env("bogus"), KvTopology::Single);
    }
}

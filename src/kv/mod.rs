//! `SharedKV` — the coordination layer every orchestrator replica writes
//! through (§4.1). Three deployment topologies are selectable at boot; this
//! crate implements `memory` (the `single` topology) fully and models
//! `replicated`/`sharded` as the same trait object, constructed differently
//! at startup, per the open-question decision recorded in `SPEC_FULL.md`.
//!
//! Every key a component writes MUST already carry the `{cluster_id}:`
//! prefix — `SharedKV` itself is topology-agnostic and does not add it,
//! mirroring how sharding is documented to key off that prefix as a shard
//! hint rather than a property the store enforces.

pub mod memory;

use crate::config::{Config, KvTopology};
use crate::error::{FoghornError, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

#[async_trait]
pub trait SharedKV: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `ttl = None` means the key never expires (used for local-state
    /// records, which per the TTL-discipline invariant must never carry
    /// one).
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Atomic: succeeds (returns `true`) only if `key` was absent.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Atomic check-and-renew: extends `key`'s TTL only if its current
    /// value equals `expected_owner`. A lost lease (value changed or key
    /// gone) MUST NOT be renewed — this is the primitive leader election
    /// and artifact leases both build on.
    async fn renew_lease(&self, key: &str, expected_owner: &str, ttl: Duration) -> Result<bool>;

    async fn publish(&self, channel: &str, message: String) -> Result<()>;

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

/// Construct the configured topology. Only `single` has a concrete,
/// non-vendored implementation in this crate (see `SPEC_FULL.md` §C.4);
/// `replicated`/`sharded` are accepted as configuration values but
/// currently resolve to the same in-process store, since this crate does
/// not vendor a specific external KV product for them.
pub fn build(config: &Config) -> Arc<dyn SharedKV> {
    match config.kv_topology {
        KvTopology::Single | KvTopology::Replicated | KvTopology::Sharded => {
            Arc::new(memory::MemoryKv::new())
        }
    }
}

/// Bounded jittered-backoff retry for SharedKV writes, per the §4.1
/// failure semantics: transient failures are retried within a bounded
/// window, after which the caller must treat it as fatal and keep serving
/// from its in-memory view.
pub async fn with_retry<T, F, Fut>(deadline: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(FoghornError::Transient(msg)) => {
                if start.elapsed() >= deadline {
                    return Err(FoghornError::fatal(format!(
                        "shared kv unreachable after {:?}: {msg}",
                        start.elapsed()
                    )));
                }
                attempt += 1;
                let base_ms = 10u64.saturating_mul(1 << attempt.min(6));
                let jitter = rand::rng().random_range(0..=base_ms);
                tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn with_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<i32> = with_retry(Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_deadline() {
        let result: Result<i32> =
            with_retry(Duration::from_millis(30), || async {
                Err(FoghornError::transient("kv down"))
            })
            .await;
        assert!(matches!(result, Err(FoghornError::Fatal(_))));
    }
}

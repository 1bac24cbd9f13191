//! In-process `SharedKV` backend for the `single` topology.
//!
//! Grounded on the teacher's query cache (TTL bookkeeping via an expiry
//! timestamp checked on read, swept periodically) and its `DashMap`
//! migration pattern for the underlying store.

use super::SharedKV;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if Instant::now() >= t)
    }
}

pub struct MemoryKv {
    store: DashMap<String, Entry>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

const CHANNEL_CAPACITY: usize = 256;

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            store: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    fn get_live(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.store.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.store.remove(key);
                return None;
            }
            return Some(entry.value.clone());
        }
        None
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedKV for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_live(key))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.store.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        if self.get_live(key).is_some() {
            return Ok(false);
        }
        use dashmap::mapref::entry::Entry as DashEntry;
        let inserted = match self.store.entry(key.to_string()) {
            DashEntry::Occupied(mut occ) => {
                if occ.get().is_expired() {
                    occ.insert(Entry {
                        value,
                        expires_at: Some(Instant::now() + ttl),
                    });
                    true
                } else {
                    false
                }
            }
            DashEntry::Vacant(vac) => {
                vac.insert(Entry {
                    value,
                    expires_at: Some(Instant::now() + ttl),
                });
                true
            }
        };
        Ok(inserted)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        let mut expired: Vec<String> = Vec::new();
        for entry in self.store.iter() {
            if !entry.key().starts_with(prefix) {
                continue;
            }
            if entry.value().is_expired() {
                expired.push(entry.key().clone());
                continue;
            }
            out.push((entry.key().clone(), entry.value().value.clone()));
        }
        for k in expired {
            self.store.remove(&k);
        }
        Ok(out)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        Ok(keys.iter().map(|k| self.get_live(k)).collect())
    }

    async fn renew_lease(&self, key: &str, expected_owner: &str, ttl: Duration) -> Result<bool> {
        use dashmap::mapref::entry::Entry as DashEntry;
        match self.store.entry(key.to_string()) {
            DashEntry::Occupied(mut occ) => {
                if occ.get().is_expired() || occ.get().value != expected_owner {
                    return Ok(false);
                }
                occ.insert(Entry {
                    value: expected_owner.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
            DashEntry::Vacant(_) => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        if let Some(sender) = self.channels.get(channel) {
            // A channel with no subscribers currently listening is not an
            // error: pub/sub delivery is best-effort, matching the
            // write-through-then-publish sequence which never blocks on a
            // subscriber being present.
            let _ = sender.send(message);
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let kv = MemoryKv::new();
        kv.set("c1:nodes:edge-1", "payload".into(), None).await.unwrap();
        assert_eq!(
            kv.get("c1:nodes:edge-1").await.unwrap(),
            Some("payload".to_string())
        );
    }

    #[tokio::test]
    async fn ttl_expires_on_read() {
        let kv = MemoryKv::new();
        kv.set("k", "v".into(), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("leader", "r1".into(), Duration::from_secs(15))
            .await
            .unwrap());
        assert!(!kv.set_if_absent("leader", "r2".into(), Duration::from_secs(15))
            .await
            .unwrap());
        assert_eq!(kv.get("leader").await.unwrap(), Some("r1".to_string()));
    }

    #[tokio::test]
    async fn renew_lease_fails_for_wrong_owner() {
        let kv = MemoryKv::new();
        kv.set_if_absent("leader", "r1".into(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!kv
            .renew_lease("leader", "r2", Duration::from_secs(15))
            .await
            .unwrap());
        assert!(kv
            .renew_lease("leader", "r1", Duration::from_secs(15))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn renew_lease_fails_once_expired() {
        let kv = MemoryKv::new();
        kv.set_if_absent("leader", "r1".into(), Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!kv
            .renew_lease("leader", "r1", Duration::from_secs(15))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn scan_returns_only_matching_prefix() {
        let kv = MemoryKv::new();
        kv.set("c1:nodes:a", "1".into(), None).await.unwrap();
        kv.set("c1:nodes:b", "2".into(), None).await.unwrap();
        kv.set("c2:nodes:a", "3".into(), None).await.unwrap();
        let mut results = kv.scan("c1:nodes:").await.unwrap();
        results.sort();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn publish_subscribe_round_trips() {
        let kv = MemoryKv::new();
        let mut rx = kv.subscribe("foghorn:c1:state_updates");
        kv.publish("foghorn:c1:state_updates", "{\"type\":\"node\"}".into())
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, "{\"type\":\"node\"}");
    }
}

//! Process-local history store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::{HistoryStore, StoreError};

/// Writes between sweeps of expired keys.
const DEFAULT_PURGE_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
struct Slot {
    history: Vec<f64>,
    expires_at: Instant,
}

impl Slot {
    fn new(history: &[f64], ttl: Duration) -> Self {
        Self {
            history: history.to_vec(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory [`HistoryStore`] with per-key expiry.
///
/// Only processes holding a clone of the same store share state, so this is
/// meant for single-process deployments and tests. Clones share one map.
/// Expired keys are swept out every few writes, so a map keyed by many
/// short-lived callers stays bounded by recent traffic.
#[derive(Debug, Clone)]
pub struct MemoryHistoryStore {
    entries: Arc<DashMap<String, Slot>>,
    writes: Arc<AtomicU64>,
    purge_every: u64,
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            writes: Arc::new(AtomicU64::new(0)),
            purge_every: DEFAULT_PURGE_EVERY,
        }
    }
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep expired keys once every `writes` writes instead of the default.
    pub fn with_purge_every(mut self, writes: u64) -> Self {
        self.purge_every = writes.max(1);
        self
    }

    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_every == 0 {
            self.purge_expired();
        }
    }

    /// Drop every expired key, returning how many were removed.
    ///
    /// Expired keys are already invisible to readers; this only reclaims
    /// memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        let purged = before.saturating_sub(self.entries.len());
        trace!(purged = purged, "Purged expired histories");
        purged
    }

    /// Number of keys held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn get(&self, key: &str) -> Result<Vec<f64>, StoreError> {
        let now = Instant::now();
        if let Some(slot) = self.entries.get(key) {
            if slot.is_live(now) {
                return Ok(slot.history.clone());
            }
        }

        self.entries.remove_if(key, |_, slot| !slot.is_live(now));
        Ok(Vec::new())
    }

    async fn set(&self, key: &str, history: &[f64], ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), Slot::new(history, ttl));
        self.record_write();
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[f64],
        history: &[f64],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let matches = if occupied.get().is_live(now) {
                    occupied.get().history.as_slice() == expected
                } else {
                    expected.is_empty()
                };
                if !matches {
                    return Ok(false);
                }
                occupied.insert(Slot::new(history, ttl));
            }
            Entry::Vacant(vacant) => {
                if !expected.is_empty() {
                    return Ok(false);
                }
                vacant.insert(Slot::new(history, ttl));
            }
        }
        self.record_write();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_missing_key_is_empty() {
        let store = MemoryHistoryStore::new();
        assert!(store.get("throttle_user_nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryHistoryStore::new();
        store.set("k", &[3.0, 2.0, 1.0], TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), vec![3.0, 2.0, 1.0]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_keys_expire() {
        let store = MemoryHistoryStore::new();
        store.set("k", &[1.0], Duration::from_millis(20)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.get("k").await.unwrap().is_empty());
        assert!(store.is_empty(), "expired key should be dropped on read");
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryHistoryStore::new();
        store.set("short", &[1.0], Duration::from_millis(10)).await.unwrap();
        store.set("long", &[1.0], TTL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_writes_sweep_expired_keys() {
        let store = MemoryHistoryStore::new().with_purge_every(8);
        for i in 0..10 {
            store.set(&format!("old-{}", i), &[1.0], Duration::from_millis(10)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(30)).await;

        for i in 0..8 {
            store.set(&format!("new-{}", i), &[2.0], TTL).await.unwrap();
        }
        // The sweep on write 16 drops all ten stale keys.
        assert_eq!(store.len(), 8);
    }

    #[tokio::test]
    async fn test_compare_and_set_counts_as_a_write() {
        let store = MemoryHistoryStore::new().with_purge_every(2);
        store.set("stale", &[1.0], Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.compare_and_set("fresh", &[], &[2.0], TTL).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_set_on_absent_key() {
        let store = MemoryHistoryStore::new();

        assert!(!store.compare_and_set("k", &[1.0], &[2.0, 1.0], TTL).await.unwrap());
        assert!(store.compare_and_set("k", &[], &[1.0], TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_compare_and_set_detects_concurrent_write() {
        let store = MemoryHistoryStore::new();
        store.set("k", &[1.0], TTL).await.unwrap();

        let seen = store.get("k").await.unwrap();
        store.set("k", &[1.5, 1.0], TTL).await.unwrap();

        assert!(!store.compare_and_set("k", &seen, &[2.0, 1.0], TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), vec![1.5, 1.0]);
    }

    #[tokio::test]
    async fn test_compare_and_set_treats_expired_as_empty() {
        let store = MemoryHistoryStore::new();
        store.set("k", &[1.0], Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.compare_and_set("k", &[], &[9.0], TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), vec![9.0]);
    }
}

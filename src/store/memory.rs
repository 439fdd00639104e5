//! In-process store. Atomicity comes from a single lock around the map.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::SharedStateStore;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Bytes),
    Counter(i64),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// TTL-aware map behind a mutex. Expired entries are invisible immediately
/// and physically removed on overwrite or by [`MemoryStore::sweep_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "swept expired store entries");
        }
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SharedStateStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.is_live(now) => match &e.value {
                Value::Bytes(b) => Ok(Some(b.clone())),
                Value::Counter(n) => Ok(Some(Bytes::from(n.to_string()))),
            },
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let matches = entries.get(key).is_some_and(|e| {
            e.is_live(now) && matches!(&e.value, Value::Bytes(b) if b.as_ref() == expected)
        });
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn atomic_increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(e) if e.is_live(now) => match &mut e.value {
                Value::Counter(n) => {
                    *n += 1;
                    Ok(*n)
                }
                Value::Bytes(_) => Err(Error::Other(format!("key {key} does not hold a counter"))),
            },
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Counter(1),
                        expires_at: now + ttl,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn purge_expired(&self) -> Result<u64> {
        Ok(self.sweep_expired() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(1);
        assert!(store.set_if_absent("k", Bytes::from_static(b"a"), ttl).await.unwrap());
        assert!(!store.set_if_absent("k", Bytes::from_static(b"b"), ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"a")));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", Bytes::from_static(b"b"), ttl).await.unwrap());
    }

    #[tokio::test]
    async fn conditional_delete_leaves_other_values() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        store.set_if_absent("m", Bytes::from_static(b"owner-b"), ttl).await.unwrap();

        assert!(!store.delete_if_equals("m", b"owner-a").await.unwrap());
        assert_eq!(store.get("m").await.unwrap(), Some(Bytes::from_static(b"owner-b")));
        assert!(store.delete_if_equals("m", b"owner-b").await.unwrap());
        assert_eq!(store.get("m").await.unwrap(), None);
        assert!(!store.delete_if_equals("m", b"owner-b").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_after_window() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        for expected in 1..=3 {
            assert_eq!(store.atomic_increment("c", window).await.unwrap(), expected);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.atomic_increment("c", window).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let store = MemoryStore::new();
        store.set_if_absent("short", Bytes::new(), Duration::from_secs(1)).await.unwrap();
        store.set_if_absent("long", Bytes::new(), Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}

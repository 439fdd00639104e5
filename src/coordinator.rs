//! Request coordinator: at most one concurrent computation per dedup key.
//!
//! The processing marker is a TTL lock taken with the store's set-if-absent.
//! Callers that lose the race poll for the owner's result and, past
//! `wait_timeout`, compute on their own (degraded mode). Store failures
//! disable deduplication for the call instead of failing it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{Instrument, debug, warn};
use uuid::Uuid;

use crate::config::CoordinationConfig;
use crate::error::{BoxError, Error, Result};
use crate::model::{DedupKey, ProcessingMarker, ResultCacheEntry};
use crate::store::{SharedStateStore, bounded};
use crate::telemetry::{metrics, spans};

const LOCAL_CACHE_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub dedup_ttl: Duration,
    pub result_cache_ttl: Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    /// Bound on each store call.
    pub store_timeout: Duration,
    pub local_cache_ttl: Duration,
}

impl From<&CoordinationConfig> for CoordinatorConfig {
    fn from(c: &CoordinationConfig) -> Self {
        Self {
            dedup_ttl: c.dedup_ttl,
            result_cache_ttl: c.result_cache_ttl,
            wait_timeout: c.wait_timeout,
            poll_interval: c.poll_interval,
            store_timeout: c.store_timeout,
            local_cache_ttl: c.local_cache_ttl,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&CoordinationConfig::default())
    }
}

/// Where a coordinated payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// This process saw the result recently.
    LocalCache,
    /// A result entry already existed in the store.
    Cached,
    /// This caller owned the marker and computed.
    Computed,
    /// Another owner computed while this caller waited.
    Awaited,
    /// Computed without deduplication (store down or wait timed out).
    Degraded,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::LocalCache => "local_cache",
            Source::Cached => "cached",
            Source::Computed => "computed",
            Source::Awaited => "awaited",
            Source::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Coordinated {
    pub payload: Bytes,
    pub source: Source,
}

enum Wait {
    /// The owner finished or let go of the key; look again.
    Retry,
    TimedOut,
    StoreDown(Error),
}

pub struct RequestCoordinator<S> {
    store: Arc<S>,
    config: CoordinatorConfig,
    /// Identifies this process in marker ownership.
    node_id: String,
    local: Mutex<HashMap<DedupKey, (Bytes, Instant)>>,
}

impl<S: SharedStateStore> RequestCoordinator<S> {
    pub fn new(store: Arc<S>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            config,
            node_id: format!("pid-{}", std::process::id()),
            local: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Return the result for `key`, computing it at most once across all
    /// concurrent callers while the store is healthy.
    pub async fn coordinate<F, Fut, E>(&self, key: &DedupKey, compute: F) -> Result<Coordinated>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        let span = spans::start_coordinate_span(key);
        let result = self.coordinate_inner(key, compute).instrument(span.clone()).await;
        if let Ok(ref c) = result {
            spans::record_source(&span, c.source.as_str());
            metrics::dedup_outcomes().add(1, &[KeyValue::new("source", c.source.as_str())]);
        }
        result
    }

    async fn coordinate_inner<F, Fut, E>(&self, key: &DedupKey, compute: F) -> Result<Coordinated>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        if let Some(payload) = self.local_get(key) {
            return Ok(Coordinated {
                payload,
                source: Source::LocalCache,
            });
        }

        let deadline = Instant::now() + self.config.wait_timeout;
        let mut waited = false;

        loop {
            match self.lookup(key).await {
                Ok(Some(entry)) => {
                    self.local_put(key, entry.payload.clone());
                    return Ok(Coordinated {
                        payload: entry.payload,
                        source: if waited { Source::Awaited } else { Source::Cached },
                    });
                }
                Ok(None) => {}
                Err(e) => return self.fail_open("get", e, compute).await,
            }

            let owner_id = format!("{}/{}", self.node_id, Uuid::new_v4());
            let marker =
                ProcessingMarker::new(key.clone(), owner_id, self.config.dedup_ttl).encode()?;
            let taken = bounded(
                self.config.store_timeout,
                "set_if_absent",
                self.store
                    .set_if_absent(&key.marker_key(), marker.clone(), self.config.dedup_ttl),
            )
            .await;
            match taken {
                Ok(true) => return self.compute_as_owner(key, marker, compute).await,
                Ok(false) => debug!(%key, "key in flight elsewhere, waiting"),
                Err(e) => return self.fail_open("set_if_absent", e, compute).await,
            }

            waited = true;
            match self.wait_for_owner(key, deadline).await {
                Wait::Retry => continue,
                Wait::TimedOut => {
                    warn!(
                        %key,
                        timeout_ms = self.config.wait_timeout.as_millis() as u64,
                        "wait on in-flight key timed out, computing without dedup"
                    );
                    return compute_direct(compute).await;
                }
                Wait::StoreDown(e) => return self.fail_open("get", e, compute).await,
            }
        }
    }

    /// Poll until a result appears, the marker disappears, or `deadline`.
    async fn wait_for_owner(&self, key: &DedupKey, deadline: Instant) -> Wait {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Wait::TimedOut;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;

            match self.get(&key.result_key()).await {
                Ok(Some(_)) => return Wait::Retry,
                Ok(None) => {}
                Err(e) => return Wait::StoreDown(e),
            }
            match self.get(&key.marker_key()).await {
                Ok(None) => return Wait::Retry,
                Ok(Some(_)) => {}
                Err(e) => return Wait::StoreDown(e),
            }
        }
    }

    async fn compute_as_owner<F, Fut, E>(
        &self,
        key: &DedupKey,
        marker: Bytes,
        compute: F,
    ) -> Result<Coordinated>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        let guard = MarkerGuard {
            store: Arc::clone(&self.store),
            marker_key: key.marker_key(),
            marker,
            timeout: self.config.store_timeout,
            armed: true,
        };

        match compute().await {
            Ok(payload) => {
                let entry =
                    ResultCacheEntry::new(key.clone(), payload.clone(), self.config.result_cache_ttl);
                let written = bounded(
                    self.config.store_timeout,
                    "write_result",
                    self.store.set_if_absent(
                        &key.result_key(),
                        entry.encode(),
                        self.config.result_cache_ttl,
                    ),
                )
                .await;
                if let Err(e) = written {
                    warn!(%key, error = %e, "failed to cache result");
                    metrics::store_unavailable().add(1, &[KeyValue::new("operation", "write_result")]);
                }
                guard.release().await;
                self.local_put(key, payload.clone());
                Ok(Coordinated {
                    payload,
                    source: Source::Computed,
                })
            }
            Err(e) => {
                guard.release().await;
                Err(Error::Compute(e.into()))
            }
        }
    }

    async fn fail_open<F, Fut, E>(&self, operation: &str, err: Error, compute: F) -> Result<Coordinated>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        warn!(operation, error = %err, "store unavailable, dedup disabled for this request");
        metrics::store_unavailable().add(1, &[KeyValue::new("operation", operation.to_string())]);
        compute_direct(compute).await
    }

    /// Read the cached result for `key`, if present and unexpired.
    pub async fn lookup(&self, key: &DedupKey) -> Result<Option<ResultCacheEntry>> {
        let Some(raw) = self.get(&key.result_key()).await? else {
            return Ok(None);
        };
        let entry = ResultCacheEntry::decode(key.clone(), raw)?;
        if entry.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn get(&self, store_key: &str) -> Result<Option<Bytes>> {
        bounded(self.config.store_timeout, "get", self.store.get(store_key)).await
    }

    /// Poll for a result written by someone else, up to `timeout`.
    pub async fn await_result(&self, key: &DedupKey, timeout: Duration) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.lookup(key).await? {
                return Ok(Some(entry.payload));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Drop every locally cached result.
    pub fn invalidate_local(&self) {
        let mut local = self.local.lock();
        let n = local.len();
        local.clear();
        debug!(entries = n, "local result cache cleared");
    }

    fn local_get(&self, key: &DedupKey) -> Option<Bytes> {
        if self.config.local_cache_ttl.is_zero() {
            return None;
        }
        let mut local = self.local.lock();
        match local.get(key) {
            Some((payload, expires)) if Instant::now() < *expires => Some(payload.clone()),
            Some(_) => {
                local.remove(key);
                None
            }
            None => None,
        }
    }

    fn local_put(&self, key: &DedupKey, payload: Bytes) {
        if self.config.local_cache_ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut local = self.local.lock();
        if local.len() >= LOCAL_CACHE_MAX_ENTRIES {
            local.retain(|_, (_, expires)| now < *expires);
            if local.len() >= LOCAL_CACHE_MAX_ENTRIES {
                local.clear();
            }
        }
        local.insert(key.clone(), (payload, now + self.config.local_cache_ttl));
    }
}

async fn compute_direct<F, Fut, E>(compute: F) -> Result<Coordinated>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<Bytes, E>>,
    E: Into<BoxError>,
{
    let payload = compute().await.map_err(|e| Error::Compute(e.into()))?;
    Ok(Coordinated {
        payload,
        source: Source::Degraded,
    })
}

/// Releases the marker even if the owning future is dropped mid-compute.
struct MarkerGuard<S: SharedStateStore> {
    store: Arc<S>,
    marker_key: String,
    /// The encoded marker as written; release deletes only this value.
    marker: Bytes,
    timeout: Duration,
    armed: bool,
}

impl<S: SharedStateStore> MarkerGuard<S> {
    async fn release(mut self) {
        self.armed = false;
        release_marker(&*self.store, &self.marker_key, &self.marker, self.timeout).await;
    }
}

impl<S: SharedStateStore> Drop for MarkerGuard<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let marker_key = std::mem::take(&mut self.marker_key);
        let marker = std::mem::take(&mut self.marker);
        let timeout = self.timeout;
        handle.spawn(async move {
            release_marker(&*store, &marker_key, &marker, timeout).await;
        });
    }
}

/// Delete the marker if it is still ours. A marker that expired and was
/// retaken by another owner is left alone.
async fn release_marker<S: SharedStateStore>(
    store: &S,
    marker_key: &str,
    marker: &Bytes,
    timeout: Duration,
) {
    let released = bounded(
        timeout,
        "delete_if_equals",
        store.delete_if_equals(marker_key, marker),
    )
    .await;
    match released {
        Ok(true) => {}
        Ok(false) => debug!(marker = marker_key, "marker expired or retaken, not releasing"),
        Err(e) => warn!(marker = marker_key, error = %e, "failed to release marker"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn release_leaves_a_retaken_marker_alone() {
        let store = MemoryStore::new();
        let key = DedupKey::from_bytes(b"retaken");
        let ttl = Duration::from_secs(30);
        let ours = ProcessingMarker::new(key.clone(), "owner-a", ttl).encode().unwrap();
        let theirs = ProcessingMarker::new(key.clone(), "owner-b", ttl).encode().unwrap();
        store.set_if_absent(&key.marker_key(), theirs.clone(), ttl).await.unwrap();

        release_marker(&store, &key.marker_key(), &ours, Duration::from_secs(1)).await;
        assert_eq!(store.get(&key.marker_key()).await.unwrap(), Some(theirs.clone()));

        release_marker(&store, &key.marker_key(), &theirs, Duration::from_secs(1)).await;
        assert_eq!(store.get(&key.marker_key()).await.unwrap(), None);
    }
}

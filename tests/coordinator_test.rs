//! Deduplication, caching and degraded-mode behavior of the coordinator.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use stampede::coordinator::{CoordinatorConfig, RequestCoordinator, Source};
use stampede::error::{Error, Result};
use stampede::model::DedupKey;
use stampede::store::{MemoryStore, SharedStateStore};

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        dedup_ttl: Duration::from_secs(30),
        result_cache_ttl: Duration::from_secs(60),
        wait_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(10),
        store_timeout: Duration::from_secs(1),
        local_cache_ttl: Duration::ZERO,
    }
}

fn counting_compute(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
) -> impl FnOnce() -> futures::future::BoxFuture<'static, std::result::Result<Bytes, std::io::Error>> {
    let calls = Arc::clone(calls);
    move || {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(Bytes::from_static(b"generated"))
        })
    }
}

/// A store whose every operation fails, as if the network were down.
struct DownStore;

impl SharedStateStore for DownStore {
    async fn set_if_absent(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<bool> {
        Err(Error::StoreUnavailable("connection refused".into()))
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
        Err(Error::StoreUnavailable("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(Error::StoreUnavailable("connection refused".into()))
    }

    async fn atomic_increment(&self, _key: &str, _ttl: Duration) -> Result<i64> {
        Err(Error::StoreUnavailable("connection refused".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_identical_requests_compute_once() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = RequestCoordinator::new(Arc::clone(&store), config());
    let key = DedupKey::from_bytes(b"a cat in a hat");
    let calls = Arc::new(AtomicUsize::new(0));

    let results = join_all((0..50).map(|_| {
        coordinator.coordinate(&key, counting_compute(&calls, Duration::from_millis(200)))
    }))
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let mut computed = 0;
    for result in results {
        let c = result.unwrap();
        assert_eq!(c.payload, Bytes::from_static(b"generated"));
        match c.source {
            Source::Computed => computed += 1,
            Source::Awaited => {}
            other => panic!("unexpected source {other:?}"),
        }
    }
    assert_eq!(computed, 1);
    // Marker released after the owner finished.
    assert!(store.get(&key.marker_key()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn later_request_is_served_from_cache() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = RequestCoordinator::new(store, config());
    let key = DedupKey::from_bytes(b"prompt");
    let calls = Arc::new(AtomicUsize::new(0));

    let first = coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();
    let second = coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();

    assert_eq!(first.source, Source::Computed);
    assert_eq!(second.source, Source::Cached);
    assert_eq!(second.payload, first.payload);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cached_result_expires_after_ttl() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = RequestCoordinator::new(
        store,
        CoordinatorConfig {
            dedup_ttl: Duration::from_millis(500),
            result_cache_ttl: Duration::from_secs(1),
            ..config()
        },
    );
    let key = DedupKey::from_bytes(b"short lived");
    let calls = Arc::new(AtomicUsize::new(0));

    coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    let again = coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();

    assert_eq!(again.source, Source::Computed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn local_cache_answers_before_store() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = RequestCoordinator::new(
        Arc::clone(&store),
        CoordinatorConfig {
            local_cache_ttl: Duration::from_secs(5),
            ..config()
        },
    );
    let key = DedupKey::from_bytes(b"hot");
    let calls = Arc::new(AtomicUsize::new(0));

    coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();
    let hit = coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(hit.source, Source::LocalCache);

    coordinator.invalidate_local();
    let miss = coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(miss.source, Source::Cached);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn store_outage_degrades_instead_of_failing() {
    let coordinator = RequestCoordinator::new(Arc::new(DownStore), config());
    let key = DedupKey::from_bytes(b"anything");
    let calls = Arc::new(AtomicUsize::new(0));

    let c = coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();

    assert_eq!(c.source, Source::Degraded);
    assert_eq!(c.payload, Bytes::from_static(b"generated"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// A store that accepts connections and then never answers.
struct HangStore;

impl SharedStateStore for HangStore {
    async fn set_if_absent(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<bool> {
        std::future::pending().await
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
        std::future::pending().await
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        std::future::pending().await
    }

    async fn atomic_increment(&self, _key: &str, _ttl: Duration) -> Result<i64> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn hanging_store_degrades_within_store_timeout() {
    let coordinator = RequestCoordinator::new(Arc::new(HangStore), config());
    let key = DedupKey::from_bytes(b"stalled");
    let calls = Arc::new(AtomicUsize::new(0));

    let started = tokio::time::Instant::now();
    let c = tokio::time::timeout(
        Duration::from_secs(60),
        coordinator.coordinate(&key, counting_compute(&calls, Duration::ZERO)),
    )
    .await
    .expect("coordinate must not hang on a stalled store")
    .unwrap();

    assert_eq!(c.source, Source::Degraded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() <= Duration::from_secs(2));

    let err = coordinator.lookup(&key).await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable(_)));
}

#[tokio::test(start_paused = true)]
async fn stuck_owner_times_out_into_degraded_compute() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = RequestCoordinator::new(
        Arc::clone(&store),
        CoordinatorConfig {
            wait_timeout: Duration::from_secs(1),
            ..config()
        },
    );
    let key = DedupKey::from_bytes(b"stuck");
    // Someone else holds the marker and never finishes.
    store
        .set_if_absent(&key.marker_key(), Bytes::from_static(b"{}"), Duration::from_secs(30))
        .await
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let c = coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();

    assert_eq!(c.source, Source::Degraded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Degraded results are not written to the shared cache.
    assert!(coordinator.lookup(&key).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn compute_failure_caches_nothing_and_frees_the_key() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = RequestCoordinator::new(Arc::clone(&store), config());
    let key = DedupKey::from_bytes(b"broken");

    let err = coordinator
        .coordinate(&key, || async {
            Err::<Bytes, _>(std::io::Error::other("generator crashed"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Compute(_)));
    assert!(store.get(&key.marker_key()).await.unwrap().is_none());
    assert!(store.get(&key.result_key()).await.unwrap().is_none());

    let calls = Arc::new(AtomicUsize::new(0));
    let retry = coordinator
        .coordinate(&key, counting_compute(&calls, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(retry.source, Source::Computed);
}

#[tokio::test(start_paused = true)]
async fn await_result_sees_a_later_write() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(RequestCoordinator::new(Arc::clone(&store), config()));
    let key = DedupKey::from_bytes(b"later");

    let writer = {
        let coordinator = Arc::clone(&coordinator);
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            coordinator
                .coordinate(&key, || async { Ok::<_, std::io::Error>(Bytes::from_static(b"late")) })
                .await
        })
    };

    let got = coordinator
        .await_result(&key, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(got, Some(Bytes::from_static(b"late")));
    writer.await.unwrap().unwrap();

    let nothing = coordinator
        .await_result(&DedupKey::from_bytes(b"never"), Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(nothing, None);
}

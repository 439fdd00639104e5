//! End-to-end behavior of the service facade in both execution modes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::json;
use stampede::config::{CoordinationConfig, ExecutionMode};
use stampede::coordinator::Source;
use stampede::error::{BoxError, Error};
use stampede::generator::FnGenerator;
use stampede::queue::{AnyQueue, JobBackend, JobQueue, QueueConfig};
use stampede::service::Service;
use stampede::store::MemoryStore;
use tokio_util::sync::CancellationToken;

type GenerateFn = Box<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, BoxError>> + Send + Sync>;
type TestGenerator = FnGenerator<GenerateFn>;

fn coordination(mode: ExecutionMode) -> CoordinationConfig {
    CoordinationConfig {
        execution_mode: mode,
        poll_interval: Duration::from_millis(10),
        job_poll_interval: Duration::from_millis(10),
        backoff_base: Duration::from_millis(20),
        max_job_attempts: 3,
        ..CoordinationConfig::default()
    }
}

/// Uppercases the payload; fails every call while `fail` is set.
fn generator(calls: &Arc<AtomicUsize>, fail: bool) -> Arc<TestGenerator> {
    let calls = Arc::clone(calls);
    let f: GenerateFn = Box::new(move |payload: Bytes| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if fail {
                return Err::<Bytes, BoxError>("model unavailable".into());
            }
            Ok(Bytes::from(payload.to_ascii_uppercase()))
        }
        .boxed()
    });
    Arc::new(FnGenerator::new(f))
}

fn spawn_workers(
    service: &Service<MemoryStore, TestGenerator>,
    n: usize,
    shutdown: &CancellationToken,
) {
    for slot in 0..n {
        let worker = service.job_worker(format!("worker-{slot}"));
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await });
    }
}

#[tokio::test]
async fn inline_burst_generates_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Service::new(
        Arc::new(MemoryStore::new()),
        generator(&calls, false),
        coordination(ExecutionMode::Inline),
    );
    let request = json!({"prompt": "a red fox", "size": 512});

    let results = join_all((0..20).map(|i| {
        let client = format!("client-{i}");
        let request = request.clone();
        let service = &service;
        async move { service.coordinate(&client, &request).await }
    }))
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for r in results {
        let c = r.unwrap();
        assert_eq!(c.payload, Bytes::from(r#"{"PROMPT":"A RED FOX","SIZE":512}"#));
    }
    let sample = service.metrics().snapshot();
    assert_eq!(sample.total_requests, 20);
    assert_eq!(sample.active_requests, 0);
    assert_eq!(sample.failed_requests, 0);
    assert!(sample.latency_ema_ms.is_some());
}

#[tokio::test]
async fn volatile_fields_do_not_split_the_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Service::new(
        Arc::new(MemoryStore::new()),
        generator(&calls, false),
        coordination(ExecutionMode::Inline),
    )
    .with_volatile_fields(vec!["request_id".to_string()]);

    service
        .coordinate("c", &json!({"prompt": "x", "request_id": 1}))
        .await
        .unwrap();
    let second = service
        .coordinate("c", &json!({"request_id": 2, "prompt": "x"}))
        .await
        .unwrap();
    assert_ne!(second.source, Source::Computed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn queued_mode_runs_misses_on_workers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Service::new(
        Arc::new(MemoryStore::new()),
        generator(&calls, false),
        coordination(ExecutionMode::Queued),
    );
    let shutdown = CancellationToken::new();
    spawn_workers(&service, 2, &shutdown);

    let c = service.coordinate("c", &json!({"prompt": "queued"})).await.unwrap();
    assert_eq!(c.source, Source::Computed);
    assert_eq!(c.payload, Bytes::from(r#"{"PROMPT":"QUEUED"}"#));
    assert_eq!(service.queue().stats().done, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn dead_lettered_job_surfaces_as_exhausted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Service::new(
        Arc::new(MemoryStore::new()),
        generator(&calls, true),
        coordination(ExecutionMode::Queued),
    );
    let shutdown = CancellationToken::new();
    spawn_workers(&service, 1, &shutdown);

    let err = service
        .coordinate("c", &json!({"prompt": "doomed"}))
        .await
        .unwrap_err();
    match err {
        Error::JobExhausted { attempts, error, .. } => {
            assert_eq!(attempts, 3);
            assert!(error.contains("model unavailable"));
        }
        other => panic!("expected JobExhausted, got {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(service.queue().dead_letters().len(), 1);
    assert_eq!(service.metrics().snapshot().failed_requests, 1);

    shutdown.cancel();
}

#[tokio::test]
async fn inline_failure_is_a_compute_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Service::new(
        Arc::new(MemoryStore::new()),
        generator(&calls, true),
        coordination(ExecutionMode::Inline),
    );
    let err = service.coordinate("c", &json!({"p": 1})).await.unwrap_err();
    assert!(matches!(err, Error::Compute(_)));
}

#[tokio::test]
async fn throttled_client_never_reaches_the_generator() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Service::new(
        Arc::new(MemoryStore::new()),
        generator(&calls, false),
        CoordinationConfig {
            base_rate_limit: 2,
            ..coordination(ExecutionMode::Inline)
        },
    );
    for i in 0..2 {
        service.coordinate("greedy", &json!({"n": i})).await.unwrap();
    }
    let err = service.coordinate("greedy", &json!({"n": 99})).await.unwrap_err();
    assert!(matches!(err, Error::Throttled { limit: 2, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(service.metrics().snapshot().total_requests, 2);
}

#[tokio::test]
async fn memory_pressure_releases_caches() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Service::new(
        Arc::new(MemoryStore::new()),
        generator(&calls, false),
        coordination(ExecutionMode::Queued),
    );
    let shutdown = CancellationToken::new();
    spawn_workers(&service, 1, &shutdown);

    let request = json!({"prompt": "cache me"});
    service.coordinate("c", &request).await.unwrap();
    let warm = service.coordinate("c", &request).await.unwrap();
    assert_eq!(warm.source, Source::LocalCache);
    assert_eq!(service.queue().stats().done, 1);

    assert!(service.metrics().observe_memory(2 << 30, 1 << 30));

    assert_eq!(service.queue().stats().done, 0);
    let cold = service.coordinate("c", &request).await.unwrap();
    assert_eq!(cold.source, Source::Cached);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn background_tasks_stop_on_shutdown() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = Service::new(
        Arc::new(MemoryStore::new()),
        generator(&calls, false),
        CoordinationConfig {
            report_interval: Duration::from_millis(10),
            memory_check_interval: Duration::from_millis(10),
            ..coordination(ExecutionMode::Inline)
        },
    );
    service.start_background();
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::timeout(Duration::from_secs(5), service.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn queued_mode_works_over_a_pluggable_queue_backend() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = coordination(ExecutionMode::Queued);
    let queue = Arc::new(AnyQueue::Memory(JobQueue::new(QueueConfig::from(&config))));
    let service = Service::with_queue(
        Arc::new(MemoryStore::new()),
        generator(&calls, false),
        Arc::clone(&queue),
        config,
    );
    let shutdown = CancellationToken::new();
    let worker = service.job_worker("worker-0");
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    let c = service.coordinate("c", &json!({"prompt": "any"})).await.unwrap();
    assert_eq!(c.payload, Bytes::from(r#"{"PROMPT":"ANY"}"#));
    assert_eq!(queue.stats().await.unwrap().done, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    running.await.unwrap();
}

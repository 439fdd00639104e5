//! The inbound entry point: admission, then deduplication, then generation
//! either inline or through the job queue.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionConfig, AdmissionController};
use crate::config::{CoordinationConfig, ExecutionMode};
use crate::coordinator::{Coordinated, CoordinatorConfig, RequestCoordinator};
use crate::error::{Error, Result};
use crate::generator::Generator;
use crate::metrics::MetricsCollector;
use crate::model::{DedupKey, JobOutcome, NewJob};
use crate::queue::{JobBackend, JobQueue, QueueConfig};
use crate::store::SharedStateStore;
use crate::telemetry::metrics;
use crate::worker::JobWorker;

pub struct Service<S, G, Q = JobQueue> {
    store: Arc<S>,
    generator: Arc<G>,
    coordinator: Arc<RequestCoordinator<S>>,
    admission: AdmissionController<S>,
    queue: Arc<Q>,
    metrics: Arc<MetricsCollector>,
    config: CoordinationConfig,
    /// Request fields left out of the dedup key.
    volatile_fields: Vec<String>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: SharedStateStore, G: Generator> Service<S, G> {
    /// A service with an in-process job queue.
    pub fn new(store: Arc<S>, generator: Arc<G>, config: CoordinationConfig) -> Self {
        let queue = Arc::new(JobQueue::new(QueueConfig::from(&config)));
        Self::with_queue(store, generator, queue, config)
    }
}

impl<S: SharedStateStore, G: Generator, Q: JobBackend> Service<S, G, Q> {
    /// A service over any queue backend, e.g. a durable one shared with
    /// out-of-process workers.
    pub fn with_queue(
        store: Arc<S>,
        generator: Arc<G>,
        queue: Arc<Q>,
        config: CoordinationConfig,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let coordinator = Arc::new(RequestCoordinator::new(
            Arc::clone(&store),
            CoordinatorConfig::from(&config),
        ));
        let admission = AdmissionController::new(
            Arc::clone(&store),
            Arc::clone(&metrics),
            AdmissionConfig::from(&config),
        );
        let local = Arc::clone(&coordinator);
        metrics.register_cleanup("local_result_cache", Box::new(move || local.invalidate_local()));
        let jobs = Arc::clone(&queue);
        metrics.register_cleanup(
            "finished_jobs",
            Box::new(move || jobs.shed_finished()),
        );

        Self {
            store,
            generator,
            coordinator,
            admission,
            queue,
            metrics,
            config,
            volatile_fields: Vec::new(),
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn with_volatile_fields(mut self, fields: Vec<String>) -> Self {
        self.volatile_fields = fields;
        self
    }

    /// Start the metrics reporter and the expiry sweeper.
    pub fn start_background(&self) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return;
        }

        background.push(Arc::clone(&self.metrics).spawn_reporter(
            self.config.report_interval,
            self.config.memory_check_interval,
            self.config.memory_threshold_bytes,
            self.shutdown.clone(),
        ));

        let store = Arc::clone(&self.store);
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        let every = self.config.report_interval;
        let retention = self.config.finished_retention;
        background.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if let Err(e) = queue.purge_finished(retention).await {
                    warn!(error = %e, "finished job purge failed");
                }
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => debug!(removed = n, "purged expired store entries"),
                    Err(e) => warn!(error = %e, "store sweep failed"),
                }
            }
        }));

        info!(mode = ?self.config.execution_mode, "service started");
    }

    /// Stop background tasks. Workers are stopped by their supervisor.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.background.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("service stopped");
    }

    /// Serve a JSON request. The dedup key is the canonical request minus
    /// the volatile fields.
    pub async fn coordinate(
        &self,
        client_id: &str,
        request: &serde_json::Value,
    ) -> Result<Coordinated> {
        let volatile: Vec<&str> = self.volatile_fields.iter().map(String::as_str).collect();
        let key = DedupKey::from_fields(request, &volatile);
        let payload = Bytes::from(serde_json::to_vec(request)?);
        self.coordinate_key(client_id, &key, payload).await
    }

    /// Serve a request whose dedup key the caller already computed.
    pub async fn coordinate_key(
        &self,
        client_id: &str,
        key: &DedupKey,
        payload: Bytes,
    ) -> Result<Coordinated> {
        if let Err(e) = self.admission.check(client_id).await {
            metrics::requests().add(1, &[KeyValue::new("outcome", "throttled")]);
            return Err(e);
        }

        self.metrics.record_start();
        let start = Instant::now();
        let result = match self.config.execution_mode {
            ExecutionMode::Inline => {
                self.coordinator
                    .coordinate(key, || self.generator.generate(payload))
                    .await
            }
            ExecutionMode::Queued => {
                self.coordinator
                    .coordinate(key, || self.run_as_job(payload))
                    .await
            }
        };
        let result = result.map_err(surface_job_error);

        self.metrics
            .record_end(start.elapsed().as_secs_f64() * 1000.0, result.is_ok());
        let outcome = match &result {
            Ok(c) => c.source.as_str(),
            Err(_) => "error",
        };
        metrics::requests().add(1, &[KeyValue::new("outcome", outcome)]);
        result
    }

    /// Enqueue the payload and wait for a worker to finish it.
    async fn run_as_job(&self, payload: Bytes) -> Result<Bytes> {
        let id = self.queue.enqueue(NewJob::new(payload)).await?;
        match self.queue.wait(id).await? {
            JobOutcome::Done(output) => Ok(output),
            JobOutcome::DeadLettered { attempts, error } => {
                Err(Error::JobExhausted { id, attempts, error })
            }
        }
    }

    /// A queue worker bound to this service's queue and generator.
    pub fn job_worker(&self, worker_id: impl Into<String>) -> JobWorker<G, Q> {
        JobWorker::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.generator),
            worker_id,
            self.config.job_poll_interval,
        )
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator<S>> {
        &self.coordinator
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }
}

/// Queue errors travel through the coordinator as compute failures. Give
/// callers the dead-letter error itself.
fn surface_job_error(err: Error) -> Error {
    match err {
        Error::Compute(inner) => match inner.downcast::<Error>() {
            Ok(job_err) if matches!(*job_err, Error::JobExhausted { .. }) => *job_err,
            Ok(other) => Error::Compute(other),
            Err(inner) => Error::Compute(inner),
        },
        other => other,
    }
}

//! Job worker: claims jobs, runs the generator, retires them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::generator::Generator;
use crate::error::Error;
use crate::model::{Job, JobStatus};
use crate::queue::{JobBackend, JobQueue};
use crate::telemetry::spans::{record_state_transition, start_job_span};

/// One job-draining loop. Any number can share a queue, in one process or,
/// with a durable queue, across many.
pub struct JobWorker<G, Q = JobQueue> {
    queue: Arc<Q>,
    generator: Arc<G>,
    worker_id: String,
    poll_interval: Duration,
}

impl<G, Q> Clone for JobWorker<G, Q> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            generator: Arc::clone(&self.generator),
            worker_id: self.worker_id.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

impl<G: Generator, Q: JobBackend> JobWorker<G, Q> {
    pub fn new(
        queue: Arc<Q>,
        generator: Arc<G>,
        worker_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            generator,
            worker_id: worker_id.into(),
            poll_interval,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until `shutdown` is cancelled. A job in flight at shutdown is
    /// finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = %self.worker_id, "worker started");
        loop {
            match self
                .queue
                .claim_next(&self.worker_id, self.poll_interval, &shutdown)
                .await
            {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = %self.worker_id, error = %e, "claim failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
    }

    /// Run one claimed job to completion or failure.
    pub async fn execute(&self, job: Job) {
        let span = start_job_span(&job.id, &self.worker_id, job.attempts);
        async {
            record_state_transition(&span, "queued", "running");
            let start = Instant::now();
            let result = self.generator.generate(job.payload.clone()).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(output) => match self.queue.complete(job.id, &self.worker_id, output).await {
                    Ok(()) => {
                        record_state_transition(&span, "running", "done");
                        info!(job = %job.id, duration_ms, "job completed");
                    }
                    Err(e) => discarded(&job, "completion", &e),
                },
                Err(e) => {
                    let message = e.to_string();
                    error!(job = %job.id, attempt = job.attempts, duration_ms, error = %message, "generation failed");
                    match self.queue.fail(job.id, &self.worker_id, &message).await {
                        Ok(JobStatus::DeadLettered) => {
                            record_state_transition(&span, "running", "dead_lettered");
                        }
                        Ok(status) => record_state_transition(&span, "running", &status.to_string()),
                        Err(e) => discarded(&job, "failure", &e),
                    }
                }
            }
        }
        .instrument(span.clone())
        .await
    }
}

/// The lease ran out mid-run and the job belongs to someone else now, or
/// the queue could not be reached.
fn discarded(job: &Job, what: &str, err: &Error) {
    match err {
        Error::LeaseLost { .. } | Error::InvalidTransition { .. } => {
            warn!(job = %job.id, error = %err, "{what} discarded, lease lost")
        }
        _ => error!(job = %job.id, error = %err, "{what} discarded"),
    }
}

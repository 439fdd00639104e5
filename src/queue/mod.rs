//! Retryable job queue with leases, exponential backoff and dead-lettering.
//!
//! [`JobQueue`] keeps jobs in process memory and serves a single service
//! instance and tests. [`PgJobQueue`] keeps them in Postgres, survives
//! restarts and lets worker processes on any host drain the same queue.
//! Both hand a job to one worker at a time and only accept its result from
//! the worker holding the lease.

pub mod memory;
pub mod postgres;

pub use memory::JobQueue;
pub use postgres::PgJobQueue;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use opentelemetry::KeyValue;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinationConfig;
use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobOutcome, JobStatus, NewJob};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Used when a job does not set its own.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub lease_timeout: Duration,
    /// How long `Done` jobs stay queryable before purge.
    pub finished_retention: Duration,
    /// How often waiters re-read a job in a store without notifications.
    pub poll_interval: Duration,
}

impl From<&CoordinationConfig> for QueueConfig {
    fn from(c: &CoordinationConfig) -> Self {
        Self {
            max_attempts: c.max_job_attempts,
            backoff_base: c.backoff_base,
            backoff_max: c.backoff_max,
            lease_timeout: c.job_lease_timeout,
            finished_retention: c.finished_retention,
            poll_interval: c.job_poll_interval,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&CoordinationConfig::default())
    }
}

/// Counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub dead_lettered: usize,
    pub done: usize,
}

impl QueueStats {
    fn count(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Running => self.running += n,
            JobStatus::DeadLettered => self.dead_lettered += n,
            JobStatus::Done => self.done += n,
            JobStatus::Failed => {}
        }
    }
}

/// What workers and the service need from a queue.
///
/// `complete` and `fail` carry the worker id: a worker whose lease ran out
/// gets [`Error::LeaseLost`] or [`Error::InvalidTransition`] and its result
/// is dropped.
pub trait JobBackend: Send + Sync + 'static {
    fn enqueue(&self, new: NewJob) -> impl Future<Output = Result<JobId>> + Send;

    /// Claim the next runnable job, reclaiming expired leases first.
    fn claim(&self, worker_id: &str) -> impl Future<Output = Result<Option<Job>>> + Send;

    /// Wait for a claimable job. `Ok(None)` once `shutdown` fires.
    fn claim_next(
        &self,
        worker_id: &str,
        poll_interval: Duration,
        shutdown: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Job>>> + Send {
        async move {
            loop {
                if let Some(job) = self.claim(worker_id).await? {
                    return Ok(Some(job));
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    /// Running -> Done.
    fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        output: Bytes,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Running -> Failed, then Queued with backoff or DeadLettered once the
    /// attempts are used up. Returns the new status.
    fn fail(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> impl Future<Output = Result<JobStatus>> + Send;

    /// Resolve when the job is Done or DeadLettered.
    fn wait(&self, id: JobId) -> impl Future<Output = Result<JobOutcome>> + Send;

    fn stats(&self) -> impl Future<Output = Result<QueueStats>> + Send;

    /// Forget Done jobs finished more than `older_than` ago.
    fn purge_finished(&self, older_than: Duration) -> impl Future<Output = Result<u64>> + Send;

    /// Drop finished jobs held in process memory. Called under memory
    /// pressure; durable backends hold nothing.
    fn shed_finished(&self) {}
}

/// Either backend, chosen at startup from configuration.
pub enum AnyQueue {
    Memory(JobQueue),
    Postgres(PgJobQueue),
}

impl JobBackend for AnyQueue {
    async fn enqueue(&self, new: NewJob) -> Result<JobId> {
        match self {
            AnyQueue::Memory(q) => JobBackend::enqueue(q, new).await,
            AnyQueue::Postgres(q) => q.enqueue(new).await,
        }
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        match self {
            AnyQueue::Memory(q) => JobBackend::claim(q, worker_id).await,
            AnyQueue::Postgres(q) => q.claim(worker_id).await,
        }
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        poll_interval: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Option<Job>> {
        match self {
            AnyQueue::Memory(q) => {
                JobBackend::claim_next(q, worker_id, poll_interval, shutdown).await
            }
            AnyQueue::Postgres(q) => q.claim_next(worker_id, poll_interval, shutdown).await,
        }
    }

    async fn complete(&self, id: JobId, worker_id: &str, output: Bytes) -> Result<()> {
        match self {
            AnyQueue::Memory(q) => JobBackend::complete(q, id, worker_id, output).await,
            AnyQueue::Postgres(q) => q.complete(id, worker_id, output).await,
        }
    }

    async fn fail(&self, id: JobId, worker_id: &str, error: &str) -> Result<JobStatus> {
        match self {
            AnyQueue::Memory(q) => JobBackend::fail(q, id, worker_id, error).await,
            AnyQueue::Postgres(q) => q.fail(id, worker_id, error).await,
        }
    }

    async fn wait(&self, id: JobId) -> Result<JobOutcome> {
        match self {
            AnyQueue::Memory(q) => JobBackend::wait(q, id).await,
            AnyQueue::Postgres(q) => q.wait(id).await,
        }
    }

    async fn stats(&self) -> Result<QueueStats> {
        match self {
            AnyQueue::Memory(q) => JobBackend::stats(q).await,
            AnyQueue::Postgres(q) => q.stats().await,
        }
    }

    async fn purge_finished(&self, older_than: Duration) -> Result<u64> {
        match self {
            AnyQueue::Memory(q) => JobBackend::purge_finished(q, older_than).await,
            AnyQueue::Postgres(q) => q.purge_finished(older_than).await,
        }
    }

    fn shed_finished(&self) {
        match self {
            AnyQueue::Memory(q) => q.shed_finished(),
            AnyQueue::Postgres(q) => q.shed_finished(),
        }
    }
}

/// Validate a state transition, returning an error if disallowed.
fn validate_transition(from: JobStatus, to: JobStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

/// A worker may retire a job only while the job is running under its lease.
fn check_lease(
    id: JobId,
    status: JobStatus,
    holder: Option<&str>,
    worker_id: &str,
    to: JobStatus,
) -> Result<()> {
    validate_transition(status, to)?;
    if holder != Some(worker_id) {
        return Err(Error::LeaseLost {
            id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(())
}

/// The result a waiter sees once `job` is terminal.
fn outcome(job: &Job) -> JobOutcome {
    match job.status {
        JobStatus::Done => JobOutcome::Done(job.output.clone().unwrap_or_default()),
        _ => JobOutcome::DeadLettered {
            attempts: job.attempts,
            error: job.last_error.clone().unwrap_or_default(),
        },
    }
}

fn record_transition(from: JobStatus, to: JobStatus) {
    metrics::job_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}

/// `base * 2^(attempt-1)`, capped at `max`, plus up to 25% jitter.
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exp).min(max);
    let jitter_ms = (delay.as_millis() / 4).min(u128::from(u64::MAX)) as u64;
    let jitter = rand::rng().random_range(0..=jitter_ms);
    delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(60);
        for (attempt, floor) in [(1, 100), (2, 200), (3, 400), (4, 800)] {
            let d = backoff(attempt, base, max).as_millis() as u64;
            assert!(d >= floor && d <= floor + floor / 4, "attempt {attempt}: {d}ms");
        }
    }

    #[test]
    fn backoff_is_capped() {
        let d = backoff(30, Duration::from_secs(1), Duration::from_secs(10));
        assert!(d >= Duration::from_secs(10) && d <= Duration::from_millis(12_500));
    }

    #[test]
    fn lease_check_rejects_other_holders_and_finished_jobs() {
        let id = JobId::new();
        assert!(check_lease(id, JobStatus::Running, Some("a"), "a", JobStatus::Done).is_ok());
        assert!(matches!(
            check_lease(id, JobStatus::Running, Some("b"), "a", JobStatus::Done),
            Err(Error::LeaseLost { .. })
        ));
        assert!(matches!(
            check_lease(id, JobStatus::Done, None, "a", JobStatus::Done),
            Err(Error::InvalidTransition {
                from: JobStatus::Done,
                to: JobStatus::Done
            })
        ));
        assert!(matches!(
            check_lease(id, JobStatus::Queued, None, "a", JobStatus::Failed),
            Err(Error::InvalidTransition { .. })
        ));
    }
}

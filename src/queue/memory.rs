//! In-process queue. Every transition happens under a single lock, so
//! `claim` hands each job to exactly one worker. A worker that neither
//! completes nor fails a job before its lease runs out loses it: the next
//! `claim` returns it to the queue.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    JobBackend, QueueConfig, QueueStats, backoff, check_lease, outcome, record_transition,
    validate_transition,
};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::{Job, JobId, JobOutcome, JobStatus, NewJob};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    /// Queued jobs in claim order: highest priority first, then FIFO.
    ready: BTreeMap<(Reverse<i32>, u64), JobId>,
    next_seq: u64,
    next_event_seq: u64,
}

impl QueueState {
    fn push_ready(&mut self, id: JobId, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.insert((Reverse(priority), seq), id);
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    /// Woken on enqueue and requeue.
    available: Notify,
    /// Woken when any job reaches a terminal status.
    finished: Notify,
    events: broadcast::Sender<Event>,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            config,
            available: Notify::new(),
            finished: Notify::new(),
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribe to the queue's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Add a job. It becomes claimable after its delay.
    pub fn enqueue(&self, new: NewJob) -> JobId {
        let id = JobId::new();
        let now = Instant::now();
        let created = Utc::now();
        let job = Job {
            id,
            payload: new.payload,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(self.config.max_attempts).max(1),
            priority: new.priority,
            next_run_at: now + new.delay,
            claimed_at: None,
            lease_expires_at: None,
            claimed_by: None,
            last_error: None,
            output: None,
            created_at: created,
            updated_at: created,
        };

        {
            let mut state = self.state.lock();
            state.jobs.insert(id, job);
            state.push_ready(id, new.priority);
            self.emit(
                &mut state,
                EventKind::JobQueued {
                    id,
                    priority: new.priority,
                },
            );
        }

        debug!(job = %id, priority = new.priority, "job enqueued");
        self.available.notify_waiters();
        id
    }

    /// Claim the next runnable job, reclaiming expired leases first.
    pub fn claim(&self, worker_id: &str) -> Option<Job> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.reclaim_locked(&mut state, now);

        let slot = state
            .ready
            .iter()
            .find(|(_, id)| state.jobs.get(id).is_some_and(|j| j.next_run_at <= now))
            .map(|(k, id)| (*k, *id));
        let (ready_key, id) = slot?;
        state.ready.remove(&ready_key);

        let lease = self.config.lease_timeout;
        let job = state.jobs.get_mut(&id)?;
        transition(job, JobStatus::Running).ok()?;
        job.attempts += 1;
        job.claimed_at = Some(now);
        job.lease_expires_at = Some(now + lease);
        job.claimed_by = Some(worker_id.to_string());
        let claimed = job.clone();

        self.emit(
            &mut state,
            EventKind::JobClaimed {
                id,
                worker_id: worker_id.to_string(),
                attempt: claimed.attempts,
            },
        );
        Some(claimed)
    }

    /// Wait for a claimable job until `shutdown`. Wakes on enqueue or every
    /// `poll_interval` (delayed retries and expired leases need the poll).
    pub async fn claim_next(
        &self,
        worker_id: &str,
        poll_interval: Duration,
        shutdown: &CancellationToken,
    ) -> Option<Job> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.claim(worker_id) {
                return Some(job);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Running -> Done, for the worker holding the lease.
    pub fn complete(&self, id: JobId, worker_id: &str, output: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        let job = leased_job(&mut state, id, worker_id, JobStatus::Done)?;
        transition(job, JobStatus::Done)?;
        job.output = Some(output);
        job.lease_expires_at = None;
        let duration_ms = job
            .claimed_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        self.emit(&mut state, EventKind::JobCompleted { id, duration_ms });
        drop(state);

        debug!(job = %id, duration_ms, "job done");
        self.finished.notify_waiters();
        Ok(())
    }

    /// Running -> Failed, then back to Queued with backoff, or to
    /// DeadLettered once `max_attempts` is used up. Returns the new status.
    pub fn fail(&self, id: JobId, worker_id: &str, error: &str) -> Result<JobStatus> {
        let mut state = self.state.lock();
        let job = leased_job(&mut state, id, worker_id, JobStatus::Failed)?;
        transition(job, JobStatus::Failed)?;
        job.last_error = Some(error.to_string());
        job.lease_expires_at = None;
        let (attempts, max, priority) = (job.attempts, job.max_attempts, job.priority);

        if attempts >= max {
            self.emit(
                &mut state,
                EventKind::JobFailed {
                    id,
                    error: error.to_string(),
                    attempt: attempts,
                    retry_in_ms: None,
                },
            );
            self.dead_letter_locked(&mut state, id, format!("exhausted {attempts}/{max} attempts: {error}"));
            drop(state);
            self.finished.notify_waiters();
            return Ok(JobStatus::DeadLettered);
        }

        let delay = backoff(attempts, self.config.backoff_base, self.config.backoff_max);
        if let Some(job) = state.jobs.get_mut(&id) {
            transition(job, JobStatus::Queued)?;
            job.next_run_at = Instant::now() + delay;
            job.claimed_by = None;
        }
        state.push_ready(id, priority);
        self.emit(
            &mut state,
            EventKind::JobFailed {
                id,
                error: error.to_string(),
                attempt: attempts,
                retry_in_ms: Some(delay.as_millis() as u64),
            },
        );
        drop(state);

        warn!(job = %id, attempt = attempts, max, retry_in_ms = delay.as_millis() as u64, error, "job failed, retrying");
        self.available.notify_waiters();
        Ok(JobStatus::Queued)
    }

    /// Return every job whose lease expired to the queue. Returns how many.
    pub fn reclaim_expired(&self) -> usize {
        let mut state = self.state.lock();
        self.reclaim_locked(&mut state, Instant::now())
    }

    fn reclaim_locked(&self, state: &mut QueueState, now: Instant) -> usize {
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.lease_expires_at.is_some_and(|t| t <= now))
            .map(|j| j.id)
            .collect();

        for id in &expired {
            let Some(job) = state.jobs.get_mut(id) else {
                continue;
            };
            let worker_id = job.claimed_by.take().unwrap_or_default();
            let (attempts, max, priority) = (job.attempts, job.max_attempts, job.priority);
            job.lease_expires_at = None;
            job.last_error = Some(format!("lease expired on worker {worker_id}"));

            if attempts >= max {
                self.dead_letter_locked(
                    state,
                    *id,
                    format!("lease expired on final attempt {attempts}/{max} (worker {worker_id})"),
                );
                self.finished.notify_waiters();
                continue;
            }

            if transition(job, JobStatus::Queued).is_err() {
                continue;
            }
            job.next_run_at = now;
            state.push_ready(*id, priority);
            warn!(job = %id, worker = %worker_id, attempt = attempts, "lease expired, job reclaimed");
            self.emit(
                state,
                EventKind::JobReclaimed {
                    id: *id,
                    worker_id,
                    attempt: attempts,
                },
            );
        }
        expired.len()
    }

    fn dead_letter_locked(&self, state: &mut QueueState, id: JobId, reason: String) {
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        if transition(job, JobStatus::DeadLettered).is_err() {
            return;
        }
        job.claimed_by = None;
        let attempts = job.attempts;
        error!(job = %id, attempts, reason = %reason, "job dead-lettered");
        self.emit(state, EventKind::JobDeadLettered { id, reason, attempts });
    }

    /// Resolve when the job is Done or DeadLettered.
    pub async fn wait(&self, id: JobId) -> Result<JobOutcome> {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                let job = state
                    .jobs
                    .get(&id)
                    .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
                if job.status.is_terminal() {
                    return Ok(outcome(job));
                }
            }

            notified.await;
        }
    }

    pub fn get(&self, id: JobId) -> Result<Job> {
        self.state
            .lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    /// Every dead-lettered job, oldest first.
    pub fn dead_letters(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::DeadLettered)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Operator action: give a dead-lettered job a fresh retry budget.
    pub fn retry_dead_letter(&self, id: JobId) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if job.status != JobStatus::DeadLettered {
            return Err(Error::InvalidTransition {
                from: job.status,
                to: JobStatus::Queued,
            });
        }
        transition(job, JobStatus::Queued)?;
        job.attempts = 0;
        job.next_run_at = Instant::now();
        let priority = job.priority;
        state.push_ready(id, priority);
        self.emit(&mut state, EventKind::JobRetried { id });
        drop(state);

        info!(job = %id, "dead-lettered job requeued by operator");
        self.available.notify_waiters();
        Ok(())
    }

    /// Forget Done jobs finished more than `older_than` ago.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, j| !(j.status == JobStatus::Done && j.updated_at <= cutoff));
        let purged = before - state.jobs.len();
        if purged > 0 {
            debug!(purged, "purged finished jobs");
        }
        purged
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            stats.count(job.status, 1);
        }
        stats
    }

    fn emit(&self, state: &mut QueueState, kind: EventKind) {
        state.next_event_seq += 1;
        // No subscribers is fine.
        let _ = self.events.send(Event {
            seq: state.next_event_seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}

/// The job, if `worker_id` holds its lease and it may move to `to`.
fn leased_job<'a>(
    state: &'a mut QueueState,
    id: JobId,
    worker_id: &str,
    to: JobStatus,
) -> Result<&'a mut Job> {
    let job = state
        .jobs
        .get_mut(&id)
        .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
    check_lease(id, job.status, job.claimed_by.as_deref(), worker_id, to)?;
    Ok(job)
}

/// Move `job` to `to` if the lifecycle allows it.
fn transition(job: &mut Job, to: JobStatus) -> Result<()> {
    validate_transition(job.status, to)?;
    record_transition(job.status, to);
    job.status = to;
    job.updated_at = Utc::now();
    Ok(())
}

impl JobBackend for JobQueue {
    async fn enqueue(&self, new: NewJob) -> Result<JobId> {
        Ok(JobQueue::enqueue(self, new))
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        Ok(JobQueue::claim(self, worker_id))
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        poll_interval: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Option<Job>> {
        Ok(JobQueue::claim_next(self, worker_id, poll_interval, shutdown).await)
    }

    async fn complete(&self, id: JobId, worker_id: &str, output: Bytes) -> Result<()> {
        JobQueue::complete(self, id, worker_id, output)
    }

    async fn fail(&self, id: JobId, worker_id: &str, error: &str) -> Result<JobStatus> {
        JobQueue::fail(self, id, worker_id, error)
    }

    async fn wait(&self, id: JobId) -> Result<JobOutcome> {
        JobQueue::wait(self, id).await
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(JobQueue::stats(self))
    }

    async fn purge_finished(&self, older_than: Duration) -> Result<u64> {
        Ok(JobQueue::purge_finished(self, older_than) as u64)
    }

    fn shed_finished(&self) {
        JobQueue::purge_finished(self, Duration::ZERO);
    }
}

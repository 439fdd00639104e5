//! Postgres-backed job queue.
//!
//! Claims pick the next row with `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers never block on or double-claim a job. Lease expiry, backoff and
//! retention are judged by the database clock.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    JobBackend, QueueConfig, QueueStats, backoff, check_lease, outcome, record_transition,
    validate_transition,
};
use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobOutcome, JobStatus, NewJob};

const COLUMNS: &str = "id, payload, status, attempts, max_attempts, priority, next_run_at, \
                       claimed_at, lease_expires_at, claimed_by, last_error, output, \
                       created_at, updated_at";

/// Queue handle over the `jobs` table. Cheap to share behind an `Arc`.
pub struct PgJobQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl PgJobQueue {
    /// Use an existing pool. The `jobs` migration must already have run.
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    /// Every dead-lettered job, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE status = 'dead_lettered' ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    /// Operator action: give a dead-lettered job a fresh retry budget.
    pub async fn retry_dead_letter(&self, id: JobId) -> Result<()> {
        validate_transition(JobStatus::DeadLettered, JobStatus::Queued)?;

        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = 'queued', attempts = 0, next_run_at = now(), updated_at = now()
             WHERE id = $1 AND status = 'dead_lettered'",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let job = self.get(id).await?;
            return Err(Error::InvalidTransition {
                from: job.status,
                to: JobStatus::Queued,
            });
        }

        record_transition(JobStatus::DeadLettered, JobStatus::Queued);
        info!(job = %id, "dead-lettered job requeued by operator");
        Ok(())
    }

    /// Return running jobs whose lease ran out to the queue, or dead-letter
    /// them when that was their last attempt.
    async fn reclaim_expired<'e, E>(&self, executor: E) -> Result<u64>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let reclaimed: Vec<(Uuid, String, i32, Option<String>)> = sqlx::query_as(
            "UPDATE jobs SET
               status = CASE WHEN attempts >= max_attempts THEN 'dead_lettered' ELSE 'queued' END,
               last_error = CASE WHEN attempts >= max_attempts
                 THEN 'lease expired on final attempt ' || attempts || '/' || max_attempts
                      || ' (worker ' || COALESCE(claimed_by, '') || ')'
                 ELSE 'lease expired on worker ' || COALESCE(claimed_by, '') END,
               next_run_at = now(),
               lease_expires_at = NULL,
               claimed_by = NULL,
               updated_at = now()
             WHERE status = 'running' AND lease_expires_at <= now()
             RETURNING id, status, attempts, last_error",
        )
        .fetch_all(executor)
        .await?;

        for (id, status, attempts, reason) in &reclaimed {
            let to: JobStatus = status.parse()?;
            record_transition(JobStatus::Running, to);
            let id = JobId(*id);
            if to == JobStatus::DeadLettered {
                error!(job = %id, attempts, reason = reason.as_deref().unwrap_or_default(), "job dead-lettered");
            } else {
                warn!(job = %id, attempt = attempts, "lease expired, job reclaimed");
            }
        }
        Ok(reclaimed.len() as u64)
    }

    /// Explain why a completion matched no row.
    async fn rejection(&self, id: JobId, worker_id: &str, to: JobStatus) -> Error {
        let row: std::result::Result<Option<(String, Option<String>)>, sqlx::Error> =
            sqlx::query_as("SELECT status, claimed_by FROM jobs WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await;

        let (status, holder) = match row {
            Ok(Some(row)) => row,
            Ok(None) => return Error::NotFound(format!("job {id}")),
            Err(e) => return e.into(),
        };
        let status = match status.parse::<JobStatus>() {
            Ok(status) => status,
            Err(e) => return e,
        };
        match check_lease(id, status, holder.as_deref(), worker_id, to) {
            Err(e) => e,
            // The row changed between the update and this read.
            Ok(()) => Error::InvalidTransition { from: status, to },
        }
    }
}

impl JobBackend for PgJobQueue {
    async fn enqueue(&self, new: NewJob) -> Result<JobId> {
        let id = JobId::new();
        let max_attempts = new.max_attempts.unwrap_or(self.config.max_attempts).max(1);

        sqlx::query(
            "INSERT INTO jobs (id, payload, status, max_attempts, priority, next_run_at)
             VALUES ($1, $2, 'queued', $3, $4, now() + make_interval(secs => $5))",
        )
        .bind(id.0)
        .bind(new.payload.as_ref())
        .bind(max_attempts as i32)
        .bind(new.priority)
        .bind(new.delay.as_secs_f64())
        .execute(&self.pool)
        .await?;

        debug!(job = %id, priority = new.priority, "job enqueued");
        Ok(id)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        validate_transition(JobStatus::Queued, JobStatus::Running)?;

        let mut tx = self.pool.begin().await?;
        self.reclaim_expired(&mut *tx).await?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, claimed_by = $1,
               claimed_at = now(), lease_expires_at = now() + make_interval(secs => $2),
               updated_at = now()
             WHERE id = (
               SELECT id FROM jobs
               WHERE status = 'queued' AND next_run_at <= now()
               ORDER BY priority DESC, seq
               LIMIT 1
               FOR UPDATE SKIP LOCKED
             )
             RETURNING {COLUMNS}"
        ))
        .bind(worker_id)
        .bind(self.config.lease_timeout.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = row.try_into_job()?;
        record_transition(JobStatus::Queued, JobStatus::Running);
        debug!(job = %job.id, worker = worker_id, attempt = job.attempts, "job claimed");
        Ok(Some(job))
    }

    async fn complete(&self, id: JobId, worker_id: &str, output: Bytes) -> Result<()> {
        validate_transition(JobStatus::Running, JobStatus::Done)?;

        let rows_affected = sqlx::query(
            "UPDATE jobs SET status = 'done', output = $3, lease_expires_at = NULL, updated_at = now()
             WHERE id = $1 AND status = 'running' AND claimed_by = $2",
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(output.as_ref())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.rejection(id, worker_id, JobStatus::Done).await);
        }

        record_transition(JobStatus::Running, JobStatus::Done);
        debug!(job = %id, "job done");
        Ok(())
    }

    async fn fail(&self, id: JobId, worker_id: &str, error: &str) -> Result<JobStatus> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, Option<String>, i32, i32)> = sqlx::query_as(
            "SELECT status, claimed_by, attempts, max_attempts FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let (status, holder, attempts, max) =
            row.ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        check_lease(id, status.parse()?, holder.as_deref(), worker_id, JobStatus::Failed)?;

        let next = if attempts >= max {
            JobStatus::DeadLettered
        } else {
            JobStatus::Queued
        };
        validate_transition(JobStatus::Failed, next)?;

        if next == JobStatus::DeadLettered {
            sqlx::query(
                "UPDATE jobs SET status = 'dead_lettered', last_error = $2, claimed_by = NULL,
                   lease_expires_at = NULL, updated_at = now()
                 WHERE id = $1",
            )
            .bind(id.0)
            .bind(format!("exhausted {attempts}/{max} attempts: {error}"))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            record_transition(JobStatus::Running, JobStatus::Failed);
            record_transition(JobStatus::Failed, JobStatus::DeadLettered);
            error!(job = %id, attempts, error, "job dead-lettered");
            return Ok(next);
        }

        let delay = backoff(attempts as u32, self.config.backoff_base, self.config.backoff_max);
        sqlx::query(
            "UPDATE jobs SET status = 'queued', last_error = $2, claimed_by = NULL,
               lease_expires_at = NULL, next_run_at = now() + make_interval(secs => $3),
               updated_at = now()
             WHERE id = $1",
        )
        .bind(id.0)
        .bind(error)
        .bind(delay.as_secs_f64())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        record_transition(JobStatus::Running, JobStatus::Failed);
        record_transition(JobStatus::Failed, JobStatus::Queued);
        warn!(job = %id, attempt = attempts, max, retry_in_ms = delay.as_millis() as u64, error, "job failed, retrying");
        Ok(next)
    }

    async fn wait(&self, id: JobId) -> Result<JobOutcome> {
        loop {
            let job = self.get(id).await?;
            if job.status.is_terminal() {
                return Ok(outcome(&job));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, n) in rows {
            stats.count(status.parse()?, n as usize);
        }
        Ok(stats)
    }

    async fn purge_finished(&self, older_than: Duration) -> Result<u64> {
        let purged = sqlx::query(
            "DELETE FROM jobs
             WHERE status = 'done' AND updated_at <= now() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if purged > 0 {
            debug!(purged, "purged finished jobs");
        }
        Ok(purged)
    }
}

/// Map a database timestamp onto the local monotonic clock.
fn local_instant(at: DateTime<Utc>) -> Instant {
    let now = Instant::now();
    let offset = at - Utc::now();
    match offset.to_std() {
        Ok(ahead) => now.checked_add(ahead).unwrap_or(now),
        Err(_) => (-offset)
            .to_std()
            .ok()
            .and_then(|behind| now.checked_sub(behind))
            .unwrap_or(now),
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload: Vec<u8>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    next_run_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    last_error: Option<String>,
    output: Option<Vec<u8>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            payload: Bytes::from(self.payload),
            status: self.status.parse()?,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            priority: self.priority,
            next_run_at: local_instant(self.next_run_at),
            claimed_at: self.claimed_at.map(local_instant),
            lease_expires_at: self.lease_expires_at.map(local_instant),
            claimed_by: self.claimed_by,
            last_error: self.last_error,
            output: self.output.map(Bytes::from),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn database_times_map_onto_the_local_clock() {
        let now = Instant::now();
        let ahead = local_instant(Utc::now() + chrono::Duration::seconds(30));
        assert!(ahead >= now + Duration::from_secs(29));

        let behind = local_instant(Utc::now() - chrono::Duration::seconds(30));
        assert!(behind <= now);
    }
}

//! Core data model.
//!
//! Keys, markers and cache entries live in the shared store; jobs and worker
//! handles are owned by the queue and the supervisor respectively.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Dedup Key
// ---------------------------------------------------------------------------

/// Deterministic digest identifying semantically identical requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Wrap an already computed digest.
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// SHA-256 over raw bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Digest over the relevant fields of a JSON request.
    ///
    /// Top-level fields named in `volatile` are dropped. Object keys are
    /// sorted recursively before hashing, so field order never matters.
    pub fn from_fields(request: &serde_json::Value, volatile: &[&str]) -> Self {
        let relevant = match request {
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .filter(|(k, _)| !volatile.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        };
        let mut canonical = String::new();
        write_canonical(&relevant, &mut canonical);
        Self::from_bytes(canonical.as_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key of the processing marker for this key.
    pub fn marker_key(&self) -> String {
        format!("marker:{}", self.0)
    }

    /// Store key of the cached result for this key.
    pub fn result_key(&self) -> String {
        format!("result:{}", self.0)
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 12 chars
        let short: String = self.0.chars().take(12).collect();
        write!(f, "{short}")
    }
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Processing Marker
// ---------------------------------------------------------------------------

/// "This key is being computed right now." At most one per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMarker {
    pub key: DedupKey,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl ProcessingMarker {
    pub fn new(key: DedupKey, owner_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key,
            owner_id: owner_id.into(),
            created_at: Utc::now(),
            ttl,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

// ---------------------------------------------------------------------------
// Result Cache Entry
// ---------------------------------------------------------------------------

const ENTRY_HEADER_LEN: usize = 16;

/// A completed result. Immutable once written; only TTL expiry removes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultCacheEntry {
    pub key: DedupKey,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl ResultCacheEntry {
    pub fn new(key: DedupKey, payload: Bytes, ttl: Duration) -> Self {
        Self {
            key,
            payload,
            created_at: Utc::now(),
            ttl,
        }
    }

    /// `None` when the TTL reaches past the representable range.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Frame: created-at millis (i64 BE), ttl millis (u64 BE), payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENTRY_HEADER_LEN + self.payload.len());
        buf.put_i64(self.created_at.timestamp_millis());
        buf.put_u64(self.ttl.as_millis().min(u128::from(u64::MAX)) as u64);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(key: DedupKey, mut data: Bytes) -> Result<Self> {
        if data.len() < ENTRY_HEADER_LEN {
            return Err(Error::Other(format!(
                "result entry for {key} truncated: {} bytes",
                data.len()
            )));
        }
        let created_ms = data.get_i64();
        let ttl_ms = data.get_u64();
        let created_at = Utc
            .timestamp_millis_opt(created_ms)
            .single()
            .ok_or_else(|| Error::Other(format!("result entry for {key} has bad timestamp")))?;
        Ok(Self {
            key,
            payload: data,
            created_at,
            ttl: Duration::from_millis(ttl_ms),
        })
    }
}

// ---------------------------------------------------------------------------
// Rate Window
// ---------------------------------------------------------------------------

/// A client's request count within the current limiting interval.
///
/// The window start lives in the store as the counter's expiry; it is only
/// known locally to the caller whose increment opened the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub client_id: String,
    pub count: u64,
    pub window: Duration,
    pub opened_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_run_at`, then claimable.
    Queued,
    /// Claimed by a worker and leased.
    Running,
    /// Last attempt failed; about to be requeued or dead-lettered.
    Failed,
    /// Retry budget exhausted. Terminal until an operator retries it.
    DeadLettered,
    /// Completed successfully. Terminal.
    Done,
}

impl JobStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Queued)        // lease expired, reclaimed
                | (Running, DeadLettered)  // lease expired on the last attempt
                | (Failed, Queued)         // retry with backoff
                | (Failed, DeadLettered)   // exhausted
                | (DeadLettered, Queued) // operator retry
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::DeadLettered)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
            JobStatus::Done => "done",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "failed" => Ok(JobStatus::Failed),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            "done" => Ok(JobStatus::Done),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

/// A unit of retryable work held by the job queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Opaque to the queue.
    pub payload: Bytes,
    pub status: JobStatus,
    /// Number of claims so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Higher = more urgent.
    pub priority: i32,
    /// Earliest time the job may be claimed.
    pub next_run_at: tokio::time::Instant,
    pub claimed_at: Option<tokio::time::Instant>,
    pub lease_expires_at: Option<tokio::time::Instant>,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub output: Option<Bytes>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Builder for jobs. The queue's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) payload: Bytes,
    pub(crate) priority: i32,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) delay: Duration,
}

impl NewJob {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            priority: 0,
            max_attempts: None,
            delay: Duration::ZERO,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// Delay the first claim.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Final result of a job, as observed by a waiter.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done(Bytes),
    DeadLettered { attempts: u32, error: String },
}

// ---------------------------------------------------------------------------
// Worker Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Healthy,
    Crashed,
    Restarting,
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Healthy => "healthy",
            WorkerStatus::Crashed => "crashed",
            WorkerStatus::Restarting => "restarting",
            WorkerStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Supervisor-side view of one worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub slot: usize,
    /// OS process id, when the worker is a process.
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub restarts: u32,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Metric Sample
// ---------------------------------------------------------------------------

/// Point-in-time view of the request counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub total_requests: u64,
    pub active_requests: u64,
    pub failed_requests: u64,
    pub latency_ema_ms: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub captured_at: DateTime<Utc>,
}

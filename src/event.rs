//! Structured events emitted by the job queue on every state transition.
//!
//! Consumers subscribe to the event stream to build dashboards,
//! alerting, or audit logs. Dead-letter events are how exhausted jobs
//! reach operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::JobId;

/// A structured event emitted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobQueued {
        id: JobId,
        priority: i32,
    },
    JobClaimed {
        id: JobId,
        worker_id: String,
        attempt: u32,
    },
    JobCompleted {
        id: JobId,
        duration_ms: u64,
    },
    JobFailed {
        id: JobId,
        error: String,
        attempt: u32,
        /// Delay before the retry; `None` when the job was dead-lettered.
        retry_in_ms: Option<u64>,
    },
    JobDeadLettered {
        id: JobId,
        reason: String,
        attempts: u32,
    },
    /// A lease expired and the job went back to the queue.
    JobReclaimed {
        id: JobId,
        worker_id: String,
        attempt: u32,
    },
    /// An operator sent a dead-lettered job back to the queue.
    JobRetried {
        id: JobId,
    },
}

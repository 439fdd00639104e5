//! Span helpers for coordinated requests and job execution.

use tracing::Span;

use crate::model::{DedupKey, JobId};

/// Start a span for one coordinated request.
///
/// `coord.source` is declared empty and filled by [`record_source`].
pub fn start_coordinate_span(key: &DedupKey) -> Span {
    tracing::info_span!(
        "coordinate",
        "coord.key" = %key,
        "coord.source" = tracing::field::Empty,
    )
}

/// Record how the result of a coordinated request was obtained.
pub fn record_source(span: &Span, source: &str) {
    span.record("coord.source", source);
}

/// Start a span for job execution on a worker.
pub fn start_job_span(job_id: &JobId, worker_id: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %job_id,
        "job.worker" = worker_id,
        "job.attempt" = attempt,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

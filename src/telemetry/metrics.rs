//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"stampede"` meter.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter(super::INSTRUMENTATION_SCOPE)
}

/// Counter: inbound requests.
/// Labels: `outcome` (a coordination source, "throttled" or "error").
pub fn requests() -> Counter<u64> {
    meter()
        .u64_counter("stampede.requests")
        .with_description("Number of inbound requests")
        .build()
}

/// Counter: how coordinated results were obtained.
/// Labels: `source` ("local_cache" | "cached" | "computed" | "awaited" | "degraded").
pub fn dedup_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("stampede.dedup.outcomes")
        .with_description("Coordinated results by source")
        .build()
}

/// Counter: admission decisions that throttled a client.
/// Labels: `limit`.
pub fn throttled() -> Counter<u64> {
    meter()
        .u64_counter("stampede.admission.throttled")
        .with_description("Requests rejected by admission control")
        .build()
}

/// Counter: store calls that failed and were bypassed.
/// Labels: `operation`.
pub fn store_unavailable() -> Counter<u64> {
    meter()
        .u64_counter("stampede.store.unavailable")
        .with_description("Store failures handled by failing open")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_transitions() -> Counter<u64> {
    meter()
        .u64_counter("stampede.job.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: worker restarts after an unexpected exit.
/// Labels: `slot`.
pub fn worker_restarts() -> Counter<u64> {
    meter()
        .u64_counter("stampede.worker.restarts")
        .with_description("Workers replaced after crashing")
        .build()
}

/// Histogram: request duration in milliseconds.
/// Labels: `success`.
pub fn request_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("stampede.request.duration_ms")
        .with_description("Request duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Gauge: requests currently in flight.
pub fn active_requests() -> Gauge<u64> {
    meter()
        .u64_gauge("stampede.requests.active")
        .with_description("Requests currently in flight")
        .build()
}

/// Gauge: smoothed request latency.
pub fn latency_ema_ms() -> Gauge<f64> {
    meter()
        .f64_gauge("stampede.request.latency_ema_ms")
        .with_description("Exponential moving average of request latency")
        .with_unit("ms")
        .build()
}

/// Gauge: resident memory of this process.
pub fn memory_bytes() -> Gauge<u64> {
    meter()
        .u64_gauge("stampede.process.memory")
        .with_description("Resident memory of the process")
        .with_unit("By")
        .build()
}

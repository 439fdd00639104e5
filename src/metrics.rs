//! Request counters, latency EMA and memory-pressure cleanup.
//!
//! The collector is the local source of the load signal used by admission
//! control. Everything recorded here is mirrored to OTel instruments.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use sysinfo::{Process, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::MetricSample;
use crate::telemetry::metrics;

const EMA_WEIGHT: f64 = 0.1;

/// Released under memory pressure. Must be cheap and non-blocking.
pub type CleanupHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct MetricsCollector {
    total_requests: AtomicU64,
    active_requests: AtomicU64,
    failed_requests: AtomicU64,
    latency_ema_ms: Mutex<Option<f64>>,
    memory_bytes: Mutex<Option<u64>>,
    cleanup_hooks: Mutex<Vec<(String, CleanupHook)>>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request entered the system.
    pub fn record_start(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let active = self.active_requests.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::active_requests().record(active, &[]);
    }

    /// A request left the system.
    pub fn record_end(&self, duration_ms: f64, success: bool) {
        let active = self
            .active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0)
            .saturating_sub(1);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        let ema = {
            let mut ema = self.latency_ema_ms.lock();
            let next = match *ema {
                Some(prev) => prev * (1.0 - EMA_WEIGHT) + duration_ms * EMA_WEIGHT,
                None => duration_ms,
            };
            *ema = Some(next);
            next
        };

        metrics::active_requests().record(active, &[]);
        metrics::latency_ema_ms().record(ema, &[]);
        metrics::request_duration_ms().record(duration_ms, &[KeyValue::new("success", success)]);
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricSample {
        MetricSample {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            latency_ema_ms: *self.latency_ema_ms.lock(),
            memory_bytes: *self.memory_bytes.lock(),
            captured_at: Utc::now(),
        }
    }

    /// Register a hook run when memory crosses the configured threshold.
    pub fn register_cleanup(&self, name: impl Into<String>, hook: CleanupHook) {
        self.cleanup_hooks.lock().push((name.into(), hook));
    }

    /// Run every cleanup hook. Returns how many ran.
    pub fn run_cleanup(&self) -> usize {
        let hooks = self.cleanup_hooks.lock();
        for (name, hook) in hooks.iter() {
            debug!(hook = %name, "running cleanup hook");
            hook();
        }
        hooks.len()
    }

    /// Sample process memory and run cleanup hooks when above `threshold`.
    /// Returns whether cleanup ran.
    pub async fn check_memory(&self, threshold: u64) -> bool {
        let Some(bytes) = sample_process_memory().await else {
            return false;
        };
        self.observe_memory(bytes, threshold)
    }

    /// Record a memory reading; run cleanup hooks if it exceeds `threshold`.
    pub fn observe_memory(&self, bytes: u64, threshold: u64) -> bool {
        *self.memory_bytes.lock() = Some(bytes);
        metrics::memory_bytes().record(bytes, &[]);
        if bytes <= threshold {
            return false;
        }
        let ran = self.run_cleanup();
        warn!(bytes, threshold, hooks = ran, "memory above threshold, released caches");
        true
    }

    /// Periodically log the snapshot and check memory until cancelled.
    pub fn spawn_reporter(
        self: Arc<Self>,
        report_interval: Duration,
        memory_check_interval: Duration,
        memory_threshold: u64,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut report = tokio::time::interval(report_interval);
            let mut memory = tokio::time::interval(memory_check_interval);
            report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            memory.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("metrics reporter stopped");
                        return;
                    }
                    _ = report.tick() => {
                        let s = self.snapshot();
                        info!(
                            total = s.total_requests,
                            active = s.active_requests,
                            failed = s.failed_requests,
                            latency_ema_ms = s.latency_ema_ms.unwrap_or(0.0),
                            memory_bytes = s.memory_bytes.unwrap_or(0),
                            "metrics snapshot"
                        );
                    }
                    _ = memory.tick() => {
                        self.check_memory(memory_threshold).await;
                    }
                }
            }
        })
    }
}

/// Resident memory of this process, if the platform reports it.
pub async fn sample_process_memory() -> Option<u64> {
    let join = tokio::task::spawn_blocking(|| {
        let pid = sysinfo::get_current_pid().ok()?;

        let mut system = System::new_with_specifics(RefreshKind::nothing());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );

        system.process(pid).map(Process::memory)
    });

    match join.await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("process memory sample join failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ema_starts_at_first_sample_then_smooths() {
        let m = MetricsCollector::new();
        m.record_start();
        m.record_end(100.0, true);
        assert_eq!(m.snapshot().latency_ema_ms, Some(100.0));

        m.record_start();
        m.record_end(200.0, true);
        let ema = m.snapshot().latency_ema_ms.unwrap();
        assert!((ema - 110.0).abs() < 1e-9);
    }

    #[test]
    fn counters_track_active_and_failed() {
        let m = MetricsCollector::new();
        m.record_start();
        m.record_start();
        assert_eq!(m.active_requests(), 2);
        m.record_end(5.0, false);
        let s = m.snapshot();
        assert_eq!(s.total_requests, 2);
        assert_eq!(s.active_requests, 1);
        assert_eq!(s.failed_requests, 1);
    }

    #[test]
    fn active_never_underflows() {
        let m = MetricsCollector::new();
        m.record_end(1.0, true);
        assert_eq!(m.active_requests(), 0);
    }

    #[test]
    fn cleanup_runs_only_above_threshold() {
        let m = MetricsCollector::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        m.register_cleanup("counter", Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!m.observe_memory(100, 1000));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(m.observe_memory(2000, 1000));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(m.snapshot().memory_bytes, Some(2000));
    }
}

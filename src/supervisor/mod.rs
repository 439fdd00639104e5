//! Flat worker pool with restart-on-crash.
//!
//! Each slot is watched by its own monitor task. When a worker exits while
//! the supervisor is running, the slot is marked crashed, crash handlers
//! run, and exactly one replacement is spawned. Slots never share state.

pub mod spawner;

pub use spawner::{
    CommandSpawner, SpawnedWorker, TaskSpawner, WORKER_SLOT_ENV, WorkerContext, WorkerExit,
    WorkerSpawner,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoordinationConfig;
use crate::error::{Error, Result};
use crate::model::{WorkerHandle, WorkerStatus};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    /// Pause before retrying a replacement that failed to spawn.
    pub restart_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&CoordinationConfig> for SupervisorConfig {
    fn from(c: &CoordinationConfig) -> Self {
        Self {
            heartbeat_interval: c.heartbeat_interval,
            restart_delay: c.restart_delay,
            shutdown_timeout: c.shutdown_timeout,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&CoordinationConfig::default())
    }
}

/// Delivered to crash handlers for every unexpected worker exit.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub slot: usize,
    pub pid: Option<u32>,
    pub exit: WorkerExit,
    /// Restarts of this slot including the one about to happen.
    pub restarts: u32,
    pub crashed_at: DateTime<Utc>,
}

pub type CrashHandler = Arc<dyn Fn(&CrashReport) + Send + Sync>;

struct Shared<W> {
    spawner: W,
    config: SupervisorConfig,
    handles: Mutex<Vec<WorkerHandle>>,
    handlers: Mutex<Vec<CrashHandler>>,
    shutdown: CancellationToken,
}

impl<W> Shared<W> {
    fn update(&self, slot: usize, f: impl FnOnce(&mut WorkerHandle)) {
        if let Some(handle) = self.handles.lock().get_mut(slot) {
            f(handle);
        }
    }
}

pub struct ProcessSupervisor<W> {
    shared: Arc<Shared<W>>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl<W: WorkerSpawner> ProcessSupervisor<W> {
    pub fn new(spawner: W, config: SupervisorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                spawner,
                config,
                handles: Mutex::new(Vec::new()),
                handlers: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
            monitors: Mutex::new(Vec::new()),
        }
    }

    /// Start `worker_count` workers. Fails if already started.
    pub fn start(&self, worker_count: usize) -> Result<()> {
        if worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".to_string()));
        }
        let mut monitors = self.monitors.lock();
        if !monitors.is_empty() {
            return Err(Error::Other("supervisor already started".to_string()));
        }

        let now = Utc::now();
        *self.shared.handles.lock() = (0..worker_count)
            .map(|slot| WorkerHandle {
                slot,
                pid: None,
                status: WorkerStatus::Starting,
                last_heartbeat: now,
                restarts: 0,
                started_at: now,
            })
            .collect();

        for slot in 0..worker_count {
            monitors.push(tokio::spawn(monitor_slot(Arc::clone(&self.shared), slot)));
        }
        info!(workers = worker_count, "supervisor started");
        Ok(())
    }

    /// Register a handler invoked on every crash, before the restart.
    pub fn on_crash(&self, handler: impl Fn(&CrashReport) + Send + Sync + 'static) {
        self.shared.handlers.lock().push(Arc::new(handler));
    }

    /// Snapshot of every slot.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.shared.handles.lock().clone()
    }

    /// Slots with a live, healthy worker.
    pub fn pool_size(&self) -> usize {
        self.shared
            .handles
            .lock()
            .iter()
            .filter(|h| h.status == WorkerStatus::Healthy)
            .count()
    }

    /// Token cancelled when shutdown begins. Task workers watch it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Stop every worker, waiting up to `shutdown_timeout` per slot.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let monitors: Vec<_> = self.monitors.lock().drain(..).collect();
        for monitor in monitors {
            if let Err(e) = monitor.await {
                warn!("slot monitor ended abnormally: {e}");
            }
        }
        info!("supervisor stopped");
    }
}

async fn monitor_slot<W: WorkerSpawner>(shared: Arc<Shared<W>>, slot: usize) {
    let config = &shared.config;
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let ctx = WorkerContext {
            slot,
            shutdown: shared.shutdown.child_token(),
        };
        let SpawnedWorker { pid, mut exit } = match shared.spawner.spawn(ctx) {
            Ok(worker) => worker,
            Err(e) => {
                error!(slot, error = %e, retry_in_ms = config.restart_delay.as_millis() as u64, "worker spawn failed");
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.restart_delay) => continue,
                }
            }
        };

        let now = Utc::now();
        shared.update(slot, |h| {
            h.pid = pid;
            h.status = WorkerStatus::Healthy;
            h.started_at = now;
            h.last_heartbeat = now;
        });
        debug!(slot, ?pid, "worker healthy");

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let outcome = loop {
            tokio::select! {
                outcome = &mut exit => break Some(outcome),
                _ = shared.shutdown.cancelled() => break None,
                _ = heartbeat.tick() => {
                    let now = Utc::now();
                    shared.update(slot, |h| h.last_heartbeat = now);
                }
            }
        };

        let outcome = match outcome {
            Some(outcome) if !shared.shutdown.is_cancelled() => outcome,
            Some(_) => break,
            None => {
                if tokio::time::timeout(config.shutdown_timeout, &mut exit).await.is_err() {
                    warn!(slot, ?pid, "worker did not stop in time, abandoning");
                }
                break;
            }
        };

        let mut restarts = 0;
        shared.update(slot, |h| {
            h.status = WorkerStatus::Crashed;
            h.restarts += 1;
            restarts = h.restarts;
        });
        let report = CrashReport {
            slot,
            pid,
            exit: outcome,
            restarts,
            crashed_at: Utc::now(),
        };
        warn!(slot, ?pid, exit = %report.exit, restarts, "worker crashed, restarting");
        metrics::worker_restarts().add(1, &[KeyValue::new("slot", slot as i64)]);

        let handlers: Vec<CrashHandler> = shared.handlers.lock().clone();
        for handler in &handlers {
            handler(&report);
        }
        shared.update(slot, |h| h.status = WorkerStatus::Restarting);
    }

    shared.update(slot, |h| {
        h.status = WorkerStatus::Stopped;
        h.pid = None;
    });
}

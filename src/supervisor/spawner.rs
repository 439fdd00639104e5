//! How a supervisor slot turns into a running worker.

use std::path::PathBuf;
use std::process::Stdio;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::process::Command;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

/// Environment variable carrying the slot number to worker processes.
pub const WORKER_SLOT_ENV: &str = "STAMPEDE_WORKER_SLOT";

/// Everything a worker is given. Shared handles (store, queue) travel in
/// the spawner's own closure.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub slot: usize,
    pub shutdown: CancellationToken,
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Clean,
    Failed(String),
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Clean => write!(f, "exited cleanly"),
            WorkerExit::Failed(reason) => write!(f, "{reason}"),
        }
    }
}

/// A worker that has been started. Dropping `exit` stops the worker.
pub struct SpawnedWorker {
    pub pid: Option<u32>,
    pub exit: BoxFuture<'static, WorkerExit>,
}

pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self, ctx: WorkerContext) -> Result<SpawnedWorker>;
}

/// Runs each worker as a tokio task.
pub struct TaskSpawner<F> {
    body: F,
}

impl<F> TaskSpawner<F>
where
    F: Fn(WorkerContext) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
{
    pub fn new(body: F) -> Self {
        Self { body }
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<F> WorkerSpawner for TaskSpawner<F>
where
    F: Fn(WorkerContext) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
{
    fn spawn(&self, ctx: WorkerContext) -> Result<SpawnedWorker> {
        let handle = tokio::spawn((self.body)(ctx));
        let guard = AbortOnDrop(handle.abort_handle());
        let exit = async move {
            let _guard = guard;
            match handle.await {
                Ok(Ok(())) => WorkerExit::Clean,
                Ok(Err(e)) => WorkerExit::Failed(e.to_string()),
                Err(e) if e.is_panic() => WorkerExit::Failed("worker panicked".to_string()),
                Err(e) => WorkerExit::Failed(e.to_string()),
            }
        }
        .boxed();
        Ok(SpawnedWorker { pid: None, exit })
    }
}

/// Runs each worker as an OS child process.
///
/// The child's stdin is closed when shutdown begins; well-behaved workers
/// exit on EOF. Children still running when the exit future is dropped
/// are killed.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, ctx: WorkerContext) -> Result<SpawnedWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_SLOT_ENV, ctx.slot.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        debug!(slot = ctx.slot, ?pid, program = %self.program.display(), "worker process spawned");

        let exit = async move {
            let stdin = child.stdin.take();
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = ctx.shutdown.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    drop(stdin);
                    child.wait().await
                }
            };
            match status {
                Ok(s) if s.success() => WorkerExit::Clean,
                Ok(s) => WorkerExit::Failed(s.to_string()),
                Err(e) => WorkerExit::Failed(format!("wait failed: {e}")),
            }
        }
        .boxed();
        Ok(SpawnedWorker { pid, exit })
    }
}

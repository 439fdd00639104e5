//! The content-generation collaborator.
//!
//! The coordination layer never knows how content is produced. It hands a
//! payload to a [`Generator`] and caches whatever comes back.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{BoxError, Error};

pub trait Generator: Send + Sync + 'static {
    fn generate(&self, payload: Bytes) -> impl Future<Output = Result<Bytes, BoxError>> + Send;
}

impl<G: Generator> Generator for Arc<G> {
    fn generate(&self, payload: Bytes) -> impl Future<Output = Result<Bytes, BoxError>> + Send {
        (**self).generate(payload)
    }
}

/// Wraps an async closure.
pub struct FnGenerator<F>(F);

impl<F> FnGenerator<F>
where
    F: Fn(Bytes) -> BoxFuture<'static, Result<Bytes, BoxError>> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Generator for FnGenerator<F>
where
    F: Fn(Bytes) -> BoxFuture<'static, Result<Bytes, BoxError>> + Send + Sync + 'static,
{
    fn generate(&self, payload: Bytes) -> impl Future<Output = Result<Bytes, BoxError>> + Send {
        (self.0)(payload)
    }
}

/// Runs an external executable: payload on stdin, content on stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    async fn run(&self, payload: Bytes) -> crate::error::Result<Bytes> {
        // Relative paths resolve against the process CWD.
        let program = if self.program.is_relative() && self.program.components().count() > 1 {
            std::env::current_dir()?.join(&self.program)
        } else {
            self.program.clone()
        };

        debug!(program = %program.display(), bytes = payload.len(), "running generator");

        let mut child = Command::new(&program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while draining stdout; a child that streams output
        // would otherwise block on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if output.status.success() {
            match fed {
                // The child may exit without reading all of its input.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e.into()),
                _ => Ok(Bytes::from(output.stdout)),
            }
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Other(format!(
                "generator exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }
}

impl Generator for CommandGenerator {
    fn generate(&self, payload: Bytes) -> impl Future<Output = Result<Bytes, BoxError>> + Send {
        async move { self.run(payload).await.map_err(BoxError::from) }
    }
}

//! stampede CLI: run the coordination service or a supervised worker pool.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use secrecy::ExposeSecret;
use stampede::config::{Config, ExecutionMode};
use stampede::error::BoxError;
use stampede::generator::{CommandGenerator, Generator};
use stampede::http::{self, AppState};
use stampede::model::DedupKey;
use stampede::queue::{AnyQueue, JobQueue, PgJobQueue, QueueConfig};
use stampede::service::Service;
use stampede::store::{AnyStore, MemoryStore, PgStore};
use stampede::supervisor::{
    CommandSpawner, CrashReport, ProcessSupervisor, SupervisorConfig, TaskSpawner,
    WORKER_SLOT_ENV, WorkerContext,
};
use stampede::telemetry::{TelemetryConfig, init_telemetry};
use stampede::worker::JobWorker;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "stampede", about = "Request coordination for generation services under load")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordination service with an HTTP endpoint
    Serve {
        /// Queue workers to supervise (defaults to the configured worker_count)
        #[arg(long)]
        workers: Option<usize>,
        /// Executable that reads a request on stdin and writes content to stdout.
        /// Without it, requests are echoed back.
        #[arg(long)]
        generator: Option<PathBuf>,
        /// How cache misses are executed
        #[arg(long, value_enum)]
        mode: Option<ExecutionMode>,
        /// Listen address (defaults to the configured http_addr)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Supervise a pool of worker processes, restarting any that exit
    Supervise {
        /// Number of worker processes
        #[arg(long)]
        workers: Option<usize>,
        /// Worker command and its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Drain the durable job queue until stdin closes or Ctrl-C. Meant to run
    /// under `supervise`; requires STORE_URL.
    Work {
        /// Executable that reads a job payload on stdin and writes content to stdout.
        /// Without it, payloads are echoed back.
        #[arg(long)]
        generator: Option<PathBuf>,
    },
    /// Print the dedup key of a JSON request
    Key {
        /// Field to leave out of the key (repeatable)
        #[arg(long = "volatile")]
        volatile: Vec<String>,
        /// The request as JSON
        request: String,
    },
    /// Print the effective coordination settings as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            workers,
            generator,
            mode,
            addr,
        } => cmd_serve(workers, generator, mode, addr).await,
        Command::Supervise { workers, command } => cmd_supervise(workers, command).await,
        Command::Work { generator } => cmd_work(generator).await,
        Command::Key { volatile, request } => cmd_key(&volatile, &request),
        Command::Config => {
            let config = Config::from_env()?;
            print!("{}", config.coordination.to_toml_string()?);
            Ok(())
        }
    }
}

/// Either an external generator or a passthrough for trying the service out.
enum CliGenerator {
    Command(CommandGenerator),
    Echo,
}

impl Generator for CliGenerator {
    async fn generate(&self, payload: Bytes) -> Result<Bytes, BoxError> {
        match self {
            CliGenerator::Command(g) => g.generate(payload).await,
            CliGenerator::Echo => Ok(payload),
        }
    }
}

fn cli_generator(path: Option<PathBuf>) -> CliGenerator {
    match path {
        Some(path) => CliGenerator::Command(CommandGenerator::new(path)),
        None => CliGenerator::Echo,
    }
}

/// Postgres store and durable queue when STORE_URL is set, in-memory
/// otherwise.
async fn open_backends(config: &Config) -> anyhow::Result<(AnyStore, AnyQueue)> {
    let queue_config = QueueConfig::from(&config.coordination);
    match &config.store_url {
        Some(url) => {
            let store = PgStore::connect(url.expose_secret()).await?;
            store.migrate().await?;
            let queue = PgJobQueue::new(store.pool().clone(), queue_config);
            info!("using postgres shared store and job queue");
            Ok((AnyStore::Postgres(store), AnyQueue::Postgres(queue)))
        }
        None => {
            info!("STORE_URL not set, using in-memory store and job queue");
            Ok((
                AnyStore::Memory(MemoryStore::new()),
                AnyQueue::Memory(JobQueue::new(queue_config)),
            ))
        }
    }
}

fn log_crash(report: &CrashReport) {
    warn!(
        slot = report.slot,
        pid = ?report.pid,
        exit = %report.exit,
        restarts = report.restarts,
        "worker crashed"
    );
}

async fn cmd_serve(
    workers: Option<usize>,
    generator: Option<PathBuf>,
    mode: Option<ExecutionMode>,
    addr: Option<String>,
) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(n) = workers {
        config.coordination.worker_count = n;
    }
    if let Some(mode) = mode {
        config.coordination.execution_mode = mode;
    }
    if let Some(addr) = addr {
        config.coordination.http_addr = addr;
    }
    config.coordination.validate()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "stampede".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let (store, queue) = open_backends(&config).await?;
    let generator = Arc::new(cli_generator(generator));
    let coordination = config.coordination.clone();
    let service = Arc::new(Service::with_queue(
        Arc::new(store),
        generator,
        Arc::new(queue),
        coordination.clone(),
    ));
    service.start_background();

    let svc = Arc::clone(&service);
    let supervisor = Arc::new(ProcessSupervisor::new(
        TaskSpawner::new(move |ctx: WorkerContext| {
            let worker = svc.job_worker(format!("worker-{}", ctx.slot));
            async move {
                worker.run(ctx.shutdown).await;
                Ok::<_, stampede::Error>(())
            }
            .boxed()
        }),
        SupervisorConfig::from(&coordination),
    ));
    supervisor.on_crash(log_crash);
    supervisor.start(coordination.worker_count)?;

    let sup = Arc::clone(&supervisor);
    let app = http::router(AppState::new(
        Arc::clone(&service),
        Arc::new(move || sup.pool_size()),
    ));
    let listener = tokio::net::TcpListener::bind(&coordination.http_addr).await?;
    info!(addr = %coordination.http_addr, mode = ?coordination.execution_mode, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
        })
        .await?;

    supervisor.shutdown().await;
    service.shutdown().await;
    Ok(())
}

async fn cmd_supervise(workers: Option<usize>, command: Vec<String>) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "stampede-supervisor".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("no worker command given");
    };
    let count = workers.unwrap_or(config.coordination.worker_count);

    let supervisor = ProcessSupervisor::new(
        CommandSpawner::new(program, args.to_vec()),
        SupervisorConfig::from(&config.coordination),
    );
    supervisor.on_crash(log_crash);
    supervisor.start(count)?;
    info!(workers = count, program = %program, "supervising");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    supervisor.shutdown().await;
    Ok(())
}

async fn cmd_work(generator: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    config.coordination.validate()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "stampede-worker".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let Some(url) = &config.store_url else {
        anyhow::bail!("STORE_URL must be set: workers drain the durable job queue");
    };
    let store = PgStore::connect(url.expose_secret()).await?;
    store.migrate().await?;
    let queue = Arc::new(PgJobQueue::new(
        store.pool().clone(),
        QueueConfig::from(&config.coordination),
    ));

    let slot = std::env::var(WORKER_SLOT_ENV).unwrap_or_else(|_| "0".to_string());
    let worker_id = format!("worker-{slot}-{}", std::process::id());
    let worker = JobWorker::new(
        queue,
        Arc::new(cli_generator(generator)),
        worker_id.clone(),
        config.coordination.job_poll_interval,
    );

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        // The supervisor closes our stdin to ask for a graceful stop.
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        let closed = async {
            while let Ok(n) = stdin.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        };
        tokio::select! {
            _ = closed => info!("stdin closed"),
            _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        }
        stop.cancel();
    });

    info!(worker = %worker_id, "draining job queue");
    worker.run(shutdown).await;
    Ok(())
}

fn cmd_key(volatile: &[String], request: &str) -> anyhow::Result<()> {
    let request: serde_json::Value = serde_json::from_str(request)?;
    let volatile: Vec<&str> = volatile.iter().map(String::as_str).collect();
    println!("{}", DedupKey::from_fields(&request, &volatile).as_str());
    Ok(())
}

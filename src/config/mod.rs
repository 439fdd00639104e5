//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast on invalid settings.
//! The store URL is wrapped in secrecy::SecretString to prevent log leaks.

mod duration;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    /// Postgres URL of the shared store. `None` selects the in-memory store.
    pub store_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub coordination: CoordinationConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// `STAMPEDE_CONFIG` may point at a TOML file with coordination
    /// settings; `STAMPEDE_*` variables override individual fields.
    pub fn from_env() -> Result<Self> {
        let mut coordination = match std::env::var("STAMPEDE_CONFIG") {
            Ok(path) => CoordinationConfig::from_toml_file(Path::new(&path))?,
            Err(_) => CoordinationConfig::default(),
        };
        coordination.apply_env()?;
        coordination.validate()?;

        Ok(Self {
            store_url: std::env::var("STORE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            coordination,
        })
    }
}

/// How a cache miss is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The caller runs the generator itself.
    Inline,
    /// The miss becomes a job; queue workers run the generator.
    Queued,
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inline" => Ok(ExecutionMode::Inline),
            "queued" => Ok(ExecutionMode::Queued),
            other => Err(Error::Config(format!("unknown execution mode: {other}"))),
        }
    }
}

/// Above `above` concurrently active requests, clients get `limit` per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadThreshold {
    pub above: u64,
    pub limit: u32,
}

/// Every tunable of the coordination layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// TTL of the processing marker.
    #[serde(with = "duration")]
    pub dedup_ttl: Duration,
    #[serde(with = "duration")]
    pub result_cache_ttl: Duration,
    /// How long a caller waits on another owner before computing itself.
    #[serde(with = "duration")]
    pub wait_timeout: Duration,
    /// Poll interval while waiting on another owner.
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    /// Upper bound on any single store call. A store slower than this is
    /// treated as unavailable.
    #[serde(with = "duration")]
    pub store_timeout: Duration,
    /// Per-process cache of results already seen. Zero disables it.
    #[serde(with = "duration")]
    pub local_cache_ttl: Duration,

    pub base_rate_limit: u32,
    #[serde(with = "duration")]
    pub rate_window: Duration,

    pub max_job_attempts: u32,
    #[serde(with = "duration")]
    pub backoff_base: Duration,
    #[serde(with = "duration")]
    pub backoff_max: Duration,
    #[serde(with = "duration")]
    pub job_lease_timeout: Duration,
    #[serde(with = "duration")]
    pub job_poll_interval: Duration,
    /// How long finished jobs stay queryable.
    #[serde(with = "duration")]
    pub finished_retention: Duration,

    pub worker_count: usize,
    #[serde(with = "duration")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration")]
    pub restart_delay: Duration,
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,

    pub memory_threshold_bytes: u64,
    #[serde(with = "duration")]
    pub report_interval: Duration,
    #[serde(with = "duration")]
    pub memory_check_interval: Duration,

    pub execution_mode: ExecutionMode,
    pub http_addr: String,

    /// Sorted by `above`, ascending.
    pub load_thresholds: Vec<LoadThreshold>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: Duration::from_secs(30),
            result_cache_ttl: Duration::from_secs(3600),
            wait_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            store_timeout: Duration::from_secs(2),
            local_cache_ttl: Duration::from_secs(5),
            base_rate_limit: 60,
            rate_window: Duration::from_secs(60),
            max_job_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            job_lease_timeout: Duration::from_secs(60),
            job_poll_interval: Duration::from_secs(1),
            finished_retention: Duration::from_secs(600),
            worker_count: num_cpus::get(),
            heartbeat_interval: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            memory_threshold_bytes: 1 << 30,
            report_interval: Duration::from_secs(30),
            memory_check_interval: Duration::from_secs(60),
            execution_mode: ExecutionMode::Inline,
            http_addr: "127.0.0.1:8080".to_string(),
            load_thresholds: vec![
                LoadThreshold {
                    above: 500,
                    limit: 45,
                },
                LoadThreshold {
                    above: 1000,
                    limit: 30,
                },
            ],
        }
    }
}

impl CoordinationConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bad coordination config: {e}")))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("cannot render config: {e}")))
    }

    /// Override fields from `STAMPEDE_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        env_duration("STAMPEDE_DEDUP_TTL", &mut self.dedup_ttl)?;
        env_duration("STAMPEDE_RESULT_CACHE_TTL", &mut self.result_cache_ttl)?;
        env_duration("STAMPEDE_WAIT_TIMEOUT", &mut self.wait_timeout)?;
        env_duration("STAMPEDE_POLL_INTERVAL", &mut self.poll_interval)?;
        env_duration("STAMPEDE_STORE_TIMEOUT", &mut self.store_timeout)?;
        env_duration("STAMPEDE_LOCAL_CACHE_TTL", &mut self.local_cache_ttl)?;
        env_parse("STAMPEDE_BASE_RATE_LIMIT", &mut self.base_rate_limit)?;
        env_duration("STAMPEDE_RATE_WINDOW", &mut self.rate_window)?;
        env_parse("STAMPEDE_MAX_JOB_ATTEMPTS", &mut self.max_job_attempts)?;
        env_duration("STAMPEDE_BACKOFF_BASE", &mut self.backoff_base)?;
        env_duration("STAMPEDE_BACKOFF_MAX", &mut self.backoff_max)?;
        env_duration("STAMPEDE_JOB_LEASE_TIMEOUT", &mut self.job_lease_timeout)?;
        env_duration("STAMPEDE_JOB_POLL_INTERVAL", &mut self.job_poll_interval)?;
        env_duration("STAMPEDE_FINISHED_RETENTION", &mut self.finished_retention)?;
        env_parse("STAMPEDE_WORKER_COUNT", &mut self.worker_count)?;
        env_duration("STAMPEDE_HEARTBEAT_INTERVAL", &mut self.heartbeat_interval)?;
        env_duration("STAMPEDE_RESTART_DELAY", &mut self.restart_delay)?;
        env_duration("STAMPEDE_SHUTDOWN_TIMEOUT", &mut self.shutdown_timeout)?;
        env_parse("STAMPEDE_MEMORY_THRESHOLD_BYTES", &mut self.memory_threshold_bytes)?;
        env_duration("STAMPEDE_REPORT_INTERVAL", &mut self.report_interval)?;
        env_duration("STAMPEDE_MEMORY_CHECK_INTERVAL", &mut self.memory_check_interval)?;
        env_parse("STAMPEDE_EXECUTION_MODE", &mut self.execution_mode)?;
        env_parse("STAMPEDE_HTTP_ADDR", &mut self.http_addr)?;
        if let Ok(raw) = std::env::var("STAMPEDE_LOAD_THRESHOLDS") {
            self.load_thresholds = parse_thresholds(&raw)?;
        }
        Ok(())
    }

    /// Reject settings the layer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.base_rate_limit == 0 {
            return Err(Error::Config("base_rate_limit must be positive".into()));
        }
        if self.max_job_attempts == 0 {
            return Err(Error::Config("max_job_attempts must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be positive".into()));
        }
        let non_zero = [
            ("dedup_ttl", self.dedup_ttl),
            ("wait_timeout", self.wait_timeout),
            ("poll_interval", self.poll_interval),
            ("store_timeout", self.store_timeout),
            ("rate_window", self.rate_window),
            ("job_lease_timeout", self.job_lease_timeout),
            ("job_poll_interval", self.job_poll_interval),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be non-zero")));
        }
        if self.dedup_ttl >= self.result_cache_ttl {
            return Err(Error::Config(format!(
                "dedup_ttl ({:?}) must be shorter than result_cache_ttl ({:?})",
                self.dedup_ttl, self.result_cache_ttl
            )));
        }
        for pair in self.load_thresholds.windows(2) {
            if pair[0].above >= pair[1].above || pair[0].limit < pair[1].limit {
                return Err(Error::Config(
                    "load_thresholds must rise in `above` and not loosen in `limit`".into(),
                ));
            }
        }
        Ok(())
    }
}

/// `"500:45,1000:30"` -> two thresholds.
pub fn parse_thresholds(raw: &str) -> Result<Vec<LoadThreshold>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|pair| {
            let (above, limit) = pair
                .split_once(':')
                .ok_or_else(|| Error::Config(format!("bad load threshold '{pair}', want above:limit")))?;
            Ok(LoadThreshold {
                above: above
                    .trim()
                    .parse()
                    .map_err(|e| Error::Config(format!("bad threshold '{pair}': {e}")))?,
                limit: limit
                    .trim()
                    .parse()
                    .map_err(|e| Error::Config(format!("bad threshold '{pair}': {e}")))?,
            })
        })
        .collect()
}

fn env_duration(name: &str, field: &mut Duration) -> Result<()> {
    if let Ok(raw) = std::env::var(name) {
        *field = humantime::parse_duration(&raw)
            .map_err(|e| Error::Config(format!("{name}: {e}")))?;
    }
    Ok(())
}

fn env_parse<T>(name: &str, field: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *field = raw
            .parse()
            .map_err(|e| Error::Config(format!("{name}: {e}")))?;
    }
    Ok(())
}

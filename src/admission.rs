//! Per-client sliding-window admission with a load-adaptive limit.
//!
//! Every client's limit tightens as the number of active requests grows,
//! so aggregate load is shed before resources run out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::config::{CoordinationConfig, LoadThreshold};
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::model::RateWindow;
use crate::store::{SharedStateStore, bounded};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub base_rate_limit: u32,
    pub window: Duration,
    /// Bound on the counter increment.
    pub store_timeout: Duration,
    /// Sorted by `above`, ascending.
    pub load_thresholds: Vec<LoadThreshold>,
}

impl From<&CoordinationConfig> for AdmissionConfig {
    fn from(c: &CoordinationConfig) -> Self {
        Self {
            base_rate_limit: c.base_rate_limit,
            window: c.rate_window,
            store_timeout: c.store_timeout,
            load_thresholds: c.load_thresholds.clone(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::from(&CoordinationConfig::default())
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub window: RateWindow,
    pub limit: u32,
    pub throttled: bool,
}

pub struct AdmissionController<S> {
    store: Arc<S>,
    metrics: Arc<MetricsCollector>,
    config: AdmissionConfig,
}

impl<S: SharedStateStore> AdmissionController<S> {
    pub fn new(store: Arc<S>, metrics: Arc<MetricsCollector>, config: AdmissionConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// Limit in force for the current load.
    pub fn effective_limit(&self) -> u32 {
        limit_for_load(
            self.config.base_rate_limit,
            &self.config.load_thresholds,
            self.metrics.active_requests(),
        )
    }

    /// Count this request against the client's window. `true` means reject.
    ///
    /// Store failures, including a store that stops answering, admit the
    /// request.
    pub async fn should_throttle(&self, client_id: &str) -> bool {
        match self.admit(client_id).await {
            Ok(admission) => admission.throttled,
            Err(e) => {
                warn!(client_id, error = %e, "store unavailable, admitting without rate limit");
                metrics::store_unavailable().add(1, &[KeyValue::new("operation", "atomic_increment")]);
                false
            }
        }
    }

    /// Like [`should_throttle`](Self::should_throttle) but as a retryable error.
    pub async fn check(&self, client_id: &str) -> Result<()> {
        if !self.should_throttle(client_id).await {
            return Ok(());
        }
        Err(Error::Throttled {
            client_id: client_id.to_string(),
            limit: self.effective_limit(),
            retry_after: self.config.window,
        })
    }

    /// Increment the client's window and report the full decision.
    pub async fn admit(&self, client_id: &str) -> Result<Admission> {
        let count = bounded(
            self.config.store_timeout,
            "atomic_increment",
            self.store
                .atomic_increment(&rate_key(client_id), self.config.window),
        )
        .await?;
        let count = u64::try_from(count).unwrap_or(0);
        let limit = self.effective_limit();
        let throttled = count > u64::from(limit);

        if throttled {
            debug!(client_id, count, limit, "throttling client");
            metrics::throttled().add(1, &[KeyValue::new("limit", i64::from(limit))]);
        }

        Ok(Admission {
            window: RateWindow {
                client_id: client_id.to_string(),
                count,
                window: self.config.window,
                opened_at: (count == 1).then(Utc::now),
            },
            limit,
            throttled,
        })
    }
}

fn rate_key(client_id: &str) -> String {
    format!("rate:{client_id}")
}

/// The tightest threshold strictly exceeded by `active` wins.
pub fn limit_for_load(base: u32, thresholds: &[LoadThreshold], active: u64) -> u32 {
    thresholds
        .iter()
        .filter(|t| active > t.above)
        .map(|t| t.limit)
        .min()
        .map_or(base, |limit| limit.min(base))
}

//! HTTP surface: health snapshot and the generate entry point.
//!
//! - `GET /healthz`: request counters, queue counts and worker pool size as JSON
//! - `POST /generate`: JSON request body, generated payload back. The
//!   `x-client-id` header names the client for rate limiting.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Error;
use crate::generator::Generator;
use crate::model::MetricSample;
use crate::queue::{JobBackend, JobQueue, QueueStats};
use crate::service::Service;
use crate::store::SharedStateStore;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const SOURCE_HEADER: &str = "x-stampede-source";
const ANONYMOUS: &str = "anonymous";

pub type PoolSize = Arc<dyn Fn() -> usize + Send + Sync>;

pub struct AppState<S, G, Q = JobQueue> {
    service: Arc<Service<S, G, Q>>,
    pool_size: PoolSize,
}

impl<S, G, Q> Clone for AppState<S, G, Q> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            pool_size: Arc::clone(&self.pool_size),
        }
    }
}

impl<S, G, Q> AppState<S, G, Q> {
    pub fn new(service: Arc<Service<S, G, Q>>, pool_size: PoolSize) -> Self {
        Self { service, pool_size }
    }
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub metrics: MetricSample,
    /// `None` when the queue backend could not be read.
    pub queue: Option<QueueStats>,
    pub pool_size: usize,
}

pub fn router<S: SharedStateStore, G: Generator, Q: JobBackend>(
    state: AppState<S, G, Q>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz::<S, G, Q>))
        .route("/generate", post(generate::<S, G, Q>))
        .with_state(state)
}

async fn healthz<S: SharedStateStore, G: Generator, Q: JobBackend>(
    State(state): State<AppState<S, G, Q>>,
) -> Json<Health> {
    let queue = match state.service.queue().stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(error = %e, "queue stats unavailable");
            None
        }
    };
    Json(Health {
        metrics: state.service.metrics().snapshot(),
        queue,
        pool_size: (state.pool_size)(),
    })
}

async fn generate<S: SharedStateStore, G: Generator, Q: JobBackend>(
    State(state): State<AppState<S, G, Q>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string();

    let request: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")).into_response(),
    };

    match state.service.coordinate(&client_id, &request).await {
        Ok(coordinated) => {
            debug!(client_id, source = coordinated.source.as_str(), "generate served");
            let mut response = coordinated.payload.into_response();
            response.headers_mut().insert(
                SOURCE_HEADER,
                HeaderValue::from_static(coordinated.source.as_str()),
            );
            response
        }
        Err(e) => error_response(e),
    }
}

fn error_response(err: Error) -> Response {
    match err {
        Error::Throttled { retry_after, .. } => {
            let secs = retry_after.as_secs().max(1);
            let mut response = (StatusCode::TOO_MANY_REQUESTS, err.to_string()).into_response();
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
        Error::Compute(_) | Error::JobExhausted { .. } => {
            warn!(error = %err, "generation failed");
            (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
        }
        other => {
            warn!(error = %other, "generate request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn throttled_maps_to_429_with_retry_after() {
        let response = error_response(Error::Throttled {
            client_id: "c".to_string(),
            limit: 60,
            retry_after: Duration::from_secs(60),
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    }

    #[test]
    fn compute_failure_maps_to_502() {
        let response = error_response(Error::Compute("boom".into()));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}

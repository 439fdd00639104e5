//! HTTP endpoint status mapping.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use stampede::config::CoordinationConfig;
use stampede::error::BoxError;
use stampede::generator::FnGenerator;
use stampede::http::{AppState, CLIENT_ID_HEADER, SOURCE_HEADER, router};
use stampede::service::Service;
use stampede::store::MemoryStore;
use tower::ServiceExt;

type GenerateFn = Box<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, BoxError>> + Send + Sync>;

fn app(generate: GenerateFn, config: CoordinationConfig) -> axum::Router {
    let service = Arc::new(Service::new(
        Arc::new(MemoryStore::new()),
        Arc::new(FnGenerator::new(generate)),
        config,
    ));
    router(AppState::new(service, Arc::new(|| 4usize)))
}

fn echo() -> GenerateFn {
    Box::new(|payload: Bytes| async move { Ok::<_, BoxError>(payload) }.boxed())
}

fn post(client: &str, body: &str) -> Request<Body> {
    Request::post("/generate")
        .header(CLIENT_ID_HEADER, client)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

#[tokio::test]
async fn healthz_reports_pool_and_counters() {
    let app = app(echo(), CoordinationConfig::default());
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(health["pool_size"], 4);
    assert_eq!(health["metrics"]["total_requests"], 0);
    assert_eq!(health["queue"]["queued"], 0);
}

#[tokio::test]
async fn generate_returns_payload_and_source() {
    let app = app(echo(), CoordinationConfig::default());

    let first = app.clone().oneshot(post("c", r#"{"prompt":"hi"}"#)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[SOURCE_HEADER], "computed");
    assert_eq!(body_bytes(first).await, Bytes::from(r#"{"prompt":"hi"}"#));

    let second = app.oneshot(post("c", r#"{"prompt":"hi"}"#)).await.unwrap();
    assert_eq!(second.headers()[SOURCE_HEADER], "local_cache");
}

#[tokio::test]
async fn over_limit_gets_429_with_retry_after() {
    let app = app(
        echo(),
        CoordinationConfig {
            base_rate_limit: 1,
            rate_window: Duration::from_secs(30),
            ..CoordinationConfig::default()
        },
    );

    let ok = app.clone().oneshot(post("c", r#"{"n":1}"#)).await.unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let throttled = app.oneshot(post("c", r#"{"n":2}"#)).await.unwrap();
    assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(throttled.headers()[header::RETRY_AFTER], "30");
}

#[tokio::test]
async fn generator_failure_is_bad_gateway() {
    let failing: GenerateFn =
        Box::new(|_: Bytes| async { Err::<Bytes, BoxError>("model offline".into()) }.boxed());
    let app = app(failing, CoordinationConfig::default());

    let response = app.oneshot(post("c", r#"{"prompt":"x"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let app = app(echo(), CoordinationConfig::default());
    let response = app.oneshot(post("c", "not json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

//! # stampede
//!
//! Request coordination for a content-generation service under traffic
//! spikes: deduplication of concurrent identical requests with a shared
//! result cache, load-adaptive per-client admission, a retryable job queue
//! with dead-lettering, a self-healing worker pool, and OpenTelemetry
//! observability.

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod generator;
pub mod http;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use error::{BoxError, Error, Result};

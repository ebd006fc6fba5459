//! HTTP exposure module.
//!
//! Serves the Prometheus scrape endpoint and the orchestrator health probes
//! on two separate listeners.

pub mod routes;
pub mod server;

pub use server::{
    DEFAULT_HEALTH_ADDRESS, DEFAULT_METRICS_ADDRESS, ExposureCoordinator, HttpListener,
    ListenerState, ServerConfig, ServerError,
};

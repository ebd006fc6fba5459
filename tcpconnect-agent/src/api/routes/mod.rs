//! HTTP route modules.
//!
//! Each listener gets its own router.

pub mod health;
pub mod metrics;

use std::sync::Arc;

use axum::Router;

use crate::metrics::{HealthState, MetricsRegistry};

/// Router served by the metrics listener.
pub fn create_metrics_router(registry: Arc<MetricsRegistry>) -> Router {
    metrics::router().with_state(registry)
}

/// Router served by the health listener.
pub fn create_health_router(health: Arc<HealthState>) -> Router {
    health::router().with_state(health)
}

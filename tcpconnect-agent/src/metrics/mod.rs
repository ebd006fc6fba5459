//! Metrics and health module.
//!
//! Drains the kernel counter table into Prometheus gauges and tracks the
//! agent's own ready/alive state.
//!
//! # Features
//!
//! - Per-process gauge family `tcp_connects_by_pid{pid, comm}`
//! - Collector self-metrics (cycles, errors, tracked pids)
//! - Lock-free ready/alive flags for the health endpoints
//!
//! # Example
//!
//! ```ignore
//! use tcpconnect_agent::metrics::{CollectorConfig, MetricsRegistry, TelemetryCollector};
//!
//! let registry = Arc::new(MetricsRegistry::new()?);
//! let collector = Arc::new(
//!     TelemetryCollector::new(table, registry.clone(), resolver, CollectorConfig::default())
//!         .with_stats(registry.stats().clone()),
//! );
//! collector.start(on_fatal);
//! // ...
//! collector.stop().await;
//! ```

mod collector;
mod health;
mod registry;

pub use collector::{
    AggregatedSample, CollectionError, CollectorConfig, DEFAULT_COLLECT_INTERVAL, FatalHandler,
    TelemetryCollector,
};
pub use health::{HealthState, HealthStatus};
pub use registry::{CollectionStats, GaugeSink, MetricsRegistry, TCP_CONNECTS_METRIC};

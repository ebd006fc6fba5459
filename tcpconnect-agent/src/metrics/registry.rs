//! Metrics registry and Prometheus exposition.
//!
//! A single [`MetricsRegistry`] is built at startup and shared by the
//! collector (writer) and the metrics listener (reader).

use prometheus::{Encoder, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Gauge family published per process.
pub const TCP_CONNECTS_METRIC: &str = "tcp_connects_by_pid";

const TCP_CONNECTS_HELP: &str = "Number of tcp_connect() calls observed per PID";

/// Namespace for the agent's own metrics.
const SELF_NAMESPACE: &str = "tcpconnect_agent";

/// Destination of per-process samples.
///
/// The collector is the only writer; implementations must tolerate
/// concurrent readers.
pub trait GaugeSink: Send + Sync {
    /// Set the gauge for `(pid, comm)` to `value`.
    fn set(&self, pid: &str, comm: &str, value: f64) -> Result<(), prometheus::Error>;

    /// Drop the gauge for `(pid, comm)`.
    fn remove(&self, pid: &str, comm: &str) -> Result<(), prometheus::Error>;
}

/// Counters describing the collector itself.
#[derive(Clone)]
pub struct CollectionStats {
    pub cycles: IntCounter,
    pub errors: IntCounter,
    pub tracked_pids: IntGauge,
}

/// Explicit Prometheus registry with the agent's metric families.
pub struct MetricsRegistry {
    registry: Registry,
    tcp_connects: GaugeVec,
    stats: CollectionStats,
}

impl MetricsRegistry {
    /// Create a registry and register all families on it.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tcp_connects = GaugeVec::new(
            Opts::new(TCP_CONNECTS_METRIC, TCP_CONNECTS_HELP),
            &["pid", "comm"],
        )?;
        registry.register(Box::new(tcp_connects.clone()))?;

        let cycles = IntCounter::with_opts(
            Opts::new("collection_cycles_total", "Completed collection cycles")
                .namespace(SELF_NAMESPACE),
        )?;
        registry.register(Box::new(cycles.clone()))?;

        let errors = IntCounter::with_opts(
            Opts::new("collection_errors_total", "Failed collection cycles")
                .namespace(SELF_NAMESPACE),
        )?;
        registry.register(Box::new(errors.clone()))?;

        let tracked_pids = IntGauge::with_opts(
            Opts::new("tracked_pids", "Entries read from the counter table in the last cycle")
                .namespace(SELF_NAMESPACE),
        )?;
        registry.register(Box::new(tracked_pids.clone()))?;

        Ok(Self {
            registry,
            tcp_connects,
            stats: CollectionStats {
                cycles,
                errors,
                tracked_pids,
            },
        })
    }

    /// Collector self-metrics.
    pub fn stats(&self) -> &CollectionStats {
        &self.stats
    }

    /// Current value of a published gauge, if present.
    pub fn gauge_value(&self, pid: &str, comm: &str) -> Option<f64> {
        self.registry
            .gather()
            .into_iter()
            .filter(|family| family.get_name() == TCP_CONNECTS_METRIC)
            .flat_map(|family| family.get_metric().to_vec())
            .find(|metric| {
                let labels = metric.get_label();
                labels
                    .iter()
                    .any(|l| l.get_name() == "pid" && l.get_value() == pid)
                    && labels
                        .iter()
                        .any(|l| l.get_name() == "comm" && l.get_value() == comm)
            })
            .map(|metric| metric.get_gauge().get_value())
    }

    /// Render every registered family in the text exposition format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Content type of [`MetricsRegistry::export`].
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

impl GaugeSink for MetricsRegistry {
    fn set(&self, pid: &str, comm: &str, value: f64) -> Result<(), prometheus::Error> {
        self.tcp_connects
            .get_metric_with_label_values(&[pid, comm])?
            .set(value);
        Ok(())
    }

    fn remove(&self, pid: &str, comm: &str) -> Result<(), prometheus::Error> {
        self.tcp_connects.remove_label_values(&[pid, comm])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_empty() {
        let registry = MetricsRegistry::new().unwrap();
        let output = registry.export().unwrap();

        assert!(output.contains("tcpconnect_agent_collection_cycles_total 0"));
        assert!(!output.contains("tcp_connects_by_pid{"));
    }

    #[test]
    fn test_export_with_labels() {
        let registry = MetricsRegistry::new().unwrap();
        registry.set("1234", "curl", 5.0).unwrap();

        let output = registry.export().unwrap();
        assert!(output.contains("# TYPE tcp_connects_by_pid gauge"));
        assert!(output.contains("tcp_connects_by_pid{comm=\"curl\",pid=\"1234\"} 5"));
    }

    #[test]
    fn test_set_overwrites_value() {
        let registry = MetricsRegistry::new().unwrap();
        registry.set("1", "init", 3.0).unwrap();
        registry.set("1", "init", 9.0).unwrap();

        assert_eq!(registry.gauge_value("1", "init"), Some(9.0));
    }

    #[test]
    fn test_remove_label_set() {
        let registry = MetricsRegistry::new().unwrap();
        registry.set("1", "init", 3.0).unwrap();
        registry.remove("1", "init").unwrap();

        assert_eq!(registry.gauge_value("1", "init"), None);
        assert!(registry.remove("1", "init").is_err());
    }

    #[test]
    fn test_registries_are_independent() {
        let first = MetricsRegistry::new().unwrap();
        let second = MetricsRegistry::new().unwrap();
        first.set("10", "sshd", 1.0).unwrap();

        assert_eq!(first.gauge_value("10", "sshd"), Some(1.0));
        assert_eq!(second.gauge_value("10", "sshd"), None);
    }

    #[test]
    fn test_content_type() {
        let registry = MetricsRegistry::new().unwrap();
        assert!(registry.content_type().starts_with("text/plain"));
    }
}

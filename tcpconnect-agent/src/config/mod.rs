//! Agent configuration.
//!
//! Every setting has a built-in default and can be overridden through an
//! environment variable (a `.env` file is honoured by `main`):
//!
//! | Variable                      | Default                   |
//! |-------------------------------|---------------------------|
//! | `AGENT_METRICS_ADDR`          | `0.0.0.0:9090`            |
//! | `AGENT_HEALTH_ADDR`           | `0.0.0.0:8080`            |
//! | `AGENT_BPF_OBJECT`            | `/bpf/tcpconnect.bpf.o`   |
//! | `AGENT_BPF_PROGRAM`           | `on_tcp_connect`          |
//! | `AGENT_BPF_MAP`               | `counts`                  |
//! | `AGENT_KPROBE_SYMBOL`         | `tcp_connect`             |
//! | `AGENT_COLLECT_INTERVAL_SECS` | `5`                       |
//! | `AGENT_SHUTDOWN_TIMEOUT_SECS` | `10`                      |
//! | `AGENT_LOG_DIR`               | unset (console only)      |
//! | `AGENT_EVICT_STALE_LABELS`    | `false`                   |
//!
//! Listener addresses take `ip:port`, `host:port` or `:port` (all
//! interfaces).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::api::ServerConfig;
use crate::ebpf::ProbeConfig;
use crate::error::{Error, Result};
use crate::metrics::{CollectorConfig, DEFAULT_COLLECT_INTERVAL};

/// Default deadline for draining both HTTP listeners.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Full agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub probe: ProbeConfig,
    pub collector: CollectorConfig,
    /// Shared deadline for listener shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            probe: ProbeConfig::default(),
            collector: CollectorConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl AgentConfig {
    /// Load config from environment variables, falling back to defaults.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// Blank values are ignored. Values that fail to parse are logged and
    /// the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(addr) = get("AGENT_METRICS_ADDR") {
            config.server.metrics_address = normalize_address(&addr);
        }
        if let Some(addr) = get("AGENT_HEALTH_ADDR") {
            config.server.health_address = normalize_address(&addr);
        }

        if let Some(path) = get("AGENT_BPF_OBJECT") {
            config.probe.object_path = PathBuf::from(path);
        }
        if let Some(program) = get("AGENT_BPF_PROGRAM") {
            config.probe.entry_point = program;
        }
        if let Some(map) = get("AGENT_BPF_MAP") {
            config.probe.table_name = map;
        }
        if let Some(symbol) = get("AGENT_KPROBE_SYMBOL") {
            config.probe.attach_symbol = symbol;
        }

        if let Some(secs) = get("AGENT_COLLECT_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(0) => config.collector.interval = DEFAULT_COLLECT_INTERVAL,
                Ok(secs) => config.collector.interval = Duration::from_secs(secs),
                Err(e) => warn!(
                    value = %secs,
                    error = %e,
                    "Invalid AGENT_COLLECT_INTERVAL_SECS, using default"
                ),
            }
        }

        if let Some(secs) = get("AGENT_SHUTDOWN_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => config.shutdown_timeout = Duration::from_secs(secs),
                Err(e) => warn!(
                    value = %secs,
                    error = %e,
                    "Invalid AGENT_SHUTDOWN_TIMEOUT_SECS, using default"
                ),
            }
        }

        if let Some(flag) = get("AGENT_EVICT_STALE_LABELS") {
            match parse_bool(&flag) {
                Some(evict) => config.collector.evict_stale_labels = evict,
                None => warn!(value = %flag, "Invalid AGENT_EVICT_STALE_LABELS, using default"),
            }
        }

        config
    }

    /// Check values that can only be rejected as a whole.
    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [
            ("metrics", &self.server.metrics_address),
            ("health", &self.server.health_address),
        ] {
            check_listen_address(addr).map_err(|reason| {
                Error::config(format!("invalid {name} listener address '{addr}': {reason}"))
            })?;
        }

        if self.server.metrics_address == self.server.health_address {
            return Err(Error::config(format!(
                "metrics and health listeners share address {}",
                self.server.metrics_address
            )));
        }

        for (name, value) in [
            ("program", &self.probe.entry_point),
            ("map", &self.probe.table_name),
            ("kprobe symbol", &self.probe.attach_symbol),
        ] {
            if value.is_empty() {
                return Err(Error::config(format!("{name} name must not be empty")));
            }
        }

        Ok(())
    }
}

/// Log directory from the environment.
///
/// Needed before [`AgentConfig::from_env_or_default`] so that its warnings
/// reach the configured log files.
pub fn log_dir_from_env() -> Option<PathBuf> {
    log_dir_from_lookup(&|key: &str| std::env::var(key).ok())
}

fn log_dir_from_lookup<F>(lookup: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    lookup("AGENT_LOG_DIR")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Accept a socket address or a `host:port` pair with a resolvable-looking
/// host name. Names are resolved only when the listener binds.
fn check_listen_address(addr: &str) -> std::result::Result<(), String> {
    if addr.parse::<SocketAddr>().is_ok() {
        return Ok(());
    }

    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err("expected host:port".to_string());
    };
    port.parse::<u16>().map_err(|e| format!("invalid port '{port}': {e}"))?;

    let valid_host = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid_host {
        return Err(format!("invalid host '{host}'"));
    }
    Ok(())
}

/// Accept the `:9090` shorthand for all interfaces.
fn normalize_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> AgentConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.server.metrics_address, "0.0.0.0:9090");
        assert_eq!(config.server.health_address, "0.0.0.0:8080");
        assert_eq!(
            config.probe.object_path,
            PathBuf::from("/bpf/tcpconnect.bpf.o")
        );
        assert_eq!(config.probe.entry_point, "on_tcp_connect");
        assert_eq!(config.probe.table_name, "counts");
        assert_eq!(config.probe.attach_symbol, "tcp_connect");
        assert_eq!(config.collector.interval, Duration::from_secs(5));
        assert!(!config.collector.evict_stale_labels);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("AGENT_METRICS_ADDR", "127.0.0.1:19090"),
            ("AGENT_HEALTH_ADDR", ":18080"),
            ("AGENT_BPF_OBJECT", "/opt/probe.o"),
            ("AGENT_BPF_PROGRAM", "probe"),
            ("AGENT_BPF_MAP", "hits"),
            ("AGENT_KPROBE_SYMBOL", "tcp_v4_connect"),
            ("AGENT_COLLECT_INTERVAL_SECS", "2"),
            ("AGENT_SHUTDOWN_TIMEOUT_SECS", "3"),
            ("AGENT_EVICT_STALE_LABELS", "true"),
        ]);

        assert_eq!(config.server.metrics_address, "127.0.0.1:19090");
        assert_eq!(config.server.health_address, "0.0.0.0:18080");
        assert_eq!(config.probe.object_path, PathBuf::from("/opt/probe.o"));
        assert_eq!(config.probe.entry_point, "probe");
        assert_eq!(config.probe.table_name, "hits");
        assert_eq!(config.probe.attach_symbol, "tcp_v4_connect");
        assert_eq!(config.collector.interval, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert!(config.collector.evict_stale_labels);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("AGENT_COLLECT_INTERVAL_SECS", "soon"),
            ("AGENT_SHUTDOWN_TIMEOUT_SECS", "-1"),
            ("AGENT_EVICT_STALE_LABELS", "maybe"),
        ]);

        assert_eq!(config.collector.interval, DEFAULT_COLLECT_INTERVAL);
        assert_eq!(config.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        assert!(!config.collector.evict_stale_labels);
    }

    fn log_dir_only(value: &'static str) -> impl Fn(&str) -> Option<String> {
        move |key| (key == "AGENT_LOG_DIR").then(|| value.to_string())
    }

    #[test]
    fn test_log_dir_lookup() {
        assert_eq!(
            log_dir_from_lookup(&log_dir_only("/var/log/agent")),
            Some(PathBuf::from("/var/log/agent"))
        );
        assert_eq!(log_dir_from_lookup(&log_dir_only("   ")), None);
        assert_eq!(log_dir_from_lookup(&|_: &str| None), None);
    }

    #[test]
    fn test_zero_interval_uses_default() {
        let config = config_from(&[("AGENT_COLLECT_INTERVAL_SECS", "0")]);
        assert_eq!(config.collector.interval, DEFAULT_COLLECT_INTERVAL);
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let config = config_from(&[("AGENT_METRICS_ADDR", "not-an-address")]);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("metrics"));
    }

    #[test]
    fn test_validate_accepts_host_names() {
        let config = config_from(&[
            ("AGENT_METRICS_ADDR", "localhost:9090"),
            ("AGENT_HEALTH_ADDR", "agent.internal:8080"),
        ]);
        assert!(config.validate().is_ok());

        let config = config_from(&[("AGENT_HEALTH_ADDR", "[::1]:8080")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_host_port() {
        for addr in [
            "localhost",
            "localhost:99999",
            "localhost:",
            "bad host:80",
            "::1:80",
        ] {
            let config = config_from(&[("AGENT_METRICS_ADDR", addr)]);
            assert!(config.validate().is_err(), "{addr}");
        }
    }

    #[test]
    fn test_validate_rejects_shared_address() {
        let config = config_from(&[
            ("AGENT_METRICS_ADDR", "0.0.0.0:9000"),
            ("AGENT_HEALTH_ADDR", ":9000"),
        ]);
        assert!(config.validate().is_err());
    }
}

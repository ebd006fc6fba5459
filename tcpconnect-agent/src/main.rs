use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tcpconnect_agent::config::{self, AgentConfig};
use tcpconnect_agent::{logging, panic_hook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let log_dir = config::log_dir_from_env();
    let log_handle = logging::init_logging(log_dir.as_deref())?;
    panic_hook::install();

    let config = AgentConfig::from_env_or_default();
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        metrics = %config.server.metrics_address,
        health = %config.server.health_address,
        object = %config.probe.object_path.display(),
        "Starting tcpconnect-agent"
    );

    let background = CancellationToken::new();
    let retention = log_handle.start_retention_cleanup(background.clone());

    let result = run(config).await;

    background.cancel();
    if let Some(task) = retention {
        let _ = task.await;
    }

    result
}

#[cfg(target_os = "linux")]
async fn run(config: AgentConfig) -> anyhow::Result<()> {
    use std::sync::Arc;

    use process_utils::ProcfsResolver;
    use tokio::time::Instant;
    use tracing::{error, warn};

    use tcpconnect_agent::api::ExposureCoordinator;
    use tcpconnect_agent::ebpf::{AyaBackend, InstrumentationManager};
    use tcpconnect_agent::metrics::{
        CollectionError, FatalHandler, HealthState, MetricsRegistry, TelemetryCollector,
    };

    let health = Arc::new(HealthState::new());

    let mut manager = InstrumentationManager::open(&AyaBackend, config.probe.clone())
        .context("failed to set up kernel instrumentation")?;
    health.set_ready(true);

    let registry = Arc::new(MetricsRegistry::new()?);
    let collector = Arc::new(
        TelemetryCollector::new(
            manager.counters(),
            registry.clone(),
            Arc::new(ProcfsResolver::new()),
            config.collector.clone(),
        )
        .with_stats(registry.stats().clone()),
    );

    let fatal_health = health.clone();
    let on_fatal: FatalHandler = Arc::new(move |err: &CollectionError| {
        // Recoverable cycle failures are already logged by the collector.
        if err.is_unrecoverable() {
            error!(error = %err, "Marking agent not alive");
            fatal_health.set_alive(false);
        }
    });
    collector.start(on_fatal);

    let coordinator = ExposureCoordinator::new(&config.server, registry, health.clone());
    if let Err(e) = coordinator.start().await {
        collector.stop().await;
        if let Err(close_err) = manager.close() {
            warn!(error = %close_err, "Failed to release instrumentation");
        }
        return Err(e).context("failed to start HTTP listeners");
    }

    shutdown_signal().await;

    health.set_ready(false);

    let deadline = Instant::now() + config.shutdown_timeout;
    if let Err(e) = coordinator.shutdown(deadline).await {
        warn!(error = %e, "HTTP listeners did not shut down cleanly");
    }

    collector.stop().await;
    manager
        .close()
        .context("failed to release kernel instrumentation")?;

    info!("tcpconnect-agent stopped");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: AgentConfig) -> anyhow::Result<()> {
    anyhow::bail!("kernel instrumentation is only supported on Linux")
}

/// Resolves on SIGINT or SIGTERM.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

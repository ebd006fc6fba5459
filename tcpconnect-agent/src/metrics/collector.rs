//! Periodic drain of the kernel counter table into the metrics sink.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use process_utils::ProcessNameResolver;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{CollectionStats, GaugeSink};
use crate::ebpf::{CounterEntry, CounterTable, TableError};
use crate::panic_hook::payload_message;

/// Interval used when none (or zero) is configured.
pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(5);

/// Failure of a collection cycle.
#[derive(Error, Debug, Clone)]
pub enum CollectionError {
    /// The table could not be read this cycle.
    #[error("failed to read counter table: {0}")]
    Table(String),

    /// A gauge could not be updated.
    #[error("failed to update gauge for pid {pid}: {reason}")]
    Sink { pid: u32, reason: String },

    /// The table handle is permanently invalid.
    #[error("counter table is no longer readable: {0}")]
    Unrecoverable(String),

    /// The collection task panicked.
    #[error("collection task panicked: {0}")]
    Panicked(String),
}

impl CollectionError {
    /// The collection loop stops after this error.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            CollectionError::Unrecoverable(_) | CollectionError::Panicked(_)
        )
    }
}

impl From<TableError> for CollectionError {
    fn from(err: TableError) -> Self {
        if err.is_unrecoverable() {
            CollectionError::Unrecoverable(err.to_string())
        } else {
            CollectionError::Table(err.to_string())
        }
    }
}

/// Callback invoked once per collection failure.
pub type FatalHandler = Arc<dyn Fn(&CollectionError) + Send + Sync>;

/// Collector configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Time between two collection cycles.
    pub interval: Duration,
    /// Remove label-sets whose pid vanished from the table since the
    /// previous cycle.
    pub evict_stale_labels: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_COLLECT_INTERVAL,
            evict_stale_labels: false,
        }
    }
}

impl CollectorConfig {
    fn effective_interval(&self) -> Duration {
        if self.interval.is_zero() {
            DEFAULT_COLLECT_INTERVAL
        } else {
            self.interval
        }
    }
}

/// One resolved sample of a collection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedSample {
    pub key: u32,
    pub value: u64,
    pub label: String,
}

/// Drains the counter table into per-process gauges on a fixed interval.
///
/// `start` and `stop` must not be called concurrently.
pub struct TelemetryCollector {
    config: CollectorConfig,
    table: Arc<dyn CounterTable>,
    sink: Arc<dyn GaugeSink>,
    resolver: Arc<dyn ProcessNameResolver>,
    stats: Option<CollectionStats>,
    /// Label-sets published by the previous cycle.
    published: Mutex<HashSet<(String, String)>>,
    cancel_token: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryCollector {
    pub fn new(
        table: Arc<dyn CounterTable>,
        sink: Arc<dyn GaugeSink>,
        resolver: Arc<dyn ProcessNameResolver>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            config,
            table,
            sink,
            resolver,
            stats: None,
            published: Mutex::new(HashSet::new()),
            cancel_token: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    /// Record cycle and error counts on the given self-metrics.
    pub fn with_stats(mut self, stats: CollectionStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Run one collection cycle.
    ///
    /// Entries are published in ascending pid order. Returns the number of
    /// entries read.
    pub fn collect(&self) -> Result<usize, CollectionError> {
        let result = self.collect_inner();
        if let Some(stats) = &self.stats {
            match &result {
                Ok(count) => {
                    stats.cycles.inc();
                    stats.tracked_pids.set(*count as i64);
                }
                Err(_) => stats.errors.inc(),
            }
        }
        result
    }

    fn collect_inner(&self) -> Result<usize, CollectionError> {
        let mut entries = self.table.entries()?;
        entries.sort_by_key(|entry| entry.key);

        let samples: Vec<AggregatedSample> = entries
            .iter()
            .map(|&CounterEntry { key, value }| AggregatedSample {
                key,
                value,
                label: self.resolver.lookup(key),
            })
            .collect();

        let mut seen = HashSet::with_capacity(samples.len());
        for sample in &samples {
            let pid = sample.key.to_string();
            self.sink
                .set(&pid, &sample.label, sample.value as f64)
                .map_err(|e| CollectionError::Sink {
                    pid: sample.key,
                    reason: e.to_string(),
                })?;
            seen.insert((pid, sample.label.clone()));
        }

        let mut published = self.published.lock();
        if self.config.evict_stale_labels {
            for (pid, comm) in published.difference(&seen) {
                if let Err(e) = self.sink.remove(pid, comm) {
                    debug!(pid = %pid, comm = %comm, error = %e, "Stale label-set already gone");
                }
            }
        }
        *published = seen;

        debug!(entries = samples.len(), "Collection cycle completed");
        Ok(samples.len())
    }

    /// Spawn the periodic collection task.
    ///
    /// The first cycle runs one interval after this call. Failures are
    /// passed to `on_fatal`; the loop keeps going unless the failure is
    /// unrecoverable. A panic in the loop is reported the same way.
    pub fn start(self: &Arc<Self>, on_fatal: FatalHandler) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!("Telemetry collector already running");
            return;
        }

        let cancel_token = CancellationToken::new();
        *self.cancel_token.lock() = cancel_token.clone();

        let period = self.config.effective_interval();
        let collector = Arc::clone(self);
        let loop_token = cancel_token.clone();
        let loop_fatal = on_fatal.clone();
        let worker = tokio::spawn(async move {
            collector.run_loop(period, loop_token, loop_fatal).await;
        });

        // Supervisor: turns an aborted loop into the same fatal report.
        *task = Some(tokio::spawn(async move {
            match worker.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    let err = CollectionError::Panicked(payload_message(e.into_panic().as_ref()));
                    error!(error = %err, "Telemetry collector crashed");
                    on_fatal(&err);
                }
                Err(e) => {
                    debug!(error = %e, "Telemetry collector task cancelled");
                }
            }
        }));

        info!(interval_ms = period.as_millis() as u64, "Telemetry collector started");
    }

    async fn run_loop(
        self: Arc<Self>,
        period: Duration,
        cancel_token: CancellationToken,
        on_fatal: FatalHandler,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Telemetry collector received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    // Label resolution reads procfs; keep it off the runtime workers.
                    let collector = Arc::clone(&self);
                    let cycle = tokio::task::spawn_blocking(move || collector.collect()).await;
                    let cycle = match cycle {
                        Ok(cycle) => cycle,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(e) => {
                            debug!(error = %e, "Collection cycle cancelled");
                            break;
                        }
                    };

                    if let Err(e) = cycle {
                        on_fatal(&e);
                        if e.is_unrecoverable() {
                            error!(error = %e, "Telemetry collection stopped");
                            break;
                        }
                        warn!(error = %e, "Telemetry collection cycle failed");
                    }
                }
            }
        }
    }

    /// Cancel the collection task and wait until it has exited.
    pub async fn stop(&self) {
        self.cancel_token.lock().cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Telemetry collector supervisor failed");
            }
            info!("Telemetry collector stopped");
        }
    }
}

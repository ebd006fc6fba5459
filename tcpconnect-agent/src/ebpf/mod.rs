//! Kernel instrumentation lifecycle.
//!
//! The [`InstrumentationManager`] loads a compiled probe object, attaches its
//! entry point to a kernel symbol and hands out the counter table the probe
//! populates. The kernel side is reached through the [`ProbeBackend`] /
//! [`ProbeObject`] traits; [`AyaBackend`] is the production implementation.
//!
//! # Example
//!
//! ```ignore
//! use tcpconnect_agent::ebpf::{AyaBackend, InstrumentationManager, ProbeConfig};
//!
//! let mut manager = InstrumentationManager::open(&AyaBackend, ProbeConfig::default())?;
//! let counts = manager.counters();
//! // ... read `counts` periodically ...
//! manager.close()?;
//! ```

#[cfg(target_os = "linux")]
mod aya_backend;
mod manager;
mod table;

#[cfg(target_os = "linux")]
pub use aya_backend::{AyaBackend, AyaCountsTable, AyaObject};
pub use manager::{InstrumentationManager, ProbeBackend, ProbeConfig, ProbeObject};
pub use table::{CounterEntry, CounterTable, TableError};

use thiserror::Error;

/// Errors raised while acquiring or releasing kernel instrumentation.
#[derive(Error, Debug)]
pub enum InstrumentationError {
    #[error("failed to load instrumentation object {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("entry point {0:?} not found in instrumentation object")]
    EntryPointNotFound(String),

    #[error("failed to attach {entry_point:?} to {symbol:?}: {reason}")]
    Attach {
        entry_point: String,
        symbol: String,
        reason: String,
    },

    #[error("counter table {0:?} not found in instrumentation object")]
    TableNotFound(String),

    #[error("failed to detach instrumentation link: {0}")]
    Detach(String),

    #[error("failed to release instrumentation object: {0}")]
    Release(String),
}

//! tcpconnect-agent library crate.
//!
//! Counts `tcp_connect()` calls per process with a kernel probe and exposes
//! them as Prometheus gauges next to health probe endpoints.

pub mod api;
pub mod config;
pub mod ebpf;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod panic_hook;

pub use error::{Error, Result};

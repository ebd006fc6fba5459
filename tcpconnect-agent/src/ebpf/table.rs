//! Counter table read by the collector.

use thiserror::Error;

/// One `(pid, count)` pair read from the kernel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CounterEntry {
    pub key: u32,
    pub value: u64,
}

impl CounterEntry {
    pub fn new(key: u32, value: u64) -> Self {
        Self { key, value }
    }
}

/// Failure while reading the table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// The handle was released; every later read fails the same way.
    #[error("counter table has been released")]
    Closed,

    /// A single read failed; the next one may succeed.
    #[error("failed to read counter table: {0}")]
    Read(String),
}

impl TableError {
    /// The table can no longer be read.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, TableError::Closed)
    }
}

/// Read-only view of a kernel-owned key/value table.
///
/// Snapshots are best-effort: the kernel may insert entries while the table
/// is being walked. No ordering is guaranteed.
pub trait CounterTable: Send + Sync {
    fn entries(&self) -> Result<Vec<CounterEntry>, TableError>;

    /// Invalidate this handle. Later reads return [`TableError::Closed`].
    fn release(&self) {}
}

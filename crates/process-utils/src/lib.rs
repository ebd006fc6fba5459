//! Small process-related helpers shared across the workspace.

use std::path::{Path, PathBuf};

/// Name reported for processes whose `comm` cannot be read.
pub const UNKNOWN_PROCESS: &str = "unknown";

/// Default procfs mount point.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Resolves a process id to a human-readable name.
///
/// Implementations never fail: any lookup error is reported as
/// [`UNKNOWN_PROCESS`].
pub trait ProcessNameResolver: Send + Sync {
    fn lookup(&self, pid: u32) -> String;
}

/// Resolver backed by `<proc_root>/<pid>/comm`.
#[derive(Debug, Clone)]
pub struct ProcfsResolver {
    proc_root: PathBuf,
}

impl ProcfsResolver {
    /// Resolver reading from `/proc`.
    pub fn new() -> Self {
        Self::with_root(DEFAULT_PROC_ROOT)
    }

    /// Resolver reading from a custom procfs root.
    pub fn with_root(proc_root: impl AsRef<Path>) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
        }
    }

    fn comm_path(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string()).join("comm")
    }
}

impl Default for ProcfsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessNameResolver for ProcfsResolver {
    fn lookup(&self, pid: u32) -> String {
        read_comm(&self.comm_path(pid))
    }
}

/// Look up the `comm` of `pid` under `/proc`.
pub fn process_name(pid: u32) -> String {
    ProcfsResolver::new().lookup(pid)
}

fn read_comm(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let name = contents.trim();
            if name.is_empty() {
                UNKNOWN_PROCESS.to_string()
            } else {
                name.to_string()
            }
        }
        Err(_) => UNKNOWN_PROCESS.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_comm(root: &Path, pid: u32, contents: &str) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("comm"), contents).unwrap();
    }

    #[test]
    fn test_lookup_trims_trailing_newline() {
        let root = tempfile::tempdir().unwrap();
        write_comm(root.path(), 1234, "curl\n");

        let resolver = ProcfsResolver::with_root(root.path());
        assert_eq!(resolver.lookup(1234), "curl");
    }

    #[test]
    fn test_missing_process_is_unknown() {
        let root = tempfile::tempdir().unwrap();
        let resolver = ProcfsResolver::with_root(root.path());
        assert_eq!(resolver.lookup(42), UNKNOWN_PROCESS);
    }

    #[test]
    fn test_empty_comm_is_unknown() {
        let root = tempfile::tempdir().unwrap();
        write_comm(root.path(), 7, "  \n");

        let resolver = ProcfsResolver::with_root(root.path());
        assert_eq!(resolver.lookup(7), UNKNOWN_PROCESS);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_current_process_resolves() {
        let name = process_name(std::process::id());
        assert_ne!(name, UNKNOWN_PROCESS);
    }
}

//! Health state shared between the orchestrator, the collector and the
//! health listener.
//!
//! The two flags are independent atomics. [`HealthState::status`] reads them
//! one after the other, so a reader may observe one flag newer than the
//! other; callers must not rely on a compound snapshot.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time view of the health flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the agent is ready to serve traffic.
    pub ready: bool,
    /// Whether the agent is still operating.
    pub alive: bool,
    /// Unix timestamp (seconds) at which the status was read.
    pub timestamp: i64,
}

impl HealthStatus {
    /// Both flags are set.
    pub fn is_healthy(&self) -> bool {
        self.ready && self.alive
    }
}

/// Ready/alive flags for the whole process.
#[derive(Debug)]
pub struct HealthState {
    ready: AtomicBool,
    alive: AtomicBool,
}

impl HealthState {
    /// Alive but not yet ready.
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Current flags stamped with the wall-clock second of the read.
    pub fn status(&self) -> HealthStatus {
        HealthStatus {
            ready: self.is_ready(),
            alive: self.is_alive(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_state() {
        let health = HealthState::new();
        let status = health.status();
        assert!(!status.ready);
        assert!(status.alive);
        assert!(!status.is_healthy());
    }

    #[test]
    fn test_ready_sticks_until_cleared() {
        let health = HealthState::new();
        health.set_ready(true);
        for _ in 0..100 {
            assert!(health.is_ready());
        }

        health.set_ready(false);
        assert!(!health.is_ready());
    }

    #[test]
    fn test_flags_are_independent() {
        let health = HealthState::new();
        health.set_ready(true);
        health.set_alive(false);

        let status = health.status();
        assert!(status.ready);
        assert!(!status.alive);
        assert!(!status.is_healthy());
    }

    #[test]
    fn test_status_timestamp_is_read_time() {
        let health = HealthState::new();
        let before = chrono::Utc::now().timestamp();
        let status = health.status();
        let after = chrono::Utc::now().timestamp();
        assert!(status.timestamp >= before && status.timestamp <= after);
    }

    #[test]
    fn test_status_serialization() {
        let status = HealthStatus {
            ready: true,
            alive: false,
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ready": true, "alive": false, "timestamp": 1_700_000_000})
        );
    }

    #[test]
    fn test_concurrent_writers() {
        let health = Arc::new(HealthState::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let health = health.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        health.set_ready(i % 2 == 0);
                        let _ = health.status();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        health.set_ready(true);
        assert!(health.is_ready());
        assert!(health.is_alive());
    }
}

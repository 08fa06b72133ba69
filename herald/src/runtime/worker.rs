use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::TransientPolicy;

/// Configuration for a dispatch worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifier attached to log lines and spans.
    pub worker_id: String,
    /// Pause between claim cycles, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of gateway calls in flight at once.
    pub max_in_flight: usize,
    /// Upper bound on a single gateway call, in milliseconds.
    pub dispatch_timeout_ms: Option<u64>,
    /// How long shutdown waits for in-flight dispatches, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Handling of jobs whose payload read failed.
    pub transient_policy: TransientPolicy,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given worker ID.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the in-flight dispatch cap.
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit.max(1);
        self
    }

    /// Set or clear the per-dispatch timeout.
    pub fn with_dispatch_timeout(mut self, ms: Option<u64>) -> Self {
        self.dispatch_timeout_ms = ms;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    pub fn with_transient_policy(mut self, policy: TransientPolicy) -> Self {
        self.transient_policy = policy;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("herald-{}", std::process::id()),
            poll_interval_ms: 1000,
            max_in_flight: 64,
            dispatch_timeout_ms: Some(30_000),
            shutdown_grace_ms: 30_000,
            transient_policy: TransientPolicy::Drop,
        }
    }
}

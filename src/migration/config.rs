//! Configuration for the migration reconciliation backend.

use std::time::Duration;

/// Tunables for the reconciliation backend and its workers.
///
/// The defaults match production guidance: per-node RPC retries back off
/// exponentially from 100 ms to a 5 s cap with jitter, worker actions
/// run under a 5 s timeout, and the event queue is sized so callback
/// overflow (which forces a full resync) is rare.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// First retry delay after a node RPC failure; also the poll delay
    /// after a successful reply that left work outstanding.
    pub retry_min_backoff: Duration,

    /// Cap for the per-node exponential backoff.
    pub retry_max_backoff: Duration,

    /// Timeout for a single partition action attempt; expiry counts as a
    /// retryable operation failure.
    pub worker_operation_timeout: Duration,

    /// Capacity of the bounded event channel feeding the main loop.
    pub event_queue_capacity: usize,

    /// Number of worker shards on this node.
    pub shards: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            retry_min_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(5),
            worker_operation_timeout: Duration::from_secs(5),
            event_queue_capacity: 1024,
            shards: 1,
        }
    }
}

impl MigrationConfig {
    /// Validate the configuration, returning a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.retry_min_backoff.is_zero() {
            return Err("retry_min_backoff must be non-zero".to_string());
        }
        if self.retry_max_backoff < self.retry_min_backoff {
            return Err(format!(
                "retry_max_backoff ({:?}) must be >= retry_min_backoff ({:?})",
                self.retry_max_backoff, self.retry_min_backoff
            ));
        }
        if self.worker_operation_timeout.is_zero() {
            return Err("worker_operation_timeout must be non-zero".to_string());
        }
        if self.event_queue_capacity == 0 {
            return Err("event_queue_capacity must be non-zero".to_string());
        }
        if self.shards == 0 {
            return Err("shards must be non-zero".to_string());
        }
        Ok(())
    }
}

//! Per-node retry backoff for coordinator RPCs.
//!
//! Each node the coordinator polls keeps its own [`RetryBackoff`]: the
//! delay doubles on consecutive transport failures up to a cap and
//! resets to the base on any successfully decoded reply. Delays are
//! jittered to prevent a thundering herd when several nodes fail at
//! once (e.g. after a network partition heals).
//!
//! This is deliberately not a closure-retry helper: the main loop needs
//! the next deadline as a value it can store in `nodes_to_retry` and
//! re-arm its timer with.

use std::time::Duration;

/// Add jitter to a duration to prevent thundering herd.
///
/// Adds +/- 15% pseudo-random jitter to the base interval using the
/// `fastrand` thread-local PRNG.
fn with_jitter(base: Duration) -> Duration {
    // Random factor in [0.85, 1.15); fastrand::f64() is in [0.0, 1.0)
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;

    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

/// Exponential, capped, jittered backoff state for a single node.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl RetryBackoff {
    /// Create a backoff starting at `min` and capped at `max`.
    pub fn new(min: Duration, max: Duration) -> Self {
        debug_assert!(!min.is_zero() && max >= min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The next delay to wait, jittered. Each call doubles the base
    /// delay for the following call, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = with_jitter(self.current);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Reset to the base delay after a successful reply.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

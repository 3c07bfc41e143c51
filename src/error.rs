//! Error types for the migration reconciliation core.
//!
//! # Error Handling Patterns
//!
//! The core uses two patterns based on where an error is observed:
//!
//! ## Retryable (absorbed by the backend)
//!
//! Transport failures, rejected advance proposals and failed partition
//! actions never leave the reconciliation loop. They are logged with the
//! `(migration_id, ntp, sought_state)` triple and retried: RPCs with
//! per-node backoff, advance proposals on the next wakeup, partition
//! actions immediately while the replica stays managed and leader.
//!
//! ## Terminal (surfaced to the caller)
//!
//! [`MigrationError::ShuttingDown`] and
//! [`MigrationError::InvalidMigrationState`] resolve the pending future of
//! a specific worker request and are never retried: the request they
//! belonged to no longer exists.
//!
//! Impossible `(kind, sought_state)` combinations are programmer errors
//! and panic loudly rather than appearing in this enum.

use thiserror::Error;

/// Result type for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Errors produced and consumed by the reconciliation core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    /// The process-wide abort signal was observed.
    #[error("shutting down")]
    ShuttingDown,

    /// A state change invalidated an in-flight request; terminal for the
    /// old request only.
    #[error("migration state changed, request no longer valid")]
    InvalidMigrationState,

    /// A partition action failed unexpectedly (including panics and
    /// timeouts inside the action). Retryable.
    #[error("partition operation failed")]
    PartitionOperationFailed,

    /// RPC delivery or decoding failed. Retryable with backoff.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The migration frontend declined an advance proposal. Retried on
    /// the next wakeup.
    #[error("advance proposal rejected: {0}")]
    ProposalRejected(String),
}

impl MigrationError {
    /// Returns true if the backend may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::PartitionOperationFailed
                | MigrationError::TransportFailure(_)
                | MigrationError::ProposalRejected(_)
        )
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            MigrationError::ShuttingDown => "shutting_down",
            MigrationError::InvalidMigrationState => "invalid_state",
            MigrationError::PartitionOperationFailed => "operation_failed",
            MigrationError::TransportFailure(_) => "transport_failure",
            MigrationError::ProposalRejected(_) => "proposal_rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!MigrationError::ShuttingDown.is_retryable());
        assert!(!MigrationError::InvalidMigrationState.is_retryable());
        assert!(MigrationError::PartitionOperationFailed.is_retryable());
        assert!(MigrationError::TransportFailure("refused".to_string()).is_retryable());
        assert!(MigrationError::ProposalRejected("stale".to_string()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = MigrationError::TransportFailure("connection reset".to_string());
        assert!(format!("{}", err).contains("connection reset"));
        assert_eq!(format!("{}", MigrationError::ShuttingDown), "shutting down");
    }

    #[test]
    fn test_metric_labels_are_distinct() {
        let labels = [
            MigrationError::ShuttingDown.as_metric_label(),
            MigrationError::InvalidMigrationState.as_metric_label(),
            MigrationError::PartitionOperationFailed.as_metric_label(),
            MigrationError::TransportFailure(String::new()).as_metric_label(),
            MigrationError::ProposalRejected(String::new()).as_metric_label(),
        ];
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }
}

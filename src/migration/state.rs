//! Migration lifecycle states and the replica-level progress machine.
//!
//! A migration advances through a sequence of durable states; every step
//! must be reached by all partitions of all topics in the migration
//! before the recorded state moves on. The coordinator derives the next
//! *sought* state from the currently applied one with
//! [`next_sought_state`]; only a few `(kind, state)` combinations need
//! per-partition work on replica nodes, the rest are bookkeeping-only
//! and advance as soon as the coordinator observes them.
//!
//! # State Transitions
//!
//! ```text
//! inbound:  planned -> preparing -> prepared -> executing -> executed
//!              -> finishing -> finished
//! outbound: planned -> preparing -> prepared -> executing -> executed
//!              -> cut_over -> finished
//! any:      finished / cancelled are terminal
//! ```
//!
//! Per-partition work is required only towards `prepared` (both kinds)
//! and `executed` (outbound only).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a data migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationKind {
    /// External topic data is brought into the cluster.
    Inbound,
    /// A set of local topics is progressively removed from serving and
    /// handed out.
    Outbound,
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationKind::Inbound => write!(f, "inbound"),
            MigrationKind::Outbound => write!(f, "outbound"),
        }
    }
}

/// Durable state of a migration.
///
/// The variant order matches lifecycle progress; `CutOver` is reachable
/// only for outbound migrations and `Finishing` only for inbound ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Recorded but not yet acted on.
    Planned,
    /// Replicas are being prepared.
    Preparing,
    /// Every replica finished preparation.
    Prepared,
    /// The data transformation is running.
    Executing,
    /// Every replica finished the transformation.
    Executed,
    /// Outbound only: topics are being handed off.
    CutOver,
    /// Inbound only: final bookkeeping before completion.
    Finishing,
    /// Terminal: the migration completed.
    Finished,
    /// Terminal: the migration was cancelled.
    Cancelled,
}

impl MigrationState {
    /// Returns true for states that end the migration's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Finished | MigrationState::Cancelled)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationState::Planned => "planned",
            MigrationState::Preparing => "preparing",
            MigrationState::Prepared => "prepared",
            MigrationState::Executing => "executing",
            MigrationState::Executed => "executed",
            MigrationState::CutOver => "cut_over",
            MigrationState::Finishing => "finishing",
            MigrationState::Finished => "finished",
            MigrationState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Compute the next sought state for a migration with the given applied
/// state, or `None` if the applied state is terminal (or unreachable for
/// the kind).
pub fn next_sought_state(applied: MigrationState, kind: MigrationKind) -> Option<MigrationState> {
    use MigrationKind::*;
    use MigrationState::*;
    match (kind, applied) {
        (_, Planned) => Some(Preparing),
        (_, Preparing) => Some(Prepared),
        (_, Prepared) => Some(Executing),
        (_, Executing) => Some(Executed),
        (Inbound, Executed) => Some(Finishing),
        (Inbound, Finishing) => Some(Finished),
        (Outbound, Executed) => Some(CutOver),
        (Outbound, CutOver) => Some(Finished),
        // Finishing is unreachable for outbound, CutOver for inbound.
        (Outbound, Finishing) | (Inbound, CutOver) => None,
        (_, Finished) | (_, Cancelled) => None,
    }
}

/// Returns true if reaching `sought` requires a per-partition worker
/// action on replica nodes; all other steps are bookkeeping-only.
pub fn requires_partition_work(kind: MigrationKind, sought: MigrationState) -> bool {
    matches!(
        (kind, sought),
        (MigrationKind::Inbound, MigrationState::Prepared)
            | (MigrationKind::Outbound, MigrationState::Prepared)
            | (MigrationKind::Outbound, MigrationState::Executed)
    )
}

/// Progress of a single local replica towards the sought state.
///
/// Transitions: `WaitingForRpc -> CanRun` on RPC reception and worker
/// dispatch; `CanRun -> Done` on worker success. Retryable worker errors
/// keep the replica in `CanRun`. Shard loss or migration removal drop
/// the tracking entry in any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    /// No work dispatched yet; the coordinator has not asked, or the
    /// request did not match the local view.
    WaitingForRpc,
    /// The partition action was dispatched to a worker shard.
    CanRun,
    /// The action completed; the coordinator will retire the partition.
    Done,
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaStatus::WaitingForRpc => write!(f, "waiting_for_rpc"),
            ReplicaStatus::CanRun => write!(f, "can_run"),
            ReplicaStatus::Done => write!(f, "done"),
        }
    }
}

//! Seams to the cluster stores the backend consumes: topic topology,
//! shard assignments and partition leadership.
//!
//! The reconciliation backend never owns this data; it looks it up on
//! demand and subscribes to change notifications. Callbacks must be fast
//! and non-suspending; they enqueue an event and return. Each
//! registration returns an opaque [`NotificationId`] that must be
//! unregistered on shutdown.
//!
//! Cluster-metadata leadership is observed through the same
//! partition-leaders store, as leadership of the well-known controller
//! partition ([`controller_ntp`]).

use crate::types::{NodeId, NotificationId, Ntp, PartitionIndex, ShardId, TopicNamespace};

/// A change to the topic topology, at partition granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicDelta {
    /// The partition was created.
    Added(Ntp),
    /// The partition was deleted (e.g. its topic was removed).
    Removed(Ntp),
    /// The partition's replica set changed (replicas moved).
    Updated(Ntp),
}

impl TopicDelta {
    /// The partition the delta refers to.
    pub fn ntp(&self) -> &Ntp {
        match self {
            TopicDelta::Added(ntp) | TopicDelta::Removed(ntp) | TopicDelta::Updated(ntp) => ntp,
        }
    }
}

/// Callback invoked for every topology delta, in arrival order.
pub type DeltaCallback = Box<dyn Fn(&TopicDelta) + Send + Sync>;

/// Callback invoked when a partition's local shard assignment changes;
/// `None` means this node no longer owns a replica.
pub type ShardCallback = Box<dyn Fn(&Ntp, Option<ShardId>) + Send + Sync>;

/// Callback invoked when a partition's leader changes; `None` means the
/// partition currently has no leader.
pub type LeadershipCallback = Box<dyn Fn(&Ntp, Option<NodeId>) + Send + Sync>;

/// Read access to the cluster-wide topic topology.
pub trait TopicTopology: Send + Sync {
    /// Partition indexes of `topic`, or empty if the topic is unknown.
    fn partitions(&self, topic: &TopicNamespace) -> Vec<PartitionIndex>;

    /// Replica nodes of `ntp`, or empty if the partition is unknown.
    fn replicas(&self, ntp: &Ntp) -> Vec<NodeId>;

    /// Register a delta callback.
    fn subscribe_deltas(&self, callback: DeltaCallback) -> NotificationId;

    /// Remove a delta callback. Idempotent.
    fn unsubscribe_deltas(&self, id: NotificationId);
}

/// This node's view of which local shard holds each replica.
pub trait ShardTable: Send + Sync {
    /// Shard holding the local replica of `ntp`, or `None` if this node
    /// owns no replica of it.
    fn shard_for(&self, ntp: &Ntp) -> Option<ShardId>;

    /// Register an assignment-change callback.
    fn subscribe(&self, callback: ShardCallback) -> NotificationId;

    /// Remove an assignment-change callback. Idempotent.
    fn unsubscribe(&self, id: NotificationId);
}

/// Cluster-wide partition leadership.
pub trait PartitionLeaders: Send + Sync {
    /// Current leader of `ntp`, if known.
    fn leader(&self, ntp: &Ntp) -> Option<NodeId>;

    /// Register a leadership-change callback scoped to one NTP.
    fn subscribe_ntp(&self, ntp: &Ntp, callback: LeadershipCallback) -> NotificationId;

    /// Remove a leadership-change callback. Idempotent.
    fn unsubscribe(&self, id: NotificationId);
}

/// The well-known controller partition whose leader is the cluster
/// coordinator.
pub fn controller_ntp() -> Ntp {
    Ntp::new("kafka_internal", "controller", PartitionIndex(0))
}

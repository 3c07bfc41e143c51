//! Type-safe identifiers for the migration subsystem.
//!
//! These newtypes prevent mixing up integer ids that share an underlying
//! representation but carry different semantic meanings (migration ids,
//! node ids, shard ids, partition indexes, notification handles).
//!
//! Topic and partition names use `Arc<str>` so that keys can be cloned in
//! O(1); they are cloned on every reconciliation pass, RPC snapshot and
//! reverse-index update.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a data migration.
///
/// Assigned monotonically by the migration table when a migration record
/// is first created.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MigrationId(pub i64);

impl MigrationId {
    /// Invalid migration id, used to indicate an unset value.
    pub const INVALID: Self = MigrationId(-1);

    /// Create a new migration id from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        MigrationId(value)
    }

    /// Get the raw i64 value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a cluster node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub i32);

impl NodeId {
    /// Invalid node id, typically used to indicate no assignment.
    pub const INVALID: Self = NodeId(-1);

    /// Create a new node id from a raw value.
    #[inline]
    pub const fn new(value: i32) -> Self {
        NodeId(value)
    }

    /// Get the raw i32 value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a worker shard within a node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ShardId(pub u32);

impl ShardId {
    /// Create a new shard id from a raw value.
    #[inline]
    pub const fn new(value: u32) -> Self {
        ShardId(value)
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a partition within a topic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PartitionIndex(pub i32);

impl PartitionIndex {
    /// Create a new partition index from a raw value.
    #[inline]
    pub const fn new(value: i32) -> Self {
        PartitionIndex(value)
    }

    /// Get the raw i32 value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle returned by notification registration APIs.
///
/// Used to unregister the callback; unregistration is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotificationId(pub u64);

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A namespaced topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicNamespace {
    /// Namespace the topic lives in (e.g. `kafka`).
    pub namespace: Arc<str>,
    /// Topic name.
    pub topic: Arc<str>,
}

impl TopicNamespace {
    /// Create a new namespaced topic name.
    pub fn new(namespace: impl Into<Arc<str>>, topic: impl Into<Arc<str>>) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for TopicNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.topic)
    }
}

/// The addressable unit of replicated storage: namespace, topic and
/// partition index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ntp {
    /// Namespace the topic lives in.
    pub namespace: Arc<str>,
    /// Topic name.
    pub topic: Arc<str>,
    /// Partition index within the topic.
    pub partition: PartitionIndex,
}

impl Ntp {
    /// Create a new NTP.
    pub fn new(
        namespace: impl Into<Arc<str>>,
        topic: impl Into<Arc<str>>,
        partition: PartitionIndex,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Build an NTP from a topic name and partition index.
    pub fn from_topic(topic: &TopicNamespace, partition: PartitionIndex) -> Self {
        Self {
            namespace: topic.namespace.clone(),
            topic: topic.topic.clone(),
            partition,
        }
    }

    /// The topic portion of this NTP.
    pub fn topic_namespace(&self) -> TopicNamespace {
        TopicNamespace {
            namespace: self.namespace.clone(),
            topic: self.topic.clone(),
        }
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}

//! Migration records and per-partition work descriptions.
//!
//! A [`MigrationRecord`] is the durable description of a migration as
//! published by the migration table: an id, an inbound or outbound
//! payload naming the affected topics in a fixed order, and the
//! currently applied state. The order of the topic list is significant:
//! reconciliation stores each topic's position as a tie-breaker and for
//! stable iteration.
//!
//! [`PartitionWork`] is the unit handed to a worker shard: the migration
//! id, the sought state and a payload variant carrying the kind-specific
//! details the partition action needs.

use serde::{Deserialize, Serialize};

use crate::migration::state::{MigrationKind, MigrationState, next_sought_state};
use crate::types::{MigrationId, TopicNamespace};

/// A topic brought in by an inbound migration.
///
/// The data originates from `source`; when `alias` is set the topic is
/// served locally under that name instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundTopic {
    /// Topic name at the origin.
    pub source: TopicNamespace,
    /// Optional local name overriding `source`.
    pub alias: Option<TopicNamespace>,
}

impl InboundTopic {
    /// The name under which the topic exists in this cluster.
    pub fn effective_topic(&self) -> &TopicNamespace {
        self.alias.as_ref().unwrap_or(&self.source)
    }
}

/// Payload of an inbound migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMigration {
    /// Topics to bring in, in a fixed order.
    pub topics: Vec<InboundTopic>,
}

/// Destination for data handed out by an outbound migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyTarget {
    /// Destination bucket or location name.
    pub bucket: String,
}

/// Payload of an outbound migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMigration {
    /// Topics to hand out, in a fixed order.
    pub topics: Vec<TopicNamespace>,
    /// Optional copy destination forwarded to partition work.
    pub copy_to: Option<CopyTarget>,
}

/// Kind-specific payload of a migration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationDescriptor {
    /// Bring external topic data into the cluster.
    Inbound(InboundMigration),
    /// Remove local topics from serving and hand their data out.
    Outbound(OutboundMigration),
}

impl MigrationDescriptor {
    /// Direction of the migration.
    pub fn kind(&self) -> MigrationKind {
        match self {
            MigrationDescriptor::Inbound(_) => MigrationKind::Inbound,
            MigrationDescriptor::Outbound(_) => MigrationKind::Outbound,
        }
    }

    /// The topics this migration touches, as served locally, in record
    /// order.
    pub fn topics(&self) -> Vec<TopicNamespace> {
        match self {
            MigrationDescriptor::Inbound(im) => {
                im.topics.iter().map(|t| t.effective_topic().clone()).collect()
            }
            MigrationDescriptor::Outbound(om) => om.topics.clone(),
        }
    }
}

/// Durable migration record as published by the migration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration identifier, monotonically assigned.
    pub id: MigrationId,
    /// Kind-specific payload.
    pub descriptor: MigrationDescriptor,
    /// Currently applied durable state.
    pub state: MigrationState,
}

impl MigrationRecord {
    /// Direction of the migration.
    pub fn kind(&self) -> MigrationKind {
        self.descriptor.kind()
    }

    /// Topics touched by this migration, in record order.
    pub fn topics(&self) -> Vec<TopicNamespace> {
        self.descriptor.topics()
    }

    /// The state every replica must reach next, or `None` if the applied
    /// state is terminal.
    pub fn sought_state(&self) -> Option<MigrationState> {
        next_sought_state(self.state, self.kind())
    }
}

/// Kind-specific details a partition action needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionWorkInfo {
    /// Inbound work; carries the local alias when the topic is renamed.
    Inbound {
        /// Local alias of the topic, if any.
        alias: Option<TopicNamespace>,
    },
    /// Outbound work; carries the copy destination when data is handed
    /// out.
    Outbound {
        /// Copy destination, if any.
        copy_to: Option<CopyTarget>,
    },
}

impl PartitionWorkInfo {
    /// The migration direction this work belongs to.
    pub fn kind(&self) -> MigrationKind {
        match self {
            PartitionWorkInfo::Inbound { .. } => MigrationKind::Inbound,
            PartitionWorkInfo::Outbound { .. } => MigrationKind::Outbound,
        }
    }
}

/// The unit of work dispatched to a worker shard for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionWork {
    /// Migration the work belongs to.
    pub migration_id: MigrationId,
    /// State the replica must reach.
    pub sought_state: MigrationState,
    /// Kind-specific details.
    pub info: PartitionWorkInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> TopicNamespace {
        TopicNamespace::new("kafka", name)
    }

    #[test]
    fn test_inbound_effective_topic() {
        let plain = InboundTopic {
            source: topic("orders"),
            alias: None,
        };
        assert_eq!(plain.effective_topic(), &topic("orders"));

        let aliased = InboundTopic {
            source: topic("orders"),
            alias: Some(topic("orders-imported")),
        };
        assert_eq!(aliased.effective_topic(), &topic("orders-imported"));
    }

    #[test]
    fn test_record_topics_preserve_order() {
        let record = MigrationRecord {
            id: MigrationId(1),
            descriptor: MigrationDescriptor::Outbound(OutboundMigration {
                topics: vec![topic("b"), topic("a"), topic("c")],
                copy_to: None,
            }),
            state: MigrationState::Planned,
        };
        assert_eq!(record.topics(), vec![topic("b"), topic("a"), topic("c")]);
        assert_eq!(record.kind(), MigrationKind::Outbound);
    }

    #[test]
    fn test_sought_state_follows_applied() {
        let mut record = MigrationRecord {
            id: MigrationId(2),
            descriptor: MigrationDescriptor::Inbound(InboundMigration {
                topics: vec![InboundTopic {
                    source: topic("t"),
                    alias: None,
                }],
            }),
            state: MigrationState::Preparing,
        };
        assert_eq!(record.sought_state(), Some(MigrationState::Prepared));

        record.state = MigrationState::Cancelled;
        assert_eq!(record.sought_state(), None);
    }
}

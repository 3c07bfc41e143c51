//! Data-migration reconciliation for a log-streaming cluster.
//!
//! A data migration is a durable, cluster-wide, multi-step
//! transformation of a set of topics: an *inbound* migration brings
//! external topic data into the cluster, an *outbound* migration
//! progressively removes local topics from serving and hands their data
//! out. Every step must be reached by every partition of every topic
//! before the migration's recorded state advances.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │  migration table │  durable records + notifications
//!                 └───────┬──────────┘
//!             records     │      ▲ propose_advance (frontend)
//!                         ▼      │
//!                 ┌──────────────┴───┐   check_ntp_states   ┌────────┐
//!                 │  reconciliation  │◄────────────────────►│  peer  │
//!                 │     backend      │                      │ nodes  │
//!                 └───┬──────────▲───┘                      └────────┘
//!        dispatch     │          │ completions
//!                     ▼          │
//!              ┌──────────┐ ┌──────────┐
//!              │ worker 0 │ │ worker N │   one per shard
//!              └──────────┘ └──────────┘
//! ```
//!
//! The backend plays two roles at once: exactly one node (the one
//! leading the cluster-metadata partition) coordinates cluster-wide
//! progress and polls peers; every node drives its locally-owned
//! replicas through per-shard workers. Topic topology, shard assignment
//! and partition leadership are consumed through notification seams in
//! [`topology`].

pub mod backend;
pub mod backoff;
pub mod config;
pub mod metadata;
pub mod metrics;
pub mod rpc;
pub mod state;
pub mod table;
pub mod topology;
pub mod worker;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub use backend::{ReconciliationBackend, ReconciliationOverview};
pub use backoff::RetryBackoff;
pub use config::MigrationConfig;
pub use metadata::{
    CopyTarget, InboundMigration, InboundTopic, MigrationDescriptor, MigrationRecord,
    OutboundMigration, PartitionWork, PartitionWorkInfo,
};
pub use rpc::{
    CheckNtpStatesReply, CheckNtpStatesRequest, MigrationRpcService, NtpMigrationTuple,
    NtpStateReport, PeerClient,
};
pub use state::{
    MigrationKind, MigrationState, ReplicaStatus, next_sought_state, requires_partition_work,
};
pub use table::{MigrationFrontend, MigrationTable};
pub use topology::{PartitionLeaders, ShardTable, TopicDelta, TopicTopology, controller_ntp};
pub use worker::{NoopActionRunner, PartitionActionRunner, Worker};

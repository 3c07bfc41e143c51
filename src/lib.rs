//! # Caravan
//! Data-migration reconciliation core for Kafka-compatible log-streaming
//! clusters.
//!
//! This crate provides the two-role reconciliation engine that drives
//! durable, cluster-wide data migrations: a cluster coordinator tracking
//! which replicas have not yet reached a migration's sought state, and a
//! node-local driver dispatching partition-scoped actions to per-shard
//! workers. This is pure Rust all the way down; meaning memory safety,
//! safe concurrency, low resource usage, and speed.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/)
//! - Be a building block for Kafka-compatible cluster services
//!
//! ## Getting started
//!
//! The [`ReconciliationBackend`](migration::ReconciliationBackend) is the
//! constructed root: it owns the per-shard workers and every
//! subscription to the stores it consumes. Production wiring provides
//! real implementations of the seams in [`migration::topology`], a
//! durable [`MigrationFrontend`](migration::MigrationFrontend) and a
//! networked [`PeerClient`](migration::PeerClient); the in-memory
//! implementations behind the `test-utilities` feature show the
//! contract each seam must honour.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use caravan::migration::{
//!     MigrationConfig, MigrationTable, NoopActionRunner, ReconciliationBackend,
//! };
//! use caravan::migration::mock::{
//!     InMemoryLeaders, InMemoryShards, InMemoryTopics, LoopbackFrontend, RoutingPeerClient,
//! };
//! use caravan::types::NodeId;
//!
//! #[tokio::main]
//! async fn main() {
//!     let table = Arc::new(MigrationTable::new());
//!     let backend = ReconciliationBackend::new(
//!         NodeId(0),
//!         MigrationConfig::default(),
//!         table.clone(),
//!         LoopbackFrontend::new(table),
//!         Arc::new(NoopActionRunner),
//!         RoutingPeerClient::new(),
//!         InMemoryTopics::new(),
//!         InMemoryShards::new(),
//!         InMemoryLeaders::new(),
//!     );
//!     backend.start();
//!     // ... drive the table, topology and leadership stores ...
//!     backend.stop().await;
//! }
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod migration;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports of the reconciliation core.
    pub use crate::error::{MigrationError, MigrationResult};
    pub use crate::migration::{
        MigrationConfig, MigrationKind, MigrationRecord, MigrationState, MigrationTable,
        ReconciliationBackend, ReplicaStatus,
    };
    pub use crate::types::{
        MigrationId, NodeId, NotificationId, Ntp, PartitionIndex, ShardId, TopicNamespace,
    };
}

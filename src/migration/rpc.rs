//! The `check_ntp_states` peer RPC: request/reply types, the client
//! seam, and the serving endpoint.
//!
//! The coordinator polls every node owning an outstanding replica with a
//! [`CheckNtpStatesRequest`] naming `(ntp, migration_id, sought_state)`
//! tuples; the node answers with the current [`ReplicaStatus`] of each
//! tuple, in request order. The request is idempotent: repeating it
//! yields the same reply and the same resulting state once the first
//! call's side effects settle. Unknown tuples answer `waiting_for_rpc`.
//!
//! Wire encoding, authentication and transport are out of scope; the
//! types are plain serde-serializable structs handed to the
//! [`PeerClient`] implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::MigrationResult;
use crate::migration::backend::ReconciliationBackend;
use crate::migration::state::{MigrationState, ReplicaStatus};
use crate::types::{MigrationId, NodeId, Ntp};

/// One `(ntp, migration, sought state)` tuple the coordinator asks
/// about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtpMigrationTuple {
    /// Partition being tracked.
    pub ntp: Ntp,
    /// Migration the partition belongs to.
    pub migration_id: MigrationId,
    /// State the replica must reach.
    pub sought_state: MigrationState,
}

/// Request asking a node to report progress of its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckNtpStatesRequest {
    /// Tuples to report on, in a fixed order.
    pub entries: Vec<NtpMigrationTuple>,
}

/// Progress report for a single tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtpStateReport {
    /// Partition the report refers to.
    pub ntp: Ntp,
    /// Migration the partition belongs to.
    pub migration_id: MigrationId,
    /// State the replica must reach.
    pub sought_state: MigrationState,
    /// Current local progress.
    pub status: ReplicaStatus,
}

/// Reply carrying one report per requested tuple, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckNtpStatesReply {
    /// Reports, in request order.
    pub entries: Vec<NtpStateReport>,
}

/// Request/reply channel to peer nodes.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Deliver `request` to `node` and await its reply.
    async fn check_ntp_states(
        &self,
        node: NodeId,
        request: CheckNtpStatesRequest,
    ) -> MigrationResult<CheckNtpStatesReply>;
}

/// Serving side of the peer RPC on this node.
///
/// A thin shim between the transport and the reconciliation backend's
/// local world; the transport layer decodes a request, calls
/// [`MigrationRpcService::check_ntp_states`] and encodes the reply.
pub struct MigrationRpcService {
    backend: Arc<ReconciliationBackend>,
}

impl MigrationRpcService {
    /// Create a service answering from `backend`'s local state.
    pub fn new(backend: Arc<ReconciliationBackend>) -> Self {
        Self { backend }
    }

    /// Serve one request.
    pub async fn check_ntp_states(&self, request: CheckNtpStatesRequest) -> CheckNtpStatesReply {
        self.backend.check_ntp_states_locally(request).await
    }
}

//! In-memory stores and scripted collaborators for testing.
//!
//! Full-featured in-memory implementations of every seam the backend
//! consumes: topic topology, shard assignments, partition leadership,
//! the loopback frontend and a routing peer client. Available when the
//! `test-utilities` feature is enabled, or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! caravan = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::error::{MigrationError, MigrationResult};
use crate::migration::backend::ReconciliationBackend;
use crate::migration::metadata::PartitionWork;
use crate::migration::rpc::{CheckNtpStatesReply, CheckNtpStatesRequest, NtpStateReport, PeerClient};
use crate::migration::state::{MigrationState, ReplicaStatus, next_sought_state};
use crate::migration::table::{MigrationFrontend, MigrationTable};
use crate::migration::topology::{
    DeltaCallback, LeadershipCallback, PartitionLeaders, ShardCallback, ShardTable, TopicDelta,
    TopicTopology,
};
use crate::migration::worker::PartitionActionRunner;
use crate::types::{MigrationId, NodeId, NotificationId, Ntp, PartitionIndex, ShardId, TopicNamespace};

/// In-memory topic topology with mutation helpers that fire deltas.
pub struct InMemoryTopics {
    replicas: DashMap<Ntp, Vec<NodeId>>,
    callbacks: Mutex<HashMap<NotificationId, DeltaCallback>>,
    next_notification: AtomicU64,
}

impl InMemoryTopics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replicas: DashMap::new(),
            callbacks: Mutex::new(HashMap::new()),
            next_notification: AtomicU64::new(1),
        })
    }

    /// Create or update a partition and fire the matching delta.
    pub fn set_partition(&self, ntp: &Ntp, replicas: Vec<NodeId>) {
        let existed = self.replicas.insert(ntp.clone(), replicas).is_some();
        let delta = if existed {
            TopicDelta::Updated(ntp.clone())
        } else {
            TopicDelta::Added(ntp.clone())
        };
        self.fire(&delta);
    }

    /// Delete a partition and fire a removal delta.
    pub fn remove_partition(&self, ntp: &Ntp) {
        if self.replicas.remove(ntp).is_some() {
            self.fire(&TopicDelta::Removed(ntp.clone()));
        }
    }

    fn fire(&self, delta: &TopicDelta) {
        let callbacks = self.callbacks.lock().expect("delta registry poisoned");
        for callback in callbacks.values() {
            callback(delta);
        }
    }
}

impl TopicTopology for InMemoryTopics {
    fn partitions(&self, topic: &TopicNamespace) -> Vec<PartitionIndex> {
        let mut partitions: Vec<PartitionIndex> = self
            .replicas
            .iter()
            .filter(|entry| entry.key().topic_namespace() == *topic)
            .map(|entry| entry.key().partition)
            .collect();
        partitions.sort();
        partitions
    }

    fn replicas(&self, ntp: &Ntp) -> Vec<NodeId> {
        self.replicas
            .get(ntp)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    fn subscribe_deltas(&self, callback: DeltaCallback) -> NotificationId {
        let id = NotificationId(self.next_notification.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .expect("delta registry poisoned")
            .insert(id, callback);
        id
    }

    fn unsubscribe_deltas(&self, id: NotificationId) {
        self.callbacks
            .lock()
            .expect("delta registry poisoned")
            .remove(&id);
    }
}

/// In-memory shard table with a mutation helper that fires updates.
pub struct InMemoryShards {
    assignments: DashMap<Ntp, ShardId>,
    callbacks: Mutex<HashMap<NotificationId, ShardCallback>>,
    next_notification: AtomicU64,
}

impl InMemoryShards {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            assignments: DashMap::new(),
            callbacks: Mutex::new(HashMap::new()),
            next_notification: AtomicU64::new(1),
        })
    }

    /// Assign (or clear) the local shard of a replica and fire the
    /// change.
    pub fn set_shard(&self, ntp: &Ntp, shard: Option<ShardId>) {
        match shard {
            Some(shard) => {
                self.assignments.insert(ntp.clone(), shard);
            }
            None => {
                self.assignments.remove(ntp);
            }
        }
        let callbacks = self.callbacks.lock().expect("shard registry poisoned");
        for callback in callbacks.values() {
            callback(ntp, shard);
        }
    }
}

impl ShardTable for InMemoryShards {
    fn shard_for(&self, ntp: &Ntp) -> Option<ShardId> {
        self.assignments.get(ntp).map(|s| *s.value())
    }

    fn subscribe(&self, callback: ShardCallback) -> NotificationId {
        let id = NotificationId(self.next_notification.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .expect("shard registry poisoned")
            .insert(id, callback);
        id
    }

    fn unsubscribe(&self, id: NotificationId) {
        self.callbacks
            .lock()
            .expect("shard registry poisoned")
            .remove(&id);
    }
}

/// In-memory partition leadership with a mutation helper that fires
/// scoped notifications.
pub struct InMemoryLeaders {
    leaders: DashMap<Ntp, NodeId>,
    subscriptions: Mutex<HashMap<NotificationId, (Ntp, LeadershipCallback)>>,
    next_notification: AtomicU64,
}

impl InMemoryLeaders {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            leaders: DashMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
            next_notification: AtomicU64::new(1),
        })
    }

    /// Move (or clear) leadership of a partition and notify scoped
    /// subscribers.
    pub fn set_leader(&self, ntp: &Ntp, leader: Option<NodeId>) {
        match leader {
            Some(node) => {
                self.leaders.insert(ntp.clone(), node);
            }
            None => {
                self.leaders.remove(ntp);
            }
        }
        let subscriptions = self
            .subscriptions
            .lock()
            .expect("leadership registry poisoned");
        for (scoped_ntp, callback) in subscriptions.values() {
            if scoped_ntp == ntp {
                callback(ntp, leader);
            }
        }
    }
}

impl PartitionLeaders for InMemoryLeaders {
    fn leader(&self, ntp: &Ntp) -> Option<NodeId> {
        self.leaders.get(ntp).map(|n| *n.value())
    }

    fn subscribe_ntp(&self, ntp: &Ntp, callback: LeadershipCallback) -> NotificationId {
        let id = NotificationId(self.next_notification.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .expect("leadership registry poisoned")
            .insert(id, (ntp.clone(), callback));
        id
    }

    fn unsubscribe(&self, id: NotificationId) {
        self.subscriptions
            .lock()
            .expect("leadership registry poisoned")
            .remove(&id);
    }
}

/// Frontend that applies accepted proposals straight back to the table,
/// deduplicating by the currently applied state.
pub struct LoopbackFrontend {
    table: Arc<MigrationTable>,
}

impl LoopbackFrontend {
    pub fn new(table: Arc<MigrationTable>) -> Arc<Self> {
        Arc::new(Self { table })
    }
}

#[async_trait]
impl MigrationFrontend for LoopbackFrontend {
    async fn propose_advance(
        &self,
        id: MigrationId,
        new_state: MigrationState,
    ) -> MigrationResult<()> {
        let Some(mut record) = self.table.snapshot(id) else {
            return Err(MigrationError::ProposalRejected(format!(
                "unknown migration {id}"
            )));
        };
        if record.state == new_state {
            // duplicate delivery of an already-applied advance
            return Ok(());
        }
        if next_sought_state(record.state, record.kind()) == Some(new_state) {
            record.state = new_state;
            self.table.apply(record);
            Ok(())
        } else {
            Err(MigrationError::ProposalRejected(format!(
                "cannot advance migration {id} from {} to {}",
                record.state, new_state
            )))
        }
    }
}

/// Scripted reply generator for nodes without a live backend.
pub type Responder =
    Box<dyn Fn(CheckNtpStatesRequest) -> MigrationResult<CheckNtpStatesReply> + Send + Sync>;

/// Build a reply echoing every requested tuple with one status.
pub fn reply_with_status(
    request: &CheckNtpStatesRequest,
    status: ReplicaStatus,
) -> CheckNtpStatesReply {
    CheckNtpStatesReply {
        entries: request
            .entries
            .iter()
            .map(|tuple| NtpStateReport {
                ntp: tuple.ntp.clone(),
                migration_id: tuple.migration_id,
                sought_state: tuple.sought_state,
                status,
            })
            .collect(),
    }
}

/// Peer client that routes requests to registered backends, scripted
/// responders, or injected failures; counts calls per node.
pub struct RoutingPeerClient {
    backends: Mutex<HashMap<NodeId, Weak<ReconciliationBackend>>>,
    responders: Mutex<HashMap<NodeId, Responder>>,
    failures: DashMap<NodeId, u32>,
    calls: DashMap<NodeId, u32>,
}

impl RoutingPeerClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backends: Mutex::new(HashMap::new()),
            responders: Mutex::new(HashMap::new()),
            failures: DashMap::new(),
            calls: DashMap::new(),
        })
    }

    /// Route requests for `node` to a live backend's local endpoint.
    pub fn route(&self, node: NodeId, backend: &Arc<ReconciliationBackend>) {
        self.backends
            .lock()
            .expect("route registry poisoned")
            .insert(node, Arc::downgrade(backend));
    }

    /// Answer requests for `node` with a scripted responder.
    pub fn respond_with(&self, node: NodeId, responder: Responder) {
        self.responders
            .lock()
            .expect("responder registry poisoned")
            .insert(node, responder);
    }

    /// Fail the next `count` requests to `node` with a transport error.
    pub fn fail_times(&self, node: NodeId, count: u32) {
        self.failures.insert(node, count);
    }

    /// Requests attempted against `node` so far.
    pub fn calls(&self, node: NodeId) -> u32 {
        self.calls.get(&node).map(|c| *c.value()).unwrap_or(0)
    }
}

#[async_trait]
impl PeerClient for RoutingPeerClient {
    async fn check_ntp_states(
        &self,
        node: NodeId,
        request: CheckNtpStatesRequest,
    ) -> MigrationResult<CheckNtpStatesReply> {
        *self.calls.entry(node).or_insert(0) += 1;
        if let Some(mut remaining) = self.failures.get_mut(&node) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MigrationError::TransportFailure(format!(
                    "injected failure for node {node}"
                )));
            }
        }
        let target = self
            .backends
            .lock()
            .expect("route registry poisoned")
            .get(&node)
            .cloned();
        if let Some(backend) = target.and_then(|weak| weak.upgrade()) {
            return Ok(backend.check_ntp_states_locally(request).await);
        }
        let responders = self.responders.lock().expect("responder registry poisoned");
        if let Some(responder) = responders.get(&node) {
            return responder(request);
        }
        Err(MigrationError::TransportFailure(format!(
            "no route to node {node}"
        )))
    }
}

/// Partition action runner with per-NTP scripting: injected failures,
/// holds that block completion until released, and call counting.
pub struct ScriptedRunner {
    calls: DashMap<Ntp, u32>,
    failures: DashMap<Ntp, u32>,
    holds: DashMap<Ntp, Arc<Semaphore>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: DashMap::new(),
            failures: DashMap::new(),
            holds: DashMap::new(),
        })
    }

    /// Fail the next `count` runs for `ntp` with a retryable error.
    pub fn fail_times(&self, ntp: &Ntp, count: u32) {
        self.failures.insert(ntp.clone(), count);
    }

    /// Block runs for `ntp` until [`ScriptedRunner::release`] is
    /// called.
    pub fn hold(&self, ntp: &Ntp) {
        self.holds.insert(ntp.clone(), Arc::new(Semaphore::new(0)));
    }

    /// Release one held run for `ntp`.
    pub fn release(&self, ntp: &Ntp) {
        if let Some(gate) = self.holds.get(ntp) {
            gate.add_permits(1);
        }
    }

    /// Runs attempted for `ntp` so far.
    pub fn calls(&self, ntp: &Ntp) -> u32 {
        self.calls.get(ntp).map(|c| *c.value()).unwrap_or(0)
    }
}

#[async_trait]
impl PartitionActionRunner for ScriptedRunner {
    async fn run(&self, ntp: &Ntp, _work: &PartitionWork) -> MigrationResult<()> {
        *self.calls.entry(ntp.clone()).or_insert(0) += 1;
        let gate = self.holds.get(ntp).map(|g| g.value().clone());
        if let Some(gate) = gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(MigrationError::ShuttingDown),
            }
        }
        if let Some(mut remaining) = self.failures.get_mut(ntp) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MigrationError::PartitionOperationFailed);
            }
        }
        Ok(())
    }
}

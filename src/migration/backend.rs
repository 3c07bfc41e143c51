//! Cluster-wide coordinator for migrations, as well as node-local
//! driver for partition-specific actions.
//!
//! The backend runs on every node and plays two roles:
//!
//! - **Coordinator** (exactly one instance cluster-wide, co-located with
//!   the cluster-metadata leader): tracks, per in-flight migration,
//!   which `(topic, partition, replica-node)` tuples have not yet
//!   reached the sought state, polls each node owning an outstanding
//!   replica with `check_ntp_states`, and proposes a durable state
//!   advance once every partition arrived.
//! - **Local driver** (every node): tracks the replicas this node owns,
//!   keeps each in a `waiting_for_rpc -> can_run -> done` state and
//!   dispatches partition work to the owning worker shard when asked by
//!   the coordinator.
//!
//! # Reconciliation data
//!
//! When this node is not the coordinator, `migration_states` stores
//! sought states and topics only, with no partitions; `node_states` and
//! `nodes_to_retry` are empty.
//!
//! The following invariants may only be violated while a loop iteration
//! holds the state lock, and are restored before it is released. When
//! this node is the coordinator:
//!
//! - `migration_states` and `node_states` store the same set of
//!   migration/ntp combinations.
//! - The keys of `topic_migration_map` equal the union of outstanding
//!   topics across `migration_states`.
//! - For each node there is no more than one RPC in flight at a time
//!   within a coordinator epoch; nodes in `node_states` are exactly the
//!   nodes awaiting retry plus the nodes with an RPC in flight.
//! - `work_states` only contains topics of migrations present in
//!   `migration_states`.
//!
//! The main loop owns a bounded event channel; notification callbacks
//! enqueue events without blocking. If the channel overflows, a flag
//! forces a full resync from the migration table on the next pass, so
//! no notification is ever lost.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::MigrationResult;
use crate::migration::backoff::RetryBackoff;
use crate::migration::config::MigrationConfig;
use crate::migration::metadata::{MigrationDescriptor, PartitionWork, PartitionWorkInfo};
use crate::migration::metrics;
use crate::migration::rpc::{
    CheckNtpStatesReply, CheckNtpStatesRequest, NtpMigrationTuple, NtpStateReport, PeerClient,
};
use crate::migration::state::{MigrationState, ReplicaStatus, requires_partition_work};
use crate::migration::table::{MigrationFrontend, MigrationTable};
use crate::migration::topology::{
    PartitionLeaders, ShardTable, TopicDelta, TopicTopology, controller_ntp,
};
use crate::migration::worker::{PartitionActionRunner, Worker};
use crate::types::{
    MigrationId, NodeId, NotificationId, Ntp, PartitionIndex, ShardId, TopicNamespace,
};

/// Reconciliation progress of one topic within a migration.
struct TopicReconciliationState {
    /// Position of the topic in the migration record's topic list; used
    /// as a tie-breaker and for stable iteration.
    idx_in_migration: usize,
    /// Replica nodes that have not yet confirmed the sought state, per
    /// partition. Empty on non-coordinator nodes.
    outstanding_partitions: HashMap<PartitionIndex, Vec<NodeId>>,
}

/// Reconciliation progress of one migration.
struct MigrationReconciliationState {
    sought_state: MigrationState,
    outstanding_topics: HashMap<TopicNamespace, TopicReconciliationState>,
}

/// A queued durable state advance.
struct AdvanceInfo {
    sought_state: MigrationState,
    sent: bool,
}

/// Local tracking state for one replica this node owns.
#[derive(Debug, Clone)]
struct ReplicaWorkState {
    migration_id: MigrationId,
    sought_state: MigrationState,
    /// Shard holding the replica; `None` while the shard store has no
    /// assignment for it.
    shard: Option<ShardId>,
    status: ReplicaStatus,
}

/// Events feeding the main loop. Notification callbacks produce them;
/// the loop's receiver integrates them serially.
enum BackendEvent {
    MigrationUpdated(MigrationId),
    Delta(TopicDelta),
    ShardUpdated {
        ntp: Ntp,
        shard: Option<ShardId>,
    },
    LeadershipChanged,
    WorkCompleted {
        ntp: Ntp,
        migration_id: MigrationId,
        sought_state: MigrationState,
    },
    RpcFinished {
        node: NodeId,
        epoch: u64,
        result: MigrationResult<CheckNtpStatesReply>,
    },
    AdvanceFinished {
        migration_id: MigrationId,
        sought_state: MigrationState,
        result: MigrationResult<()>,
    },
}

/// All mutable reconciliation state, guarded by one mutex.
#[derive(Default)]
struct BackendState {
    is_coordinator: bool,
    /// Bumped on every coordinator role change; stale RPC replies carry
    /// an older epoch and are discarded.
    epoch: u64,
    migration_states: HashMap<MigrationId, MigrationReconciliationState>,
    /// Reverse map for topics in `migration_states`.
    topic_migration_map: HashMap<TopicNamespace, MigrationId>,
    /// Reverse index keyed by RPC destination.
    node_states: HashMap<NodeId, HashMap<Ntp, MigrationId>>,
    nodes_to_retry: HashMap<NodeId, Instant>,
    in_flight: HashSet<NodeId>,
    node_backoff: HashMap<NodeId, RetryBackoff>,
    advance_requests: HashMap<MigrationId, AdvanceInfo>,
    advance_retry_at: Option<Instant>,
    unprocessed_deltas: Vec<TopicDelta>,
    pending_migrations: Vec<MigrationId>,
    /// Node-local replica tracking, nested as topic -> partition so a
    /// topic-granular notification touches one entry.
    work_states: HashMap<TopicNamespace, HashMap<PartitionIndex, ReplicaWorkState>>,
}

struct Subscriptions {
    shard: NotificationId,
    topic: NotificationId,
    leadership: NotificationId,
    migrations: NotificationId,
}

/// Cheap snapshot of reconciliation progress, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationOverview {
    /// Whether this node currently coordinates cluster-wide
    /// reconciliation.
    pub is_coordinator: bool,
    /// Migrations with reconciliation tracking on this node.
    pub tracked_migrations: usize,
    /// Partitions not yet confirmed at the sought state (coordinator
    /// view).
    pub outstanding_partitions: usize,
    /// Nodes scheduled for a delayed RPC attempt.
    pub nodes_awaiting_retry: usize,
    /// Nodes with an RPC currently in flight.
    pub nodes_with_rpc_in_flight: usize,
    /// Local partitions with tracked migration work.
    pub local_partitions: usize,
    /// Queued durable state advances.
    pub pending_advances: usize,
}

/// The two-role reconciliation engine. See the module docs.
pub struct ReconciliationBackend {
    self_node: NodeId,
    config: MigrationConfig,
    table: Arc<MigrationTable>,
    frontend: Arc<dyn MigrationFrontend>,
    peers: Arc<dyn PeerClient>,
    topics: Arc<dyn TopicTopology>,
    shards: Arc<dyn ShardTable>,
    leaders: Arc<dyn PartitionLeaders>,
    workers: Vec<Arc<Worker>>,
    state: Mutex<BackendState>,
    events: mpsc::Sender<BackendEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<BackendEvent>>>,
    resync: AtomicBool,
    shutdown: broadcast::Sender<()>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    subscriptions: StdMutex<Option<Subscriptions>>,
    stopping: AtomicBool,
}

impl ReconciliationBackend {
    /// Construct the backend and its per-shard workers.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails validation; constructing the backend
    /// with a broken configuration is a programmer error.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_node: NodeId,
        config: MigrationConfig,
        table: Arc<MigrationTable>,
        frontend: Arc<dyn MigrationFrontend>,
        runner: Arc<dyn PartitionActionRunner>,
        peers: Arc<dyn PeerClient>,
        topics: Arc<dyn TopicTopology>,
        shards: Arc<dyn ShardTable>,
        leaders: Arc<dyn PartitionLeaders>,
    ) -> Arc<Self> {
        if let Err(problem) = config.validate() {
            panic!("invalid migration config: {problem}");
        }
        let (events, events_rx) = mpsc::channel(config.event_queue_capacity);
        let (shutdown, _) = broadcast::channel(1);
        let workers = (0..config.shards)
            .map(|shard| {
                Worker::new(
                    ShardId(shard),
                    self_node,
                    leaders.clone(),
                    runner.clone(),
                    config.worker_operation_timeout,
                )
            })
            .collect();
        Arc::new(Self {
            self_node,
            config,
            table,
            frontend,
            peers,
            topics,
            shards,
            leaders,
            workers,
            state: Mutex::new(BackendState::default()),
            events,
            events_rx: StdMutex::new(Some(events_rx)),
            resync: AtomicBool::new(false),
            shutdown,
            tasks: StdMutex::new(Vec::new()),
            subscriptions: StdMutex::new(None),
            stopping: AtomicBool::new(false),
        })
    }

    /// Subscribe to all notification sources and start the main loop.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let migrations = self.table.subscribe(Box::new({
            let weak = weak.clone();
            move |id| {
                if let Some(backend) = weak.upgrade() {
                    backend.enqueue(BackendEvent::MigrationUpdated(id));
                }
            }
        }));
        let leadership = self.leaders.subscribe_ntp(
            &controller_ntp(),
            Box::new({
                let weak = weak.clone();
                move |_ntp, _leader| {
                    if let Some(backend) = weak.upgrade() {
                        backend.enqueue(BackendEvent::LeadershipChanged);
                    }
                }
            }),
        );
        let topic = self.topics.subscribe_deltas(Box::new({
            let weak = weak.clone();
            move |delta| {
                if let Some(backend) = weak.upgrade() {
                    backend.enqueue(BackendEvent::Delta(delta.clone()));
                }
            }
        }));
        let shard = self.shards.subscribe(Box::new({
            let weak = weak.clone();
            move |ntp, shard| {
                if let Some(backend) = weak.upgrade() {
                    backend.enqueue(BackendEvent::ShardUpdated {
                        ntp: ntp.clone(),
                        shard,
                    });
                }
            }
        }));
        *self
            .subscriptions
            .lock()
            .expect("subscription registry poisoned") = Some(Subscriptions {
            shard,
            topic,
            leadership,
            migrations,
        });

        // The first pass resyncs everything: current leadership and all
        // existing migration records.
        self.resync.store(true, Ordering::SeqCst);

        let receiver = self
            .events_rx
            .lock()
            .expect("event receiver slot poisoned")
            .take()
            .expect("backend already started");
        let shutdown_rx = self.shutdown.subscribe();
        let backend = self.clone();
        let handle = tokio::spawn(async move { backend.run(receiver, shutdown_rx).await });
        self.track(handle);
    }

    /// Stop the backend: end the main loop, unsubscribe from all
    /// notification sources, stop every worker and drain spawned tasks.
    ///
    /// Pending `perform` futures resolve with
    /// [`crate::error::MigrationError::ShuttingDown`].
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.self_node, "stopping migration reconciliation backend");
        let _ = self.shutdown.send(());
        // Unregister in fixed order: shard, topic, leadership,
        // migrations.
        if let Some(subs) = self
            .subscriptions
            .lock()
            .expect("subscription registry poisoned")
            .take()
        {
            self.shards.unsubscribe(subs.shard);
            self.topics.unsubscribe_deltas(subs.topic);
            self.leaders.unsubscribe(subs.leadership);
            self.table.unsubscribe(subs.migrations);
        }
        for worker in &self.workers {
            worker.stop().await;
        }
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.lock().expect("task registry poisoned");
                std::mem::take(&mut *tasks)
            };
            if drained.is_empty() {
                break;
            }
            for handle in drained {
                let _ = handle.await;
            }
        }
        *self.state.lock().await = BackendState::default();
    }

    /// Snapshot of reconciliation progress.
    pub async fn overview(&self) -> ReconciliationOverview {
        let st = self.state.lock().await;
        ReconciliationOverview {
            is_coordinator: st.is_coordinator,
            tracked_migrations: st.migration_states.len(),
            outstanding_partitions: st
                .migration_states
                .values()
                .flat_map(|mr| mr.outstanding_topics.values())
                .map(|ts| ts.outstanding_partitions.len())
                .sum(),
            nodes_awaiting_retry: st.nodes_to_retry.len(),
            nodes_with_rpc_in_flight: st.in_flight.len(),
            local_partitions: st.work_states.values().map(|m| m.len()).sum(),
            pending_advances: st.advance_requests.len(),
        }
    }

    /// Serve a `check_ntp_states` request from this node's local world.
    ///
    /// Idempotent: repeating a request yields the same reply and state
    /// once the first call's side effects settle. Unknown tuples answer
    /// `waiting_for_rpc` and schedule local work discovery.
    pub async fn check_ntp_states_locally(
        self: &Arc<Self>,
        request: CheckNtpStatesRequest,
    ) -> CheckNtpStatesReply {
        let mut dispatches: Vec<(Ntp, ShardId, PartitionWork)> = Vec::new();
        let mut entries = Vec::with_capacity(request.entries.len());
        {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            for tuple in request.entries {
                let status = self.local_tuple_status(st, &tuple, &mut dispatches);
                entries.push(NtpStateReport {
                    ntp: tuple.ntp,
                    migration_id: tuple.migration_id,
                    sought_state: tuple.sought_state,
                    status,
                });
            }
        }
        for (ntp, shard, work) in dispatches {
            self.spawn_dispatch(ntp, shard, work);
        }
        CheckNtpStatesReply { entries }
    }

    fn local_tuple_status(
        &self,
        st: &mut BackendState,
        tuple: &NtpMigrationTuple,
        dispatches: &mut Vec<(Ntp, ShardId, PartitionWork)>,
    ) -> ReplicaStatus {
        let topic = tuple.ntp.topic_namespace();
        let Some(rws) = st
            .work_states
            .get_mut(&topic)
            .and_then(|m| m.get_mut(&tuple.ntp.partition))
        else {
            self.enqueue(BackendEvent::MigrationUpdated(tuple.migration_id));
            return ReplicaStatus::WaitingForRpc;
        };
        if rws.migration_id != tuple.migration_id || rws.sought_state != tuple.sought_state {
            self.enqueue(BackendEvent::MigrationUpdated(tuple.migration_id));
            return ReplicaStatus::WaitingForRpc;
        }
        match rws.status {
            ReplicaStatus::WaitingForRpc => {
                let Some(shard) = rws.shard else {
                    return ReplicaStatus::WaitingForRpc;
                };
                let Some(work) =
                    self.partition_work_for(&tuple.ntp, tuple.migration_id, tuple.sought_state)
                else {
                    self.enqueue(BackendEvent::MigrationUpdated(tuple.migration_id));
                    return ReplicaStatus::WaitingForRpc;
                };
                rws.status = ReplicaStatus::CanRun;
                dispatches.push((tuple.ntp.clone(), shard, work));
                ReplicaStatus::CanRun
            }
            ReplicaStatus::CanRun => ReplicaStatus::CanRun,
            ReplicaStatus::Done => ReplicaStatus::Done,
        }
    }

    /// Build the work payload for a partition from the current record,
    /// or `None` if the record no longer matches the request.
    fn partition_work_for(
        &self,
        ntp: &Ntp,
        migration_id: MigrationId,
        sought_state: MigrationState,
    ) -> Option<PartitionWork> {
        let record = self.table.snapshot(migration_id)?;
        if record.sought_state() != Some(sought_state) {
            return None;
        }
        let topic = ntp.topic_namespace();
        let info = match &record.descriptor {
            MigrationDescriptor::Inbound(inbound) => {
                let entry = inbound
                    .topics
                    .iter()
                    .find(|t| t.effective_topic() == &topic)?;
                PartitionWorkInfo::Inbound {
                    alias: entry.alias.clone(),
                }
            }
            MigrationDescriptor::Outbound(outbound) => {
                if !outbound.topics.contains(&topic) {
                    return None;
                }
                PartitionWorkInfo::Outbound {
                    copy_to: outbound.copy_to.clone(),
                }
            }
        };
        Some(PartitionWork {
            migration_id,
            sought_state,
            info,
        })
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<BackendEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(node = %self.self_node, "migration reconciliation backend started");
        loop {
            self.work_once().await;
            let deadline = self.next_deadline().await;
            tokio::select! {
                _ = shutdown.recv() => break,
                received = events.recv() => {
                    match received {
                        Some(event) => {
                            self.integrate(event).await;
                            while let Ok(event) = events.try_recv() {
                                self.integrate(event).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
        info!(node = %self.self_node, "migration reconciliation backend stopped");
    }

    fn enqueue(&self, event: BackendEvent) {
        if self.events.try_send(event).is_err() {
            // Queue full (or closing): force a full resync on the next
            // pass so the dropped notification is not lost.
            self.resync.store(true, Ordering::SeqCst);
        }
    }

    async fn integrate(&self, event: BackendEvent) {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        match event {
            BackendEvent::MigrationUpdated(id) => st.pending_migrations.push(id),
            BackendEvent::Delta(delta) => st.unprocessed_deltas.push(delta),
            BackendEvent::ShardUpdated { ntp, shard } => {
                self.handle_shard_update(st, &ntp, shard);
            }
            BackendEvent::LeadershipChanged => self.handle_leadership(st),
            BackendEvent::WorkCompleted {
                ntp,
                migration_id,
                sought_state,
            } => self.on_partition_work_completed(st, &ntp, migration_id, sought_state),
            BackendEvent::RpcFinished {
                node,
                epoch,
                result,
            } => self.handle_rpc_finished(st, node, epoch, result),
            BackendEvent::AdvanceFinished {
                migration_id,
                sought_state,
                result,
            } => self.handle_advance_finished(st, migration_id, sought_state, result),
        }
    }

    async fn work_once(self: &Arc<Self>) {
        let mut rpcs: Vec<(NodeId, u64, CheckNtpStatesRequest)> = Vec::new();
        let mut advances: Vec<(MigrationId, MigrationState)> = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;

            if self.resync.swap(false, Ordering::SeqCst) {
                self.handle_leadership(st);
                st.pending_migrations.extend(self.table.ids());
            }

            // 1. Drain deferred topology deltas.
            let deltas = std::mem::take(&mut st.unprocessed_deltas);
            for delta in deltas {
                self.process_delta(st, delta);
            }

            // 2. Integrate migration updates.
            let mut pending = std::mem::take(&mut st.pending_migrations);
            pending.sort();
            pending.dedup();
            for id in pending {
                self.reconcile_migration(st, id);
            }

            // Restore the retry-or-in-flight invariant for any node a
            // new outstanding NTP now references.
            self.ensure_nodes_scheduled(st);

            // 3. Spawn RPCs whose retry deadline passed.
            let now = Instant::now();
            let due: Vec<NodeId> = st
                .nodes_to_retry
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(node, _)| *node)
                .collect();
            for node in due {
                st.nodes_to_retry.remove(&node);
                let Some(outstanding) = st.node_states.get(&node) else {
                    continue;
                };
                let mut entries: Vec<NtpMigrationTuple> = outstanding
                    .iter()
                    .filter_map(|(ntp, id)| {
                        st.migration_states.get(id).map(|mr| NtpMigrationTuple {
                            ntp: ntp.clone(),
                            migration_id: *id,
                            sought_state: mr.sought_state,
                        })
                    })
                    .collect();
                if entries.is_empty() {
                    continue;
                }
                entries.sort_by(|a, b| {
                    (a.migration_id, &a.ntp.namespace, &a.ntp.topic, a.ntp.partition).cmp(&(
                        b.migration_id,
                        &b.ntp.namespace,
                        &b.ntp.topic,
                        b.ntp.partition,
                    ))
                });
                st.in_flight.insert(node);
                rpcs.push((node, st.epoch, CheckNtpStatesRequest { entries }));
            }

            // 4. Send unsent advance requests.
            let advance_ready = st.advance_retry_at.map(|at| at <= now).unwrap_or(true);
            if advance_ready {
                st.advance_retry_at = None;
                for (id, info) in st.advance_requests.iter_mut() {
                    if !info.sent {
                        info.sent = true;
                        advances.push((*id, info.sought_state));
                    }
                }
            }

            metrics::OUTSTANDING_MIGRATIONS.set(st.migration_states.len() as i64);
            metrics::LOCAL_WORK_PARTITIONS
                .set(st.work_states.values().map(|m| m.len()).sum::<usize>() as i64);
        }
        for (node, epoch, request) in rpcs {
            self.spawn_send_rpc(node, epoch, request);
        }
        for (id, sought_state) in advances {
            self.spawn_advance(id, sought_state);
        }
    }

    async fn next_deadline(&self) -> Option<Instant> {
        let st = self.state.lock().await;
        let mut deadline = st.nodes_to_retry.values().min().copied();
        if let Some(at) = st.advance_retry_at {
            deadline = Some(deadline.map_or(at, |d| d.min(at)));
        }
        deadline
    }

    // ========================================================================
    // Event handlers (run under the state lock)
    // ========================================================================

    fn handle_leadership(&self, st: &mut BackendState) {
        let is_coordinator = self.leaders.leader(&controller_ntp()) == Some(self.self_node);
        if is_coordinator == st.is_coordinator {
            return;
        }
        st.is_coordinator = is_coordinator;
        st.epoch += 1;
        st.in_flight.clear();
        st.nodes_to_retry.clear();
        st.node_states.clear();
        st.node_backoff.clear();
        st.advance_requests.clear();
        st.advance_retry_at = None;
        for mr in st.migration_states.values_mut() {
            for ts in mr.outstanding_topics.values_mut() {
                ts.outstanding_partitions.clear();
            }
        }
        if is_coordinator {
            info!(node = %self.self_node, epoch = st.epoch, "became migration coordinator");
            st.pending_migrations.extend(self.table.ids());
        } else {
            info!(node = %self.self_node, epoch = st.epoch, "resigned migration coordinator");
        }
    }

    fn handle_shard_update(&self, st: &mut BackendState, ntp: &Ntp, new_shard: Option<ShardId>) {
        let topic = ntp.topic_namespace();
        let Some(partitions) = st.work_states.get_mut(&topic) else {
            return;
        };
        match new_shard {
            None => {
                // This node no longer owns a replica.
                if let Some(removed) = partitions.remove(&ntp.partition) {
                    self.stop_partition_work(ntp, &removed);
                }
                if partitions.is_empty() {
                    st.work_states.remove(&topic);
                }
            }
            Some(shard) => {
                let Some(rws) = partitions.get_mut(&ntp.partition) else {
                    return;
                };
                if rws.shard == Some(shard) {
                    return;
                }
                if rws.status == ReplicaStatus::CanRun {
                    // The action was dispatched on the previous shard;
                    // demote so the next RPC re-dispatches on the new
                    // one.
                    self.stop_partition_work(ntp, rws);
                    rws.status = ReplicaStatus::WaitingForRpc;
                }
                rws.shard = Some(shard);
            }
        }
    }

    fn on_partition_work_completed(
        &self,
        st: &mut BackendState,
        ntp: &Ntp,
        migration_id: MigrationId,
        sought_state: MigrationState,
    ) {
        let Some(rws) = st
            .work_states
            .get_mut(&ntp.topic_namespace())
            .and_then(|m| m.get_mut(&ntp.partition))
        else {
            return;
        };
        if rws.migration_id == migration_id && rws.sought_state == sought_state {
            debug!(%migration_id, %ntp, %sought_state, "partition work completed");
            rws.status = ReplicaStatus::Done;
        }
    }

    fn handle_rpc_finished(
        &self,
        st: &mut BackendState,
        node: NodeId,
        epoch: u64,
        result: MigrationResult<CheckNtpStatesReply>,
    ) {
        if epoch != st.epoch || !st.is_coordinator {
            debug!(%node, "discarding RPC reply from a previous coordinator epoch");
            metrics::RPCS_FINISHED.with_label_values(&["stale"]).inc();
            return;
        }
        st.in_flight.remove(&node);
        match result {
            Ok(reply) => {
                metrics::RPCS_FINISHED.with_label_values(&["ok"]).inc();
                if let Some(backoff) = st.node_backoff.get_mut(&node) {
                    backoff.reset();
                }
                for report in reply.entries {
                    if report.status != ReplicaStatus::Done {
                        continue;
                    }
                    let valid = st
                        .node_states
                        .get(&node)
                        .and_then(|m| m.get(&report.ntp))
                        == Some(&report.migration_id)
                        && st
                            .migration_states
                            .get(&report.migration_id)
                            .map(|mr| mr.sought_state)
                            == Some(report.sought_state);
                    if !valid {
                        debug!(
                            %node,
                            migration_id = %report.migration_id,
                            ntp = %report.ntp,
                            "discarding stale partition report"
                        );
                        continue;
                    }
                    if let Some(outstanding) = st.node_states.get_mut(&node) {
                        outstanding.remove(&report.ntp);
                        if outstanding.is_empty() {
                            st.node_states.remove(&node);
                        }
                    }
                    self.mark_step_done(st, report.migration_id, &report.ntp, node);
                }
                if st.node_states.contains_key(&node) {
                    // Partial progress; poll again after the base delay.
                    let delay = self.node_backoff(st, node).next_delay();
                    st.nodes_to_retry.insert(node, Instant::now() + delay);
                } else {
                    st.node_backoff.remove(&node);
                }
            }
            Err(error) => {
                warn!(%node, %error, "check_ntp_states failed, scheduling retry");
                metrics::RPCS_FINISHED
                    .with_label_values(&["transport_error"])
                    .inc();
                if st.node_states.contains_key(&node) {
                    metrics::NODE_RETRIES.inc();
                    let delay = self.node_backoff(st, node).next_delay();
                    st.nodes_to_retry.insert(node, Instant::now() + delay);
                }
            }
        }
    }

    fn node_backoff<'a>(&self, st: &'a mut BackendState, node: NodeId) -> &'a mut RetryBackoff {
        let min = self.config.retry_min_backoff;
        let max = self.config.retry_max_backoff;
        st.node_backoff
            .entry(node)
            .or_insert_with(|| RetryBackoff::new(min, max))
    }

    fn handle_advance_finished(
        &self,
        st: &mut BackendState,
        migration_id: MigrationId,
        sought_state: MigrationState,
        result: MigrationResult<()>,
    ) {
        match result {
            Ok(()) => {
                // Never mutate durable-derived state here; the applied
                // change arrives as a table notification.
                metrics::ADVANCES_FINISHED.with_label_values(&["ok"]).inc();
                debug!(%migration_id, %sought_state, "advance proposal accepted");
            }
            Err(error) => {
                metrics::ADVANCES_FINISHED
                    .with_label_values(&["rejected"])
                    .inc();
                warn!(%migration_id, %sought_state, %error, "advance proposal failed, will retry");
                if let Some(info) = st.advance_requests.get_mut(&migration_id) {
                    if info.sought_state == sought_state && info.sent {
                        info.sent = false;
                        let retry_at = Instant::now() + self.config.retry_min_backoff;
                        st.advance_retry_at =
                            Some(st.advance_retry_at.map_or(retry_at, |at| at.min(retry_at)));
                    }
                }
            }
        }
    }

    // ========================================================================
    // Reconciliation (run under the state lock)
    // ========================================================================

    fn reconcile_migration(&self, st: &mut BackendState, id: MigrationId) {
        // Any durable change supersedes a pending advance request; it is
        // re-derived below when still warranted.
        st.advance_requests.remove(&id);

        let Some(record) = self.table.snapshot(id) else {
            debug!(migration_id = %id, "migration deleted, dropping tracking");
            self.drop_migration_tracking(st, id);
            return;
        };
        let Some(sought_state) = record.sought_state() else {
            info!(migration_id = %id, state = %record.state, "migration reached a terminal state");
            self.drop_migration_tracking(st, id);
            return;
        };
        let kind = record.kind();
        if !requires_partition_work(kind, sought_state) {
            // Bookkeeping-only step: nothing to wait for.
            self.drop_migration_tracking(st, id);
            self.to_advance(st, id, sought_state);
            return;
        }

        let sought_changed = st
            .migration_states
            .get(&id)
            .map(|mr| mr.sought_state != sought_state)
            .unwrap_or(false);
        if sought_changed {
            self.drop_migration_tracking(st, id);
        }
        st.migration_states
            .entry(id)
            .or_insert_with(|| MigrationReconciliationState {
                sought_state,
                outstanding_topics: HashMap::new(),
            })
            .sought_state = sought_state;

        let topics = record.topics();
        for (idx, topic) in topics.iter().enumerate() {
            let previous = st.topic_migration_map.insert(topic.clone(), id);
            debug_assert!(
                previous.is_none() || previous == Some(id),
                "topic {topic} tracked by two active migrations"
            );

            let partitions = self.topics.partitions(topic);

            // Coordinator world: (re)populate the outstanding set when
            // this topic has none, e.g. on first sight or after taking
            // over coordination.
            {
                let mr = st
                    .migration_states
                    .get_mut(&id)
                    .expect("inserted above");
                let ts = mr
                    .outstanding_topics
                    .entry(topic.clone())
                    .or_insert_with(|| TopicReconciliationState {
                        idx_in_migration: idx,
                        outstanding_partitions: HashMap::new(),
                    });
                ts.idx_in_migration = idx;
                if st.is_coordinator && ts.outstanding_partitions.is_empty() {
                    for partition in &partitions {
                        let ntp = Ntp::from_topic(topic, *partition);
                        let replicas = self.topics.replicas(&ntp);
                        if replicas.is_empty() {
                            continue;
                        }
                        for node in &replicas {
                            st.node_states
                                .entry(*node)
                                .or_default()
                                .insert(ntp.clone(), id);
                        }
                        ts.outstanding_partitions.insert(*partition, replicas);
                    }
                }
            }

            // Local world: one tracking entry per locally-owned replica.
            let known: HashSet<PartitionIndex> = partitions.iter().copied().collect();
            for partition in &partitions {
                let ntp = Ntp::from_topic(topic, *partition);
                if self.topics.replicas(&ntp).contains(&self.self_node) {
                    self.ensure_local_entry(st, &ntp, id, sought_state);
                } else if let Some(slot) = st.work_states.get_mut(topic) {
                    if let Some(rws) = slot.remove(partition) {
                        self.stop_partition_work(&ntp, &rws);
                    }
                }
            }
            // Prune local entries for partitions the topology no longer
            // has (covers deltas lost to a resync).
            if let Some(slot) = st.work_states.get_mut(topic) {
                let stale: Vec<PartitionIndex> = slot
                    .keys()
                    .filter(|p| !known.contains(p))
                    .copied()
                    .collect();
                for partition in stale {
                    if let Some(rws) = slot.remove(&partition) {
                        let ntp = Ntp::from_topic(topic, partition);
                        self.stop_partition_work(&ntp, &rws);
                    }
                }
                if slot.is_empty() {
                    st.work_states.remove(topic);
                }
            }
        }

        // Topics with nothing outstanding (e.g. no partitions yet) are
        // complete; so is the migration once every topic retired.
        if st.is_coordinator {
            let all_done = {
                let mr = st.migration_states.get_mut(&id).expect("inserted above");
                let empty: Vec<TopicNamespace> = mr
                    .outstanding_topics
                    .iter()
                    .filter(|(_, ts)| ts.outstanding_partitions.is_empty())
                    .map(|(topic, _)| topic.clone())
                    .collect();
                for topic in empty {
                    mr.outstanding_topics.remove(&topic);
                    st.topic_migration_map.remove(&topic);
                }
                mr.outstanding_topics.is_empty()
            };
            if all_done {
                info!(migration_id = %id, %sought_state, "all partitions reconciled, requesting advance");
                self.drop_migration_tracking(st, id);
                self.to_advance(st, id, sought_state);
            }
        }
    }

    fn ensure_local_entry(
        &self,
        st: &mut BackendState,
        ntp: &Ntp,
        migration_id: MigrationId,
        sought_state: MigrationState,
    ) {
        let shard = self.shards.shard_for(ntp);
        let slot = st.work_states.entry(ntp.topic_namespace()).or_default();
        match slot.entry(ntp.partition) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let rws = occupied.get_mut();
                if rws.migration_id == migration_id && rws.sought_state == sought_state {
                    // Same request: keep progress, refresh the shard.
                    rws.shard = shard;
                    if rws.shard.is_none() && rws.status == ReplicaStatus::CanRun {
                        rws.status = ReplicaStatus::WaitingForRpc;
                    }
                } else {
                    let old = rws.clone();
                    self.stop_partition_work(ntp, &old);
                    *rws = ReplicaWorkState {
                        migration_id,
                        sought_state,
                        shard,
                        status: ReplicaStatus::WaitingForRpc,
                    };
                }
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(ReplicaWorkState {
                    migration_id,
                    sought_state,
                    shard,
                    status: ReplicaStatus::WaitingForRpc,
                });
            }
        }
    }

    fn process_delta(&self, st: &mut BackendState, delta: TopicDelta) {
        match delta {
            TopicDelta::Removed(ntp) => {
                let topic = ntp.topic_namespace();
                if let Some(partitions) = st.work_states.get_mut(&topic) {
                    if let Some(rws) = partitions.remove(&ntp.partition) {
                        self.stop_partition_work(&ntp, &rws);
                    }
                    if partitions.is_empty() {
                        st.work_states.remove(&topic);
                    }
                }
                if st.is_coordinator {
                    // A deleted partition can no longer reach any state;
                    // treat it as no longer outstanding.
                    if let Some(&id) = st.topic_migration_map.get(&topic) {
                        self.retire_partition(st, id, &ntp);
                    }
                }
            }
            TopicDelta::Added(ntp) => self.upsert_partition(st, ntp, true),
            TopicDelta::Updated(ntp) => self.upsert_partition(st, ntp, false),
        }
    }

    fn upsert_partition(&self, st: &mut BackendState, ntp: Ntp, allow_insert: bool) {
        let topic = ntp.topic_namespace();
        let Some(&id) = st.topic_migration_map.get(&topic) else {
            return;
        };
        let Some(sought_state) = st.migration_states.get(&id).map(|mr| mr.sought_state) else {
            return;
        };
        let replicas = self.topics.replicas(&ntp);

        // Local world.
        if replicas.contains(&self.self_node) {
            self.ensure_local_entry(st, &ntp, id, sought_state);
        } else if let Some(partitions) = st.work_states.get_mut(&topic) {
            if let Some(rws) = partitions.remove(&ntp.partition) {
                self.stop_partition_work(&ntp, &rws);
            }
            if partitions.is_empty() {
                st.work_states.remove(&topic);
            }
        }

        // Coordinator world.
        if !st.is_coordinator {
            return;
        }
        if replicas.is_empty() {
            self.retire_partition(st, id, &ntp);
            return;
        }
        let previous = {
            let Some(ts) = st
                .migration_states
                .get_mut(&id)
                .and_then(|mr| mr.outstanding_topics.get_mut(&topic))
            else {
                return;
            };
            let known = ts.outstanding_partitions.contains_key(&ntp.partition);
            if !known && !allow_insert {
                // Replica moves on an already-retired partition do not
                // resurrect it.
                return;
            }
            ts.outstanding_partitions
                .insert(ntp.partition, replicas.clone())
        };
        if let Some(old_nodes) = previous {
            for node in old_nodes.iter().filter(|n| !replicas.contains(n)) {
                if let Some(outstanding) = st.node_states.get_mut(node) {
                    outstanding.remove(&ntp);
                    if outstanding.is_empty() {
                        st.node_states.remove(node);
                        st.nodes_to_retry.remove(node);
                    }
                }
            }
        }
        for node in &replicas {
            st.node_states
                .entry(*node)
                .or_default()
                .insert(ntp.clone(), id);
        }
    }

    fn retire_partition(&self, st: &mut BackendState, id: MigrationId, ntp: &Ntp) {
        let topic = ntp.topic_namespace();
        let mut removed_nodes: Vec<NodeId> = Vec::new();
        if let Some(ts) = st
            .migration_states
            .get_mut(&id)
            .and_then(|mr| mr.outstanding_topics.get_mut(&topic))
        {
            if let Some(nodes) = ts.outstanding_partitions.remove(&ntp.partition) {
                removed_nodes = nodes;
            }
        }
        for node in removed_nodes {
            if let Some(outstanding) = st.node_states.get_mut(&node) {
                outstanding.remove(ntp);
                if outstanding.is_empty() {
                    st.node_states.remove(&node);
                    st.nodes_to_retry.remove(&node);
                }
            }
        }
        self.finish_if_reconciled(st, id, &topic);
    }

    fn mark_step_done(&self, st: &mut BackendState, id: MigrationId, ntp: &Ntp, node: NodeId) {
        let topic = ntp.topic_namespace();
        if let Some(ts) = st
            .migration_states
            .get_mut(&id)
            .and_then(|mr| mr.outstanding_topics.get_mut(&topic))
        {
            if let Some(nodes) = ts.outstanding_partitions.get_mut(&ntp.partition) {
                nodes.retain(|n| *n != node);
                if nodes.is_empty() {
                    ts.outstanding_partitions.remove(&ntp.partition);
                }
            }
        }
        self.finish_if_reconciled(st, id, &topic);
    }

    fn finish_if_reconciled(
        &self,
        st: &mut BackendState,
        id: MigrationId,
        topic: &TopicNamespace,
    ) {
        if !st.is_coordinator {
            return;
        }
        let (all_done, sought_state) = {
            let Some(mr) = st.migration_states.get_mut(&id) else {
                return;
            };
            let topic_done = mr
                .outstanding_topics
                .get(topic)
                .map(|ts| ts.outstanding_partitions.is_empty())
                .unwrap_or(false);
            if topic_done {
                mr.outstanding_topics.remove(topic);
                st.topic_migration_map.remove(topic);
            }
            (mr.outstanding_topics.is_empty(), mr.sought_state)
        };
        if all_done {
            info!(migration_id = %id, %sought_state, "all partitions reconciled, requesting advance");
            self.drop_migration_tracking(st, id);
            self.to_advance(st, id, sought_state);
        }
    }

    /// Remove every trace of `id` from both worlds; workers are stopped
    /// first (best-effort), then state is dropped. Late RPC replies for
    /// the migration no longer validate and are discarded.
    fn drop_migration_tracking(&self, st: &mut BackendState, id: MigrationId) {
        // Stop local workers first.
        let mut emptied: Vec<TopicNamespace> = Vec::new();
        for (topic, partitions) in st.work_states.iter_mut() {
            let stale: Vec<PartitionIndex> = partitions
                .iter()
                .filter(|(_, rws)| rws.migration_id == id)
                .map(|(p, _)| *p)
                .collect();
            for partition in stale {
                if let Some(rws) = partitions.remove(&partition) {
                    let ntp = Ntp::from_topic(topic, partition);
                    self.stop_partition_work(&ntp, &rws);
                }
            }
            if partitions.is_empty() {
                emptied.push(topic.clone());
            }
        }
        for topic in emptied {
            st.work_states.remove(&topic);
        }

        // Then drop coordinator-side tracking.
        st.migration_states.remove(&id);
        st.topic_migration_map.retain(|_, mid| *mid != id);
        st.node_states.retain(|_, outstanding| {
            outstanding.retain(|_, mid| *mid != id);
            !outstanding.is_empty()
        });
        st.nodes_to_retry
            .retain(|node, _| st.node_states.contains_key(node));
        st.advance_requests.remove(&id);
    }

    fn stop_partition_work(&self, ntp: &Ntp, rws: &ReplicaWorkState) {
        let Some(shard) = rws.shard else {
            return;
        };
        let Some(worker) = self.workers.get(shard.value() as usize) else {
            error!(%ntp, %shard, "no worker for shard");
            return;
        };
        worker.abort(ntp, rws.migration_id, rws.sought_state);
    }

    fn to_advance(&self, st: &mut BackendState, id: MigrationId, sought_state: MigrationState) {
        if !st.is_coordinator {
            return;
        }
        match st.advance_requests.entry(id) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let info = occupied.get_mut();
                if info.sought_state != sought_state {
                    info.sought_state = sought_state;
                    info.sent = false;
                }
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(AdvanceInfo {
                    sought_state,
                    sent: false,
                });
            }
        }
    }

    fn ensure_nodes_scheduled(&self, st: &mut BackendState) {
        let now = Instant::now();
        let nodes: Vec<NodeId> = st.node_states.keys().copied().collect();
        for node in nodes {
            if !st.in_flight.contains(&node) && !st.nodes_to_retry.contains_key(&node) {
                st.nodes_to_retry.insert(node, now);
            }
        }
    }

    // ========================================================================
    // Spawned I/O (runs without the state lock)
    // ========================================================================

    fn spawn_send_rpc(self: &Arc<Self>, node: NodeId, epoch: u64, request: CheckNtpStatesRequest) {
        let backend = self.clone();
        let handle = tokio::spawn(async move {
            debug!(%node, entries = request.entries.len(), "sending check_ntp_states");
            let result = if node == backend.self_node {
                Ok(backend.check_ntp_states_locally(request).await)
            } else {
                backend.peers.check_ntp_states(node, request).await
            };
            let _ = backend
                .events
                .send(BackendEvent::RpcFinished {
                    node,
                    epoch,
                    result,
                })
                .await;
        });
        self.track(handle);
    }

    fn spawn_advance(self: &Arc<Self>, migration_id: MigrationId, sought_state: MigrationState) {
        let backend = self.clone();
        let handle = tokio::spawn(async move {
            let result = backend
                .frontend
                .propose_advance(migration_id, sought_state)
                .await;
            let _ = backend
                .events
                .send(BackendEvent::AdvanceFinished {
                    migration_id,
                    sought_state,
                    result,
                })
                .await;
        });
        self.track(handle);
    }

    fn spawn_dispatch(self: &Arc<Self>, ntp: Ntp, shard: ShardId, work: PartitionWork) {
        let Some(worker) = self.workers.get(shard.value() as usize).cloned() else {
            error!(%ntp, %shard, "no worker for shard");
            return;
        };
        let backend = self.clone();
        let handle = tokio::spawn(async move {
            let migration_id = work.migration_id;
            let sought_state = work.sought_state;
            match worker.perform(ntp.clone(), work).await {
                Ok(()) => {
                    let _ = backend
                        .events
                        .send(BackendEvent::WorkCompleted {
                            ntp,
                            migration_id,
                            sought_state,
                        })
                        .await;
                }
                Err(error) => {
                    debug!(
                        %migration_id, %ntp, %sought_state, %error,
                        "partition work retired without completion"
                    );
                }
            }
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

#[cfg(any(test, feature = "test-utilities"))]
impl ReconciliationBackend {
    /// Local status of a replica's tracking entry.
    pub async fn local_status(&self, ntp: &Ntp) -> Option<ReplicaStatus> {
        let st = self.state.lock().await;
        st.work_states
            .get(&ntp.topic_namespace())
            .and_then(|m| m.get(&ntp.partition))
            .map(|rws| rws.status)
    }

    /// Outstanding partitions for a migration on the coordinator, or
    /// `None` when the migration has no tracking entry.
    pub async fn outstanding_partitions(&self, id: MigrationId) -> Option<usize> {
        let st = self.state.lock().await;
        st.migration_states.get(&id).map(|mr| {
            mr.outstanding_topics
                .values()
                .map(|ts| ts.outstanding_partitions.len())
                .sum()
        })
    }

    /// Check the cross-map invariants the reconciliation maps must
    /// satisfy between loop iterations; returns the first violation.
    pub async fn verify_invariants(&self) -> Result<(), String> {
        let st = self.state.lock().await;

        // topic_migration_map keys equal the union of outstanding
        // topics.
        for (topic, id) in &st.topic_migration_map {
            let tracked = st
                .migration_states
                .get(id)
                .map(|mr| mr.outstanding_topics.contains_key(topic))
                .unwrap_or(false);
            if !tracked {
                return Err(format!(
                    "topic map entry {topic} -> {id} without matching tracking"
                ));
            }
        }
        for (id, mr) in &st.migration_states {
            for topic in mr.outstanding_topics.keys() {
                if st.topic_migration_map.get(topic) != Some(id) {
                    return Err(format!(
                        "outstanding topic {topic} of migration {id} missing from topic map"
                    ));
                }
            }
        }

        // node_states mirrors outstanding_partitions exactly.
        for (node, outstanding) in &st.node_states {
            for (ntp, id) in outstanding {
                let listed = st
                    .migration_states
                    .get(id)
                    .and_then(|mr| mr.outstanding_topics.get(&ntp.topic_namespace()))
                    .and_then(|ts| ts.outstanding_partitions.get(&ntp.partition))
                    .map(|nodes| nodes.contains(node))
                    .unwrap_or(false);
                if !listed {
                    return Err(format!(
                        "node {node} tracks {ntp} for migration {id} but it is not outstanding"
                    ));
                }
            }
        }
        for (id, mr) in &st.migration_states {
            for (topic, ts) in &mr.outstanding_topics {
                for (partition, nodes) in &ts.outstanding_partitions {
                    let ntp = Ntp::from_topic(topic, *partition);
                    for node in nodes {
                        let tracked = st
                            .node_states
                            .get(node)
                            .and_then(|m| m.get(&ntp))
                            == Some(id);
                        if !tracked {
                            return Err(format!(
                                "outstanding replica {ntp}@{node} of migration {id} missing from node states"
                            ));
                        }
                    }
                }
            }
        }

        // Every node with outstanding work has exactly one of an
        // in-flight RPC or a scheduled retry.
        for node in st.nodes_to_retry.keys() {
            if st.in_flight.contains(node) {
                return Err(format!("node {node} both in flight and awaiting retry"));
            }
            if !st.node_states.contains_key(node) {
                return Err(format!("node {node} awaiting retry without outstanding work"));
            }
        }
        for node in st.node_states.keys() {
            if !st.in_flight.contains(node) && !st.nodes_to_retry.contains_key(node) {
                return Err(format!("node {node} has outstanding work but is unscheduled"));
            }
        }

        // A dispatched replica always has a shard.
        for (topic, partitions) in &st.work_states {
            for (partition, rws) in partitions {
                if rws.status == ReplicaStatus::CanRun && rws.shard.is_none() {
                    return Err(format!(
                        "replica {topic}/{partition} is can_run without a shard"
                    ));
                }
            }
        }

        Ok(())
    }
}

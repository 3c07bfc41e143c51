//! Per-shard worker executing partition-scoped migration actions.
//!
//! One worker instance exists per shard. For every NTP whose replica
//! lives on its shard it keeps a small state: current leadership, a
//! running flag and the [`PartitionWork`] to perform. The action itself
//! (snapshotting, hand-off, mount) is behind the
//! [`PartitionActionRunner`] seam and only runs while the local replica
//! leads its partition.
//!
//! Retry policy: a failed action is re-spawned immediately for as long
//! as the entry stays managed and leadership holds. There is no backoff
//! at this layer; backoff lives with the coordinator's RPCs where
//! network pressure is observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MigrationError, MigrationResult};
use crate::migration::metadata::PartitionWork;
use crate::migration::metrics;
use crate::migration::state::{MigrationState, requires_partition_work};
use crate::migration::topology::PartitionLeaders;
use crate::types::{MigrationId, NodeId, NotificationId, Ntp, ShardId};

/// The partition-scoped action a worker runs towards a sought state.
///
/// Implementations must be re-runnable: the worker retries any failure
/// other than shutdown for as long as the request stays valid.
#[async_trait]
pub trait PartitionActionRunner: Send + Sync {
    /// Execute the action for `ntp`. Returning `Ok(())` marks the
    /// replica as having reached the sought state.
    async fn run(&self, ntp: &Ntp, work: &PartitionWork) -> MigrationResult<()>;
}

/// Runner that completes every action immediately.
///
/// Stands in for the real partition actions until they are wired up.
pub struct NoopActionRunner;

#[async_trait]
impl PartitionActionRunner for NoopActionRunner {
    async fn run(&self, _ntp: &Ntp, _work: &PartitionWork) -> MigrationResult<()> {
        Ok(())
    }
}

/// Worker-side tracking state for one managed NTP.
struct NtpState {
    is_leader: bool,
    is_running: bool,
    work: PartitionWork,
    promise: Option<oneshot::Sender<MigrationResult<()>>>,
    leadership_subscription: NotificationId,
}

/// Per-shard manager of locally-owned partition work.
pub struct Worker {
    shard: ShardId,
    self_node: NodeId,
    leaders: Arc<dyn PartitionLeaders>,
    runner: Arc<dyn PartitionActionRunner>,
    operation_timeout: Duration,
    managed: DashMap<Ntp, NtpState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Worker {
    /// Create a worker for `shard`.
    pub fn new(
        shard: ShardId,
        self_node: NodeId,
        leaders: Arc<dyn PartitionLeaders>,
        runner: Arc<dyn PartitionActionRunner>,
        operation_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            shard,
            self_node,
            leaders,
            runner,
            operation_timeout,
            managed: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        })
    }

    /// The shard this worker serves.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Number of NTPs currently managed by this worker.
    pub fn managed_count(&self) -> usize {
        self.managed.len()
    }

    /// Begin (or replace) partition work for `ntp` and wait for its
    /// terminal completion.
    ///
    /// If the NTP is already managed the stale request is resolved with
    /// [`MigrationError::InvalidMigrationState`] and its entry reused for
    /// the new work. The returned future resolves with `Ok(())` on
    /// success, or with the terminal error that retired the request.
    pub async fn perform(self: Arc<Self>, ntp: Ntp, work: PartitionWork) -> MigrationResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(MigrationError::ShuttingDown);
        }
        assert_work_valid(&ntp, &work);

        let rx = if let Some(mut state) = self.managed.get_mut(&ntp) {
            // some stale work going on, kick it out and reuse its entry
            if let Some(old) = state.promise.take() {
                let _ = old.send(Err(MigrationError::InvalidMigrationState));
            }
            let (tx, rx) = oneshot::channel();
            state.promise = Some(tx);
            state.is_running = false;
            state.work = work;
            rx
        } else {
            let is_leader = self.leaders.leader(&ntp) == Some(self.self_node);
            let weak = Arc::downgrade(&self);
            let self_node = self.self_node;
            let subscription = self.leaders.subscribe_ntp(
                &ntp,
                Box::new(move |ntp, leader| {
                    if let Some(worker) = weak.upgrade() {
                        worker.handle_leadership_update(ntp, leader == Some(self_node));
                    }
                }),
            );
            let (tx, rx) = oneshot::channel();
            self.managed.insert(
                ntp.clone(),
                NtpState {
                    is_leader,
                    is_running: false,
                    work,
                    promise: Some(tx),
                    leadership_subscription: subscription,
                },
            );
            rx
        };

        self.spawn_work_if_leader(&ntp);
        match rx.await {
            Ok(result) => result,
            // Sender dropped without resolving: the worker went away.
            Err(_) => Err(MigrationError::ShuttingDown),
        }
    }

    /// Cancel the managed work for `ntp` if it matches the given
    /// request; no-op otherwise. The pending future resolves with
    /// [`MigrationError::InvalidMigrationState`].
    pub fn abort(&self, ntp: &Ntp, migration_id: MigrationId, sought_state: MigrationState) {
        let matches = self
            .managed
            .get(ntp)
            .map(|state| {
                state.work.migration_id == migration_id && state.work.sought_state == sought_state
            })
            .unwrap_or(false);
        if matches {
            self.unmanage(ntp, Err(MigrationError::InvalidMigrationState));
        }
    }

    /// Cancel every managed entry with
    /// [`MigrationError::ShuttingDown`], then wait for all spawned
    /// actions to finish.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let ntps: Vec<Ntp> = self.managed.iter().map(|entry| entry.key().clone()).collect();
        for ntp in ntps {
            self.unmanage(&ntp, Err(MigrationError::ShuttingDown));
        }
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.lock().expect("worker task registry poisoned");
                std::mem::take(&mut *tasks)
            };
            if drained.is_empty() {
                break;
            }
            for handle in drained {
                let _ = handle.await;
            }
        }
    }

    fn handle_leadership_update(self: &Arc<Self>, ntp: &Ntp, is_leader: bool) {
        {
            let Some(mut state) = self.managed.get_mut(ntp) else {
                return;
            };
            if state.is_leader == is_leader {
                return;
            }
            state.is_leader = is_leader;
            // A lost leadership does not cancel in-flight work; the
            // running action completes and the next retry decision
            // honours the new leadership.
            if state.is_running {
                return;
            }
        }
        self.spawn_work_if_leader(ntp);
    }

    fn spawn_work_if_leader(self: &Arc<Self>, ntp: &Ntp) {
        let work = {
            let Some(mut state) = self.managed.get_mut(ntp) else {
                return;
            };
            if state.is_running || !state.is_leader {
                return;
            }
            state.is_running = true;
            state.work.clone()
        };

        let worker = self.clone();
        let ntp = ntp.clone();
        let handle = tokio::spawn(async move {
            let migration_id = work.migration_id;
            let sought_state = work.sought_state;
            let result = worker.do_work(&ntp, work).await;
            worker.handle_operation_result(&ntp, migration_id, sought_state, result);
        });

        let mut tasks = self.tasks.lock().expect("worker task registry poisoned");
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    async fn do_work(&self, ntp: &Ntp, work: PartitionWork) -> MigrationResult<()> {
        let runner = self.runner.clone();
        let action_ntp = ntp.clone();
        // The action runs on its own task so that a panic inside it is
        // contained and mapped to a retryable failure.
        let attempt = tokio::spawn(async move { runner.run(&action_ntp, &work).await });
        match tokio::time::timeout(self.operation_timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                warn!(%ntp, error = %join_error, "partition action panicked");
                Err(MigrationError::PartitionOperationFailed)
            }
            Err(_) => {
                warn!(
                    %ntp,
                    timeout = ?self.operation_timeout,
                    "partition action timed out"
                );
                Err(MigrationError::PartitionOperationFailed)
            }
        }
    }

    fn handle_operation_result(
        self: &Arc<Self>,
        ntp: &Ntp,
        migration_id: MigrationId,
        sought_state: MigrationState,
        result: MigrationResult<()>,
    ) {
        {
            let Some(mut state) = self.managed.get_mut(ntp) else {
                debug!(
                    %migration_id, %ntp, %sought_state, ?result,
                    "partition work is done but not needed anymore"
                );
                return;
            };
            if state.work.migration_id != migration_id || state.work.sought_state != sought_state {
                debug!(
                    %migration_id, %ntp, %sought_state, ?result,
                    "partition work is done but not needed anymore"
                );
                return;
            }
            state.is_running = false;
            if let Err(error) = &result {
                if *error != MigrationError::ShuttingDown {
                    // any other errors deemed retryable
                    info!(
                        %migration_id, %ntp, %sought_state, %error,
                        "partition work failed, retrying"
                    );
                    metrics::PARTITION_WORK_RESULTS
                        .with_label_values(&["retry"])
                        .inc();
                    drop(state);
                    self.spawn_work_if_leader(ntp);
                    return;
                }
            }
        }
        let outcome = if result.is_ok() { "success" } else { "shutdown" };
        metrics::PARTITION_WORK_RESULTS
            .with_label_values(&[outcome])
            .inc();
        self.unmanage(ntp, result);
    }

    fn unmanage(&self, ntp: &Ntp, result: MigrationResult<()>) {
        if let Some((_, mut state)) = self.managed.remove(ntp) {
            self.leaders.unsubscribe(state.leadership_subscription);
            if let Some(promise) = state.promise.take() {
                let _ = promise.send(result);
            }
        }
    }
}

/// Panic on `(kind, sought_state)` combinations that have no
/// per-partition action; reaching one is a programmer error.
fn assert_work_valid(ntp: &Ntp, work: &PartitionWork) {
    let kind = work.info.kind();
    if !requires_partition_work(kind, work.sought_state) {
        panic!(
            "{} partition work requested on {} towards {} state",
            kind, ntp, work.sought_state
        );
    }
}

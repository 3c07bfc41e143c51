//! Tests for the per-shard migration worker.
//!
//! These tests verify leadership-gated dispatch, immediate retry of
//! failed actions, stale-work replacement, aborts and shutdown.

use std::sync::Arc;
use std::time::Duration;

use caravan::error::MigrationError;
use caravan::migration::mock::{InMemoryLeaders, ScriptedRunner};
use caravan::migration::{MigrationState, PartitionWork, PartitionWorkInfo, Worker};
use caravan::types::{MigrationId, NodeId, Ntp, PartitionIndex, ShardId};

const SELF: NodeId = NodeId(1);
const OTHER: NodeId = NodeId(2);

fn ntp(partition: i32) -> Ntp {
    Ntp::new("kafka", "events", PartitionIndex(partition))
}

fn inbound_work(migration: i64) -> PartitionWork {
    PartitionWork {
        migration_id: MigrationId(migration),
        sought_state: MigrationState::Prepared,
        info: PartitionWorkInfo::Inbound { alias: None },
    }
}

fn new_worker(leaders: &Arc<InMemoryLeaders>, runner: &Arc<ScriptedRunner>) -> Arc<Worker> {
    Worker::new(
        ShardId(0),
        SELF,
        leaders.clone(),
        runner.clone(),
        Duration::from_secs(1),
    )
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Leadership-gated dispatch
// ============================================================================

#[tokio::test]
async fn test_perform_completes_when_leader() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);
    leaders.set_leader(&ntp(0), Some(SELF));

    let result = worker.clone().perform(ntp(0), inbound_work(1)).await;

    assert_eq!(result, Ok(()));
    assert_eq!(runner.calls(&ntp(0)), 1);
    assert_eq!(worker.managed_count(), 0);
}

#[tokio::test]
async fn test_perform_waits_for_leadership() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);

    let pending = tokio::spawn(worker.clone().perform(ntp(0), inbound_work(1)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.calls(&ntp(0)), 0);
    assert_eq!(worker.managed_count(), 1);

    leaders.set_leader(&ntp(0), Some(SELF));
    assert_eq!(pending.await.unwrap(), Ok(()));
    assert_eq!(runner.calls(&ntp(0)), 1);
}

#[tokio::test]
async fn test_leadership_handoff_mid_action_still_completes() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);
    leaders.set_leader(&ntp(0), Some(SELF));
    runner.hold(&ntp(0));

    let pending = tokio::spawn(worker.clone().perform(ntp(0), inbound_work(1)));
    wait_until("action to start", || runner.calls(&ntp(0)) == 1).await;

    // Losing leadership does not cancel the in-flight action.
    leaders.set_leader(&ntp(0), Some(OTHER));
    runner.release(&ntp(0));

    assert_eq!(pending.await.unwrap(), Ok(()));
    assert_eq!(worker.managed_count(), 0);
}

#[tokio::test]
async fn test_lost_leadership_pauses_retries_until_regained() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);
    leaders.set_leader(&ntp(0), Some(SELF));
    runner.hold(&ntp(0));
    runner.fail_times(&ntp(0), 1);

    let pending = tokio::spawn(worker.clone().perform(ntp(0), inbound_work(1)));
    wait_until("action to start", || runner.calls(&ntp(0)) == 1).await;

    // Leadership moves away, then the attempt fails: no retry while a
    // different node leads.
    leaders.set_leader(&ntp(0), Some(OTHER));
    runner.release(&ntp(0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.calls(&ntp(0)), 1);
    assert_eq!(worker.managed_count(), 1);

    // Regaining leadership resumes the work.
    leaders.set_leader(&ntp(0), Some(SELF));
    runner.release(&ntp(0));
    assert_eq!(pending.await.unwrap(), Ok(()));
    assert_eq!(runner.calls(&ntp(0)), 2);
}

// ============================================================================
// Retry policy
// ============================================================================

#[tokio::test]
async fn test_retryable_errors_respawn_immediately() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);
    leaders.set_leader(&ntp(0), Some(SELF));
    runner.fail_times(&ntp(0), 2);

    let result = worker.clone().perform(ntp(0), inbound_work(1)).await;

    assert_eq!(result, Ok(()));
    assert_eq!(runner.calls(&ntp(0)), 3);
}

// ============================================================================
// Stale work and aborts
// ============================================================================

#[tokio::test]
async fn test_stale_work_is_kicked_out_and_entry_reused() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);

    let first = tokio::spawn(worker.clone().perform(ntp(0), inbound_work(1)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = tokio::spawn(worker.clone().perform(ntp(0), inbound_work(2)));

    assert_eq!(
        first.await.unwrap(),
        Err(MigrationError::InvalidMigrationState)
    );
    assert_eq!(worker.managed_count(), 1);

    leaders.set_leader(&ntp(0), Some(SELF));
    assert_eq!(second.await.unwrap(), Ok(()));
    assert_eq!(worker.managed_count(), 0);
}

#[tokio::test]
async fn test_abort_requires_matching_request() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);

    let pending = tokio::spawn(worker.clone().perform(ntp(0), inbound_work(5)));
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Mismatched migration id and sought state are both no-ops.
    worker.abort(&ntp(0), MigrationId(4), MigrationState::Prepared);
    worker.abort(&ntp(0), MigrationId(5), MigrationState::Executed);
    assert_eq!(worker.managed_count(), 1);

    worker.abort(&ntp(0), MigrationId(5), MigrationState::Prepared);
    assert_eq!(
        pending.await.unwrap(),
        Err(MigrationError::InvalidMigrationState)
    );
    assert_eq!(worker.managed_count(), 0);
}

#[tokio::test]
async fn test_abort_on_unmanaged_ntp_is_noop() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);

    worker.abort(&ntp(7), MigrationId(1), MigrationState::Prepared);
    assert_eq!(worker.managed_count(), 0);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_stop_resolves_pending_work_with_shutting_down() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);

    let pending = tokio::spawn(worker.clone().perform(ntp(0), inbound_work(1)));
    tokio::time::sleep(Duration::from_millis(20)).await;

    worker.stop().await;
    assert_eq!(pending.await.unwrap(), Err(MigrationError::ShuttingDown));
    assert_eq!(worker.managed_count(), 0);

    // New work is refused after stop.
    let refused = worker.clone().perform(ntp(1), inbound_work(1)).await;
    assert_eq!(refused, Err(MigrationError::ShuttingDown));
}

// ============================================================================
// Programmer errors
// ============================================================================

#[tokio::test]
#[should_panic(expected = "partition work requested")]
async fn test_inbound_work_towards_executed_panics() {
    let leaders = InMemoryLeaders::new();
    let runner = ScriptedRunner::new();
    let worker = new_worker(&leaders, &runner);

    let work = PartitionWork {
        migration_id: MigrationId(1),
        sought_state: MigrationState::Executed,
        info: PartitionWorkInfo::Inbound { alias: None },
    };
    let _ = worker.clone().perform(ntp(0), work).await;
}

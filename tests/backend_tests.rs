//! End-to-end tests for the reconciliation backend.
//!
//! These tests drive the backend through the in-memory stores: the
//! migration table with a loopback frontend, topology/shard/leadership
//! stores, a routing peer client and scripted partition actions.

use std::sync::Arc;
use std::time::Duration;

use caravan::migration::mock::{
    InMemoryLeaders, InMemoryShards, InMemoryTopics, LoopbackFrontend, RoutingPeerClient,
    ScriptedRunner, reply_with_status,
};
use caravan::migration::{
    CheckNtpStatesRequest, InboundMigration, InboundTopic, MigrationConfig, MigrationDescriptor,
    MigrationRecord, MigrationRpcService, MigrationState, MigrationTable, NtpMigrationTuple,
    OutboundMigration, ReconciliationBackend, ReconciliationOverview, ReplicaStatus,
    controller_ntp,
};
use caravan::types::{MigrationId, NodeId, Ntp, PartitionIndex, ShardId, TopicNamespace};

const NODE_A: NodeId = NodeId(1);
const NODE_B: NodeId = NodeId(2);
const NODE_C: NodeId = NodeId(3);

fn test_config() -> MigrationConfig {
    MigrationConfig {
        retry_min_backoff: Duration::from_millis(10),
        retry_max_backoff: Duration::from_millis(100),
        worker_operation_timeout: Duration::from_millis(500),
        event_queue_capacity: 256,
        shards: 2,
    }
}

fn topic(name: &str) -> TopicNamespace {
    TopicNamespace::new("kafka", name)
}

fn ntp(name: &str, partition: i32) -> Ntp {
    Ntp::new("kafka", name, PartitionIndex(partition))
}

fn inbound_record(id: i64, topics: &[&str], state: MigrationState) -> MigrationRecord {
    MigrationRecord {
        id: MigrationId(id),
        descriptor: MigrationDescriptor::Inbound(InboundMigration {
            topics: topics
                .iter()
                .map(|name| InboundTopic {
                    source: topic(name),
                    alias: None,
                })
                .collect(),
        }),
        state,
    }
}

fn outbound_record(id: i64, topics: &[&str], state: MigrationState) -> MigrationRecord {
    MigrationRecord {
        id: MigrationId(id),
        descriptor: MigrationDescriptor::Outbound(OutboundMigration {
            topics: topics.iter().map(|name| topic(name)).collect(),
            copy_to: None,
        }),
        state,
    }
}

struct TestNode {
    backend: Arc<ReconciliationBackend>,
    shards: Arc<InMemoryShards>,
    runner: Arc<ScriptedRunner>,
}

fn spawn_node(
    node: NodeId,
    table: &Arc<MigrationTable>,
    topics: &Arc<InMemoryTopics>,
    leaders: &Arc<InMemoryLeaders>,
    peers: &Arc<RoutingPeerClient>,
) -> TestNode {
    let shards = InMemoryShards::new();
    let runner = ScriptedRunner::new();
    let backend = ReconciliationBackend::new(
        node,
        test_config(),
        table.clone(),
        LoopbackFrontend::new(table.clone()),
        runner.clone(),
        peers.clone(),
        topics.clone(),
        shards.clone(),
        leaders.clone(),
    );
    peers.route(node, &backend);
    backend.start();
    TestNode {
        backend,
        shards,
        runner,
    }
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_state(table: &Arc<MigrationTable>, id: MigrationId, state: MigrationState) {
    wait_for(&format!("migration {id} to reach {state}"), || {
        table.snapshot(id).map(|r| r.state) == Some(state)
    })
    .await;
}

async fn wait_for_overview(
    backend: &Arc<ReconciliationBackend>,
    what: &str,
    cond: impl Fn(&ReconciliationOverview) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let overview = backend.overview().await;
        if cond(&overview) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}, last overview: {overview:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Scenario: single-partition inbound happy path
// ============================================================================

#[tokio::test]
async fn test_single_partition_inbound_happy_path() {
    let table = Arc::new(MigrationTable::new());
    let topics = InMemoryTopics::new();
    let leaders = InMemoryLeaders::new();
    let peers = RoutingPeerClient::new();

    let t0 = ntp("t", 0);
    topics.set_partition(&t0, vec![NODE_A]);
    leaders.set_leader(&t0, Some(NODE_A));
    leaders.set_leader(&controller_ntp(), Some(NODE_A));

    let node = spawn_node(NODE_A, &table, &topics, &leaders, &peers);
    node.shards.set_shard(&t0, Some(ShardId(0)));

    table.apply(inbound_record(7, &["t"], MigrationState::Preparing));

    // The worker runs the prepare action once, the coordinator observes
    // the partition as done and drives the chain of advances through to
    // completion.
    wait_for_state(&table, MigrationId(7), MigrationState::Finished).await;
    assert_eq!(node.runner.calls(&t0), 1);

    node.backend.verify_invariants().await.unwrap();
    let overview = node.backend.overview().await;
    assert_eq!(overview.tracked_migrations, 0);
    assert_eq!(overview.outstanding_partitions, 0);
    assert_eq!(overview.local_partitions, 0);
    assert_eq!(overview.pending_advances, 0);

    node.backend.stop().await;
}

// ============================================================================
// Scenario: three-node outbound with one flaky node
// ============================================================================

#[tokio::test]
async fn test_outbound_migration_with_flaky_node_retries_with_backoff() {
    let table = Arc::new(MigrationTable::new());
    let topics = InMemoryTopics::new();
    let leaders = InMemoryLeaders::new();
    let peers = RoutingPeerClient::new();

    for partition in 0..3 {
        let u = ntp("u", partition);
        topics.set_partition(&u, vec![NODE_A, NODE_B, NODE_C]);
        leaders.set_leader(&u, Some(NODE_A));
    }
    leaders.set_leader(&controller_ntp(), Some(NODE_A));

    // B and C answer done for everything; B's first delivery fails.
    peers.respond_with(
        NODE_B,
        Box::new(|request| Ok(reply_with_status(&request, ReplicaStatus::Done))),
    );
    peers.respond_with(
        NODE_C,
        Box::new(|request| Ok(reply_with_status(&request, ReplicaStatus::Done))),
    );
    peers.fail_times(NODE_B, 1);

    let node = spawn_node(NODE_A, &table, &topics, &leaders, &peers);
    for partition in 0..3 {
        node.shards.set_shard(&ntp("u", partition), Some(ShardId(0)));
    }

    table.apply(outbound_record(11, &["u"], MigrationState::Preparing));
    wait_for_state(&table, MigrationId(11), MigrationState::Finished).await;

    // Two per-partition work cycles: towards prepared and towards
    // executed.
    for partition in 0..3 {
        assert_eq!(node.runner.calls(&ntp("u", partition)), 2);
    }
    // B: failed delivery + backoff retry in the first cycle, one call in
    // the second. C: one call per cycle. A single RPC in flight per node
    // at a time keeps these counts exact.
    assert_eq!(peers.calls(NODE_B), 3);
    assert_eq!(peers.calls(NODE_C), 2);

    node.backend.verify_invariants().await.unwrap();
    node.backend.stop().await;
}

// ============================================================================
// Scenario: migration cancelled mid-flight
// ============================================================================

#[tokio::test]
async fn test_cancellation_drops_all_tracking_and_aborts_workers() {
    let table = Arc::new(MigrationTable::new());
    let topics = InMemoryTopics::new();
    let leaders = InMemoryLeaders::new();
    let peers = RoutingPeerClient::new();

    // Five partitions: two replicated here, three on a node that keeps
    // reporting in-progress.
    for partition in 0..2 {
        let v = ntp("v", partition);
        topics.set_partition(&v, vec![NODE_A]);
        leaders.set_leader(&v, Some(NODE_A));
    }
    for partition in 2..5 {
        topics.set_partition(&ntp("v", partition), vec![NODE_B]);
    }
    leaders.set_leader(&controller_ntp(), Some(NODE_A));
    peers.respond_with(
        NODE_B,
        Box::new(|request| Ok(reply_with_status(&request, ReplicaStatus::CanRun))),
    );

    let node = spawn_node(NODE_A, &table, &topics, &leaders, &peers);
    for partition in 0..2 {
        let v = ntp("v", partition);
        node.shards.set_shard(&v, Some(ShardId(0)));
        node.runner.hold(&v);
    }

    // Outbound migration heading for executed, all five outstanding.
    table.apply(outbound_record(21, &["v"], MigrationState::Executing));
    wait_for(
        "local actions to start",
        || node.runner.calls(&ntp("v", 0)) == 1 && node.runner.calls(&ntp("v", 1)) == 1,
    )
    .await;
    wait_for_overview(&node.backend, "five outstanding partitions", |overview| {
        overview.outstanding_partitions == 5
    })
    .await;

    // The user cancels; the applied record goes terminal.
    let mut cancelled = table.snapshot(MigrationId(21)).unwrap();
    cancelled.state = MigrationState::Cancelled;
    table.apply(cancelled);

    wait_for_overview(&node.backend, "tracking to be dropped", |overview| {
        overview.tracked_migrations == 0
            && overview.outstanding_partitions == 0
            && overview.local_partitions == 0
            && overview.pending_advances == 0
            && overview.nodes_awaiting_retry == 0
    })
    .await;
    node.backend.verify_invariants().await.unwrap();

    // Held actions were aborted; their late completions are discarded
    // and nothing restarts them.
    node.runner.release(&ntp("v", 0));
    node.runner.release(&ntp("v", 1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.runner.calls(&ntp("v", 0)), 1);
    assert_eq!(node.runner.calls(&ntp("v", 1)), 1);
    assert_eq!(node.backend.local_status(&ntp("v", 0)).await, None);

    node.backend.stop().await;
}

// ============================================================================
// Scenario: coordinator failover
// ============================================================================

#[tokio::test]
async fn test_coordinator_failover_rebuilds_outstanding_set() {
    let table = Arc::new(MigrationTable::new());
    let topics = InMemoryTopics::new();
    let leaders = InMemoryLeaders::new();
    let peers = RoutingPeerClient::new();

    // Three migrations, each over one topic with two partitions
    // replicated on both nodes. No data partition has a leader, so no
    // work completes and the outstanding sets stay put.
    for (id, name) in [(1, "w1"), (2, "w2"), (3, "w3")] {
        for partition in 0..2 {
            topics.set_partition(&ntp(name, partition), vec![NODE_A, NODE_B]);
        }
        table.apply(inbound_record(id, &[name], MigrationState::Preparing));
    }
    leaders.set_leader(&controller_ntp(), Some(NODE_A));

    let node_a = spawn_node(NODE_A, &table, &topics, &leaders, &peers);
    let node_b = spawn_node(NODE_B, &table, &topics, &leaders, &peers);
    for (_, name) in [(1, "w1"), (2, "w2"), (3, "w3")] {
        for partition in 0..2 {
            node_a.shards.set_shard(&ntp(name, partition), Some(ShardId(0)));
            node_b.shards.set_shard(&ntp(name, partition), Some(ShardId(1)));
        }
    }

    wait_for_overview(&node_a.backend, "A to coordinate six partitions", |o| {
        o.is_coordinator && o.outstanding_partitions == 6
    })
    .await;
    node_a.backend.verify_invariants().await.unwrap();

    // Leadership moves to B: A tears its coordinator state down, B
    // rebuilds the same outstanding set from the records and topology.
    leaders.set_leader(&controller_ntp(), Some(NODE_B));

    wait_for_overview(&node_b.backend, "B to coordinate six partitions", |o| {
        o.is_coordinator && o.outstanding_partitions == 6
    })
    .await;
    wait_for_overview(&node_a.backend, "A to resign", |o| {
        !o.is_coordinator && o.outstanding_partitions == 0 && o.nodes_awaiting_retry == 0
    })
    .await;
    // A keeps the migrations' topics and sought states for its local
    // role.
    assert_eq!(node_a.backend.overview().await.tracked_migrations, 3);

    node_a.backend.verify_invariants().await.unwrap();
    node_b.backend.verify_invariants().await.unwrap();

    node_a.backend.stop().await;
    node_b.backend.stop().await;
}

// ============================================================================
// Scenario: replica gained then lost
// ============================================================================

#[tokio::test]
async fn test_replica_gained_then_lost_aborts_and_reports_waiting() {
    let table = Arc::new(MigrationTable::new());
    let topics = InMemoryTopics::new();
    let leaders = InMemoryLeaders::new();
    let peers = RoutingPeerClient::new();

    let t0 = ntp("t", 0);
    topics.set_partition(&t0, vec![NODE_B]);
    leaders.set_leader(&controller_ntp(), Some(NODE_A));
    peers.respond_with(
        NODE_B,
        Box::new(|request| Ok(reply_with_status(&request, ReplicaStatus::CanRun))),
    );

    let node = spawn_node(NODE_A, &table, &topics, &leaders, &peers);
    let service = MigrationRpcService::new(node.backend.clone());

    table.apply(inbound_record(3, &["t"], MigrationState::Preparing));
    wait_for_overview(&node.backend, "migration to be tracked", |o| {
        o.tracked_migrations == 1
    })
    .await;

    // A replica arrives on this node; work starts on the next poll.
    node.shards.set_shard(&t0, Some(ShardId(0)));
    leaders.set_leader(&t0, Some(NODE_A));
    node.runner.hold(&t0);
    topics.set_partition(&t0, vec![NODE_B, NODE_A]);
    wait_for("the local action to start", || node.runner.calls(&t0) == 1).await;

    // The replica is reassigned away before the action completes.
    node.shards.set_shard(&t0, None);

    let tuple = NtpMigrationTuple {
        ntp: t0.clone(),
        migration_id: MigrationId(3),
        sought_state: MigrationState::Prepared,
    };
    let reply = service
        .check_ntp_states(CheckNtpStatesRequest {
            entries: vec![tuple.clone()],
        })
        .await;
    assert_eq!(reply.entries.len(), 1);
    assert_eq!(reply.entries[0].status, ReplicaStatus::WaitingForRpc);

    // The aborted action's late completion is discarded; nothing
    // restarts it while the shard is unassigned.
    node.runner.release(&t0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.runner.calls(&t0), 1);

    node.backend.verify_invariants().await.unwrap();
    node.backend.stop().await;
}

// ============================================================================
// check_ntp_states idempotence
// ============================================================================

#[tokio::test]
async fn test_check_ntp_states_is_idempotent() {
    let table = Arc::new(MigrationTable::new());
    let topics = InMemoryTopics::new();
    let leaders = InMemoryLeaders::new();
    let peers = RoutingPeerClient::new();

    let t0 = ntp("t", 0);
    topics.set_partition(&t0, vec![NODE_A]);
    // No controller leadership: this node only plays the local role and
    // leaves dispatch to explicit requests.
    let node = spawn_node(NODE_A, &table, &topics, &leaders, &peers);
    node.shards.set_shard(&t0, Some(ShardId(0)));
    node.runner.hold(&t0);
    leaders.set_leader(&t0, Some(NODE_A));

    table.apply(inbound_record(9, &["t"], MigrationState::Preparing));
    wait_for_local_status(&node.backend, &t0, Some(ReplicaStatus::WaitingForRpc)).await;

    let service = MigrationRpcService::new(node.backend.clone());
    let request = CheckNtpStatesRequest {
        entries: vec![
            NtpMigrationTuple {
                ntp: t0.clone(),
                migration_id: MigrationId(9),
                sought_state: MigrationState::Prepared,
            },
            // Unknown tuple: answered waiting_for_rpc.
            NtpMigrationTuple {
                ntp: ntp("unknown", 0),
                migration_id: MigrationId(42),
                sought_state: MigrationState::Prepared,
            },
        ],
    };

    let first = service.check_ntp_states(request.clone()).await;
    let second = service.check_ntp_states(request.clone()).await;

    assert_eq!(first.entries[0].status, ReplicaStatus::CanRun);
    assert_eq!(first.entries[1].status, ReplicaStatus::WaitingForRpc);
    assert_eq!(first, second);
    assert_eq!(node.runner.calls(&t0), 1);

    // After the action completes, both calls report done.
    node.runner.release(&t0);
    wait_for_local_status(&node.backend, &t0, Some(ReplicaStatus::Done)).await;
    let third = service.check_ntp_states(request.clone()).await;
    let fourth = service.check_ntp_states(request).await;
    assert_eq!(third.entries[0].status, ReplicaStatus::Done);
    assert_eq!(third, fourth);

    node.backend.stop().await;
}

async fn wait_for_local_status(
    backend: &Arc<ReconciliationBackend>,
    ntp: &Ntp,
    expected: Option<ReplicaStatus>,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = backend.local_status(ntp).await;
        if status == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for local status {expected:?}, last seen {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

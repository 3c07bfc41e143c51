//! Prometheus metrics for the migration reconciliation core.
//!
//! Metrics cover coordinator RPC traffic, node retries, advance
//! proposals and partition work outcomes.
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "caravan"
//! prefix to avoid name collisions with other libraries using the
//! default Prometheus registry. Registration errors are handled
//! gracefully - if a metric fails to register, the unregistered metric
//! is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::warn;

/// Custom Prometheus registry for Caravan metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("caravan".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid metric name");
    if let Err(error) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, %error, "failed to register metric");
    }
    counter
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric name and labels");
    if let Err(error) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, %error, "failed to register metric");
    }
    counter
}

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid metric name");
    if let Err(error) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, %error, "failed to register metric");
    }
    gauge
}

/// Coordinator RPCs finished, labelled by outcome (`ok`,
/// `transport_error`, `stale`).
pub static RPCS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "rpcs_finished",
        "check_ntp_states RPCs finished, by outcome",
        &["outcome"],
    )
});

/// Nodes re-scheduled for a later RPC attempt.
pub static NODE_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_safe(
        &REGISTRY,
        "node_retries",
        "Nodes scheduled for a delayed RPC retry",
    )
});

/// Advance proposals finished, labelled by outcome (`ok`, `rejected`).
pub static ADVANCES_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "advances_finished",
        "Migration state advance proposals finished, by outcome",
        &["outcome"],
    )
});

/// Partition work completions, labelled by outcome (`success`, `retry`,
/// `shutdown`).
pub static PARTITION_WORK_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "partition_work_results",
        "Partition work completions, by outcome",
        &["outcome"],
    )
});

/// Migrations with outstanding reconciliation work on the coordinator.
pub static OUTSTANDING_MIGRATIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_safe(
        &REGISTRY,
        "outstanding_migrations",
        "Migrations with outstanding reconciliation work",
    )
});

/// Local partitions with tracked migration work on this node.
pub static LOCAL_WORK_PARTITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_safe(
        &REGISTRY,
        "local_work_partitions",
        "Local partitions with tracked migration work",
    )
});

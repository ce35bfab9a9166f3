//! Prometheus metrics collection for driftd.
//!
//! The embedding server is expected to expose these on its own HTTP
//! endpoint; this module only registers and updates them.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The registry every driftd metric is registered against.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn int_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid metric opts");
    let _ = registry().register(Box::new(counter.clone()));
    counter
}

fn int_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("valid metric opts");
    let _ = registry().register(Box::new(counter.clone()));
    counter
}

fn int_gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid metric opts");
    let _ = registry().register(Box::new(gauge.clone()));
    gauge
}

/// Currently held local subscriptions, across all topics.
pub fn active_subscriptions() -> &'static IntGauge {
    static M: OnceLock<IntGauge> = OnceLock::new();
    M.get_or_init(|| {
        int_gauge(
            "drift_active_subscriptions",
            "Currently held local subscriptions across all topics",
        )
    })
}

/// Discovery races started, labeled by topic.
pub fn discovery_races() -> &'static IntCounterVec {
    static M: OnceLock<IntCounterVec> = OnceLock::new();
    M.get_or_init(|| {
        int_counter_vec(
            "drift_discovery_races_total",
            "Provider discovery races started",
            &["topic"],
        )
    })
}

/// Discovery offers that expired without a provider response.
pub fn discovery_timeouts() -> &'static IntCounter {
    static M: OnceLock<IntCounter> = OnceLock::new();
    M.get_or_init(|| {
        int_counter(
            "drift_discovery_timeouts_total",
            "Discovery offers that expired without a provider response",
        )
    })
}

/// Locks currently held by this node (leader side).
pub fn locks_held() -> &'static IntGauge {
    static M: OnceLock<IntGauge> = OnceLock::new();
    M.get_or_init(|| {
        int_gauge(
            "drift_locks_held",
            "Cluster locks currently held on this node",
        )
    })
}

/// Live nodes in this process's view of the cluster.
pub fn cluster_nodes() -> &'static IntGauge {
    static M: OnceLock<IntGauge> = OnceLock::new();
    M.get_or_init(|| {
        int_gauge(
            "drift_cluster_nodes",
            "Live nodes in this process's cluster view",
        )
    })
}

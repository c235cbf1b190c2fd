//! Observability infrastructure for the CPU advisor
//!
//! Provides:
//! - Prometheus metrics (cycle latency, region counts, policy failures,
//!   per-pool allocation, headroom)
//! - Structured logging of significant advisor events with tracing

use prometheus::{
    register_gauge, register_histogram, register_int_counter_vec, register_int_gauge_vec,
    Gauge, Histogram, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for cycle latency (in seconds)
const CYCLE_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AdvisorMetricsInner> = OnceLock::new();

struct AdvisorMetricsInner {
    cycle_latency_seconds: Histogram,
    regions: IntGaugeVec,
    policy_update_failures: IntCounterVec,
    pool_allocation_cpus: IntGaugeVec,
    headroom_cpus: Gauge,
}

impl AdvisorMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "cpu_advisor_cycle_latency_seconds",
                "Time spent computing one provisioning cycle",
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            regions: register_int_gauge_vec!(
                "cpu_advisor_regions",
                "Number of live regions by region type",
                &["region_type"]
            )
            .expect("Failed to register regions"),

            policy_update_failures: register_int_counter_vec!(
                "cpu_advisor_policy_update_failures_total",
                "Policy update failures by region and policy name",
                &["region", "policy"]
            )
            .expect("Failed to register policy_update_failures"),

            pool_allocation_cpus: register_int_gauge_vec!(
                "cpu_advisor_pool_allocation_cpus",
                "Provisioned core count by pool",
                &["pool"]
            )
            .expect("Failed to register pool_allocation_cpus"),

            headroom_cpus: register_gauge!(
                "cpu_advisor_headroom_cpus",
                "Aggregate spare capacity available for reclaimable work"
            )
            .expect("Failed to register headroom_cpus"),
        }
    }
}

/// Advisor metrics for Prometheus exposition.
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Debug, Clone)]
pub struct AdvisorMetrics {
    _private: (),
}

impl Default for AdvisorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AdvisorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AdvisorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AdvisorMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn set_region_count(&self, region_type: &str, count: i64) {
        self.inner()
            .regions
            .with_label_values(&[region_type])
            .set(count);
    }

    pub fn inc_policy_update_failure(&self, region: &str, policy: &str) {
        self.inner()
            .policy_update_failures
            .with_label_values(&[region, policy])
            .inc();
    }

    pub fn set_pool_allocation(&self, pool: &str, cpus: i64) {
        self.inner()
            .pool_allocation_cpus
            .with_label_values(&[pool])
            .set(cpus);
    }

    pub fn set_headroom(&self, cpus: f64) {
        self.inner().headroom_cpus.set(cpus);
    }
}

/// Structured logger for advisor events.
#[derive(Clone)]
pub struct AdvisorLogger {
    node_name: String,
}

impl AdvisorLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log one allocation table received from the advisor.
    pub fn log_allocation_received(&self, pools: usize, reclaim_cpus: usize) {
        info!(
            event = "allocation_received",
            node = %self.node_name,
            pools = pools,
            reclaim_cpus = reclaim_cpus,
            "Allocation table received from advisor"
        );
    }

    /// Log the current aggregate headroom estimate.
    pub fn log_headroom(&self, headroom_cpus: f64) {
        info!(
            event = "headroom_estimated",
            node = %self.node_name,
            headroom_cpus = headroom_cpus,
            "Aggregate headroom estimated"
        );
    }

    /// Log a headroom query that could not be served.
    pub fn log_headroom_unavailable(&self, reason: &str) {
        warn!(
            event = "headroom_unavailable",
            node = %self.node_name,
            reason = %reason,
            "Headroom estimate unavailable"
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "advisor_started",
            node = %self.node_name,
            agent_version = %version,
            "CPU advisor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "advisor_shutdown",
            node = %self.node_name,
            reason = %reason,
            "CPU advisor shutting down"
        );
    }
}

//! Core data models for the CPU advisor
//!
//! Container, pool, and region records mirror what the enforcement layer
//! reports into the record store, plus the control-knob/indicator value types
//! exchanged between regions, policies, and the advisor loop.

use crate::cpuset::CpuSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Cores held back for system daemons; always allocated verbatim.
pub const POOL_NAME_RESERVE: &str = "reserve";
/// Default pool for shared-cores workloads without an explicit pool.
pub const POOL_NAME_SHARE: &str = "share";
/// Pool absorbing capacity not claimed by higher-priority pools.
pub const POOL_NAME_RECLAIM: &str = "reclaim";
/// Pool of NUMA-exclusive dedicated workloads.
pub const POOL_NAME_DEDICATED: &str = "dedicated";

/// Sentinel NUMA id meaning "not NUMA-bound / aggregate over shared nodes"
/// in an allocation table.
pub const NUMA_ID_AGGREGATE: i64 = -1;

/// Sentinel policy name reported before any policy has been selected.
pub const POLICY_NAME_NONE: &str = "none";
/// The built-in request-based estimation policy.
pub const POLICY_NAME_CANONICAL: &str = "canonical";

/// QoS class of a container, as labeled by the enforcement layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QosLevel {
    SharedCores,
    DedicatedCores,
    ReclaimedCores,
    SystemCores,
}

/// Kind of allocation domain a region represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegionType {
    /// A shared, non-exclusive pool of containers.
    Share,
    /// A workload pinned exclusively to one NUMA node.
    DedicatedNumaExclusive,
    /// Wrapper for a NUMA node with no workload, so aggregation has a
    /// uniform unit for idle capacity.
    Empty,
}

impl fmt::Display for RegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegionType::Share => "share",
            RegionType::DedicatedNumaExclusive => "dedicated-numa-exclusive",
            RegionType::Empty => "empty",
        };
        f.write_str(s)
    }
}

/// Mapping from NUMA node index to the CPU set assigned on that node.
///
/// Different owners' assignments may overlap (reclaim oversubscribed onto
/// already-allocated cores); one owner's entries never overlap each other.
pub type TopologyAwareAssignment = BTreeMap<usize, CpuSet>;

/// Total number of cores across all nodes of an assignment.
pub fn assignment_cpu_count(assignment: &TopologyAwareAssignment) -> usize {
    assignment.values().map(CpuSet::size).sum()
}

/// Container names currently tracked, keyed by pod UID.
///
/// Values are only mutated through [`PodSet::insert`]; accessors on owning
/// components return clones, never live aliases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSet(BTreeMap<String, BTreeSet<String>>);

impl PodSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, pod_uid: &str, container_name: &str) {
        self.0
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn num_pods(&self) -> usize {
        self.0.len()
    }

    pub fn num_containers(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }
}

/// Container information tracked for the advisor.
///
/// Mutated whenever allocation changes; destroyed when the container leaves
/// the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    // Metadata unchanged during the container's lifecycle
    pub pod_uid: String,
    pub pod_namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub container_index: usize,
    pub qos_level: QosLevel,
    pub cpu_request: f64,
    pub memory_request: f64,

    // Allocation information changing by list and watch
    pub owner_pool_name: String,
    /// Whether a dedicated container is pinned to specific NUMA nodes.
    pub numa_binding: bool,
    pub topology_aware_assignments: TopologyAwareAssignment,
    pub original_topology_aware_assignments: TopologyAwareAssignment,
    /// Names of the regions currently responsible for this container.
    pub region_names: BTreeSet<String>,
}

impl ContainerRecord {
    /// True for dedicated containers pinned to, and sole occupants of,
    /// their NUMA nodes.
    pub fn is_numa_binding(&self) -> bool {
        self.qos_level == QosLevel::DedicatedCores && self.numa_binding
    }
}

/// Pool information reported by the enforcement layer; read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub pool_name: String,
    pub topology_aware_assignments: TopologyAwareAssignment,
    pub original_topology_aware_assignments: TopologyAwareAssignment,
    pub region_names: BTreeSet<String>,
}

impl PoolRecord {
    pub fn cpu_count(&self) -> usize {
        assignment_cpu_count(&self.topology_aware_assignments)
    }

    /// Cores this pool holds on the given NUMA node.
    pub fn cpus_on_node(&self, node: usize) -> usize {
        self.topology_aware_assignments
            .get(&node)
            .map_or(0, CpuSet::size)
    }
}

/// Persisted summary of a live region, written back to the record store each
/// cycle so region-to-container ownership survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub region_type: RegionType,
    /// NUMA node IDs the region is bound to.
    pub binding_numas: CpuSet,

    pub headroom: f64,
    pub headroom_policy_top_priority: String,
    pub headroom_policy_in_use: String,

    pub control_knob_map: ControlKnob,
    pub provision_policy_top_priority: String,
    pub provision_policy_in_use: String,
}

/// Essential per-region tunables, supplied top-down from configuration each
/// cycle. Invariant: `resource_lower_bound <= resource_upper_bound`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceEssentials {
    pub enable_reclaim: bool,
    pub resource_upper_bound: f64,
    pub resource_lower_bound: f64,
    pub reserved_for_allocate: f64,
}

/// Available control knob keys output by provision policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlKnobName {
    /// Target cpuset size of pods with high QoS level (dedicated and shared
    /// cores).
    NonReclaimedCpusetSize,
    /// CPU resource that can be supplied to reclaimed-cores pods.
    ReclaimedCpuSupplied,
}

/// Adjustment actions attached to a control knob value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlKnobAction {
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlKnobValue {
    pub value: f64,
    pub action: ControlKnobAction,
}

impl ControlKnobValue {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            action: ControlKnobAction::None,
        }
    }
}

/// Tunable system entries affecting indicator metrics, keyed by knob name;
/// the provisioning policy's output contract.
pub type ControlKnob = BTreeMap<ControlKnobName, ControlKnobValue>;

/// Indicator values of different levels for one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValue {
    pub current: f64,
    pub target: f64,
    pub high: f64,
    pub low: f64,
}

/// System metrics related to service stability, keyed by metric name.
pub type Indicator = BTreeMap<String, IndicatorValue>;

/// Update result flag for one policy chain entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyUpdateStatus {
    Succeeded,
    Failed,
}

/// Allocation table handed to the enforcement consumer each cycle: pool name
/// to NUMA node index ([`NUMA_ID_AGGREGATE`] for unbound capacity) to core
/// count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalCalculationResult {
    pub pool_entries: BTreeMap<String, BTreeMap<i64, usize>>,
}

impl InternalCalculationResult {
    pub fn is_empty(&self) -> bool {
        self.pool_entries.is_empty()
    }

    pub fn set_pool_entry(&mut self, pool_name: &str, numa_id: i64, cpus: usize) {
        self.pool_entries
            .entry(pool_name.to_string())
            .or_default()
            .insert(numa_id, cpus);
    }

    pub fn pool_entry(&self, pool_name: &str, numa_id: i64) -> Option<usize> {
        self.pool_entries.get(pool_name)?.get(&numa_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_set_insert_is_idempotent() {
        let mut pods = PodSet::new();
        pods.insert("uid1", "c1");
        pods.insert("uid1", "c1");
        pods.insert("uid1", "c2");
        assert_eq!(pods.num_pods(), 1);
        assert_eq!(pods.num_containers(), 2);
    }

    #[test]
    fn test_assignment_cpu_count() {
        let mut assignment = TopologyAwareAssignment::new();
        assignment.insert(0, CpuSet::parse("0-3").unwrap());
        assignment.insert(1, CpuSet::parse("24-25").unwrap());
        assert_eq!(assignment_cpu_count(&assignment), 6);
    }

    #[test]
    fn test_numa_binding_requires_dedicated_qos() {
        let mut record = ContainerRecord {
            pod_uid: "uid1".to_string(),
            pod_namespace: "default".to_string(),
            pod_name: "pod1".to_string(),
            container_name: "c1".to_string(),
            container_index: 0,
            qos_level: QosLevel::SharedCores,
            cpu_request: 2.0,
            memory_request: 0.0,
            owner_pool_name: POOL_NAME_SHARE.to_string(),
            numa_binding: true,
            topology_aware_assignments: TopologyAwareAssignment::new(),
            original_topology_aware_assignments: TopologyAwareAssignment::new(),
            region_names: BTreeSet::new(),
        };
        assert!(!record.is_numa_binding());
        record.qos_level = QosLevel::DedicatedCores;
        assert!(record.is_numa_binding());
    }

    #[test]
    fn test_indicator_holds_levels_per_metric() {
        let mut indicator = Indicator::new();
        indicator.insert(
            "cpu_sched_wait".to_string(),
            IndicatorValue {
                current: 410.0,
                target: 460.0,
                high: 500.0,
                low: 400.0,
            },
        );
        let value = indicator["cpu_sched_wait"];
        assert!(value.low <= value.current && value.current <= value.high);
    }

    #[test]
    fn test_calculation_result_entries() {
        let mut result = InternalCalculationResult::default();
        result.set_pool_entry(POOL_NAME_RESERVE, NUMA_ID_AGGREGATE, 2);
        result.set_pool_entry(POOL_NAME_RECLAIM, 0, 2);
        assert_eq!(result.pool_entry(POOL_NAME_RESERVE, NUMA_ID_AGGREGATE), Some(2));
        assert_eq!(result.pool_entry(POOL_NAME_RECLAIM, 0), Some(2));
        assert_eq!(result.pool_entry(POOL_NAME_RECLAIM, 1), None);
    }
}

//! Machine topology and metric access
//!
//! The advisor does not discover hardware itself: it consumes CPU topology as
//! an already-resolved set of core IDs grouped by NUMA node, and reads metric
//! values through [`MetricsReader`]. Both are supplied by the surrounding
//! agent.

use crate::cpuset::CpuSet;
use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// Resolved CPU topology: NUMA node index to the cores on that node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTopology {
    numa_assignments: BTreeMap<usize, CpuSet>,
}

impl CpuTopology {
    pub fn new(numa_assignments: BTreeMap<usize, CpuSet>) -> Self {
        Self { numa_assignments }
    }

    /// NUMA node IDs present on the machine.
    pub fn numa_nodes(&self) -> CpuSet {
        self.numa_assignments.keys().copied().collect()
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.numa_assignments.len()
    }

    /// Cores on one NUMA node; empty set for an unknown node.
    pub fn cpus_on_node(&self, node: usize) -> CpuSet {
        self.numa_assignments.get(&node).cloned().unwrap_or_default()
    }

    /// Core count on one NUMA node.
    pub fn cpus_per_node(&self, node: usize) -> usize {
        self.numa_assignments.get(&node).map_or(0, CpuSet::size)
    }

    /// Total core count across the given NUMA nodes.
    pub fn cpus_on_nodes(&self, nodes: &CpuSet) -> usize {
        nodes.iter().map(|node| self.cpus_per_node(node)).sum()
    }

    pub fn num_cpus(&self) -> usize {
        self.numa_assignments.values().map(CpuSet::size).sum()
    }

    /// Build a synthetic two-level topology for tests and local runs:
    /// physical cores fill the first half of the ID space and hyperthread
    /// siblings the second half, each half split evenly across NUMA nodes.
    /// A 96-CPU 2-node machine yields node0 = 0-23,48-71 and
    /// node1 = 24-47,72-95.
    pub fn synthetic(num_cpus: usize, num_numa_nodes: usize) -> Result<Self> {
        if num_numa_nodes == 0 || num_cpus == 0 {
            bail!("synthetic topology requires at least one cpu and one numa node");
        }
        let half = num_cpus / 2;
        if half % num_numa_nodes != 0 {
            bail!(
                "cannot split {} physical cores evenly across {} numa nodes",
                half,
                num_numa_nodes
            );
        }
        let per_node = half / num_numa_nodes;
        let mut numa_assignments = BTreeMap::new();
        for node in 0..num_numa_nodes {
            let physical = node * per_node..(node + 1) * per_node;
            let siblings = half + node * per_node..half + (node + 1) * per_node;
            numa_assignments.insert(node, CpuSet::from_cores(physical.chain(siblings)));
        }
        Ok(Self { numa_assignments })
    }
}

/// Read access to per-container and per-node metric values.
///
/// `None` means the metric is not (yet) available; policies fall back to
/// declared requests in that case.
pub trait MetricsReader: Send + Sync {
    fn container_cpu_usage(&self, pod_uid: &str, container_name: &str) -> Option<f64>;
    fn node_cpu_usage(&self, numa_node: usize) -> Option<f64>;
}

/// Metrics reader with no data source; every query misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsReader;

impl MetricsReader for NullMetricsReader {
    fn container_cpu_usage(&self, _pod_uid: &str, _container_name: &str) -> Option<f64> {
        None
    }

    fn node_cpu_usage(&self, _numa_node: usize) -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_topology_layout() {
        let topology = CpuTopology::synthetic(96, 2).unwrap();
        assert_eq!(topology.num_cpus(), 96);
        assert_eq!(topology.num_numa_nodes(), 2);
        assert_eq!(
            topology.cpus_on_node(0),
            CpuSet::parse("0-23,48-71").unwrap()
        );
        assert_eq!(
            topology.cpus_on_node(1),
            CpuSet::parse("24-47,72-95").unwrap()
        );
    }

    #[test]
    fn test_synthetic_topology_rejects_uneven_split() {
        assert!(CpuTopology::synthetic(96, 5).is_err());
        assert!(CpuTopology::synthetic(0, 2).is_err());
        assert!(CpuTopology::synthetic(8, 0).is_err());
    }

    #[test]
    fn test_cpus_on_nodes_sums_selected() {
        let topology = CpuTopology::synthetic(96, 2).unwrap();
        assert_eq!(topology.cpus_on_nodes(&CpuSet::from_cores([0])), 48);
        assert_eq!(topology.cpus_on_nodes(&CpuSet::from_cores([0, 1])), 96);
        // Unknown nodes contribute nothing
        assert_eq!(topology.cpus_on_nodes(&CpuSet::from_cores([7])), 0);
    }

    #[test]
    fn test_null_metrics_reader_misses() {
        let reader = NullMetricsReader;
        assert!(reader.container_cpu_usage("uid1", "c1").is_none());
        assert!(reader.node_cpu_usage(0).is_none());
    }
}

//! Agent configuration

use advisor_lib::{AdminQosConfig, CpuSet, CpuTopology};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from the downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Interval between recompute signals to the advisor, in seconds
    #[serde(default = "default_recompute_interval")]
    pub recompute_interval_secs: u64,

    /// Whether spare capacity may be offered to reclaimed workloads
    #[serde(default)]
    pub enable_reclaim: bool,

    /// Warm-up grace period in seconds
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,

    /// Resolved NUMA topology as "node:cpulist" groups separated by ';',
    /// e.g. "0:0-23,48-71;1:24-47,72-95"
    #[serde(default = "default_numa_topology")]
    pub numa_topology: String,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_recompute_interval() -> u64 {
    5
}

fn default_startup_grace() -> u64 {
    30
}

fn default_numa_topology() -> String {
    let cpus = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    format!("0:0-{}", cpus.saturating_sub(1))
}

impl AgentConfig {
    /// Load configuration from environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("ADVISOR"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| AgentConfig {
            node_name: default_node_name(),
            api_port: default_api_port(),
            recompute_interval_secs: default_recompute_interval(),
            enable_reclaim: false,
            startup_grace_secs: default_startup_grace(),
            numa_topology: default_numa_topology(),
        }))
    }

    /// Parse the configured NUMA topology string.
    pub fn cpu_topology(&self) -> Result<CpuTopology> {
        let mut numa_assignments = BTreeMap::new();
        for group in self.numa_topology.split(';') {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            let (node, cpulist) = group
                .split_once(':')
                .ok_or_else(|| anyhow!("invalid numa topology group {:?}", group))?;
            numa_assignments.insert(node.trim().parse::<usize>()?, CpuSet::parse(cpulist)?);
        }
        if numa_assignments.is_empty() {
            return Err(anyhow!("numa topology {:?} has no nodes", self.numa_topology));
        }
        Ok(CpuTopology::new(numa_assignments))
    }

    /// Admin-QoS configuration derived from agent settings.
    pub fn admin_qos(&self) -> AdminQosConfig {
        let mut conf = AdminQosConfig::default();
        conf.reclaim.enable_reclaim = self.enable_reclaim;
        conf.cpu_advisor.startup_grace_secs = self.startup_grace_secs;
        conf
    }
}

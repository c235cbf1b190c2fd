//! Advisor configuration
//!
//! Sub-configurations are composed by explicit fields into one admin-QoS
//! configuration; dynamic updates arrive as patches applied through a single
//! aggregate step that forwards to each sub-configuration. Changes take
//! effect on the advisor's next cycle.

use crate::models::{RegionType, POLICY_NAME_CANONICAL};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Tunables of the reclaimed-resource feature.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReclaimConfig {
    /// Whether spare capacity may be offered to reclaimed-cores workloads.
    #[serde(default = "default_enable_reclaim")]
    pub enable_reclaim: bool,

    /// Cores held back for newly admitted high-QoS workloads, spread evenly
    /// across NUMA nodes.
    #[serde(default = "default_reserved_cpus_for_allocate")]
    pub reserved_cpus_for_allocate: f64,

    /// Static fallback cores the reclaim pool keeps even when reclaim is
    /// disabled, spread evenly across NUMA nodes.
    #[serde(default = "default_reserved_cpus_for_reclaim")]
    pub reserved_cpus_for_reclaim: f64,
}

/// Tunables of the CPU advisor loop itself.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CpuAdvisorConfig {
    /// Ordered provision policy names per region type; earlier entries have
    /// higher priority.
    #[serde(default = "default_provision_policies")]
    pub provision_policies: BTreeMap<RegionType, Vec<String>>,

    /// Ordered headroom policy names per region type.
    #[serde(default = "default_headroom_policies")]
    pub headroom_policies: BTreeMap<RegionType, Vec<String>>,

    /// Grace period after start during which the advisor answers with an
    /// empty result, so enforcement never acts on partial topology data.
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,

    /// Floor for a share region's provisioned cpuset size.
    #[serde(default = "default_min_share_cpus")]
    pub min_share_cpus: f64,
}

/// Admin-QoS configuration: explicit composition of the reclaimed-resource
/// and advisor sub-configurations.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AdminQosConfig {
    #[serde(default)]
    pub reclaim: ReclaimConfig,
    #[serde(default)]
    pub cpu_advisor: CpuAdvisorConfig,
}

impl AdminQosConfig {
    /// Apply a dynamic patch by forwarding to each sub-configuration.
    pub fn apply(&mut self, patch: &AdminQosPatch) {
        self.reclaim.apply(&patch.reclaim);
        self.cpu_advisor.apply(&patch.cpu_advisor);
    }
}

/// Partial update of [`AdminQosConfig`]; unset fields keep current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminQosPatch {
    #[serde(default)]
    pub reclaim: ReclaimPatch,
    #[serde(default)]
    pub cpu_advisor: CpuAdvisorPatch,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReclaimPatch {
    pub enable_reclaim: Option<bool>,
    pub reserved_cpus_for_allocate: Option<f64>,
    pub reserved_cpus_for_reclaim: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuAdvisorPatch {
    pub provision_policies: Option<BTreeMap<RegionType, Vec<String>>>,
    pub headroom_policies: Option<BTreeMap<RegionType, Vec<String>>>,
    pub startup_grace_secs: Option<u64>,
    pub min_share_cpus: Option<f64>,
}

impl ReclaimConfig {
    pub fn apply(&mut self, patch: &ReclaimPatch) {
        if let Some(enable) = patch.enable_reclaim {
            self.enable_reclaim = enable;
        }
        if let Some(reserved) = patch.reserved_cpus_for_allocate {
            self.reserved_cpus_for_allocate = reserved;
        }
        if let Some(reserved) = patch.reserved_cpus_for_reclaim {
            self.reserved_cpus_for_reclaim = reserved;
        }
    }
}

impl CpuAdvisorConfig {
    pub fn apply(&mut self, patch: &CpuAdvisorPatch) {
        if let Some(policies) = &patch.provision_policies {
            self.provision_policies = policies.clone();
        }
        if let Some(policies) = &patch.headroom_policies {
            self.headroom_policies = policies.clone();
        }
        if let Some(grace) = patch.startup_grace_secs {
            self.startup_grace_secs = grace;
        }
        if let Some(min) = patch.min_share_cpus {
            self.min_share_cpus = min;
        }
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enable_reclaim: default_enable_reclaim(),
            reserved_cpus_for_allocate: default_reserved_cpus_for_allocate(),
            reserved_cpus_for_reclaim: default_reserved_cpus_for_reclaim(),
        }
    }
}

impl Default for CpuAdvisorConfig {
    fn default() -> Self {
        Self {
            provision_policies: default_provision_policies(),
            headroom_policies: default_headroom_policies(),
            startup_grace_secs: default_startup_grace_secs(),
            min_share_cpus: default_min_share_cpus(),
        }
    }
}

fn default_enable_reclaim() -> bool {
    false
}

fn default_reserved_cpus_for_allocate() -> f64 {
    4.0
}

fn default_reserved_cpus_for_reclaim() -> f64 {
    4.0
}

fn default_provision_policies() -> BTreeMap<RegionType, Vec<String>> {
    BTreeMap::from([
        (RegionType::Share, vec![POLICY_NAME_CANONICAL.to_string()]),
        (
            RegionType::DedicatedNumaExclusive,
            vec![POLICY_NAME_CANONICAL.to_string()],
        ),
    ])
}

fn default_headroom_policies() -> BTreeMap<RegionType, Vec<String>> {
    BTreeMap::from([
        (RegionType::Share, vec![POLICY_NAME_CANONICAL.to_string()]),
        (
            RegionType::DedicatedNumaExclusive,
            vec![POLICY_NAME_CANONICAL.to_string()],
        ),
        (RegionType::Empty, vec![POLICY_NAME_CANONICAL.to_string()]),
    ])
}

fn default_startup_grace_secs() -> u64 {
    30
}

fn default_min_share_cpus() -> f64 {
    4.0
}

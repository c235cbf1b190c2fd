//! Allocation regions
//!
//! A region represents one allocation domain (a shared pool, a NUMA-
//! exclusive workload, or an idle NUMA node) and produces, on demand, a
//! control-knob decision and a headroom estimate by consulting its own
//! priority-ordered policy chains. All region state sits behind one lock so
//! observability paths may read while the advisor loop mutates; accessors
//! return defensive copies, never live aliases.

mod headroom;
mod provision;
mod regulator;

pub use headroom::{CanonicalHeadroomPolicy, HeadroomPolicy, HeadroomPolicyCtor, HeadroomPolicyRegistry};
pub use provision::{
    CanonicalProvisionPolicy, ProvisionPolicy, ProvisionPolicyCtor, ProvisionPolicyRegistry,
};
pub use regulator::CpuRegulator;

use crate::config::AdminQosConfig;
use crate::cpuset::CpuSet;
use crate::machine::{CpuTopology, MetricsReader};
use crate::models::{
    ContainerRecord, ControlKnob, PodSet, PolicyUpdateStatus, RegionType, ResourceEssentials,
    TopologyAwareAssignment, POLICY_NAME_NONE, POOL_NAME_RESERVE,
};
use crate::observability::AdvisorMetrics;
use crate::store::RecordStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Recoverable failure of one policy's estimation pass.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy has not produced a valid result yet")]
    NotUpdated,
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

/// Failure of a region operation.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("container record nil")]
    NilContainer,
    #[error("failed to get valid provision for region {0}")]
    NoValidProvision(String),
    #[error("failed to get valid headroom for region {0}")]
    NoValidHeadroom(String),
}

/// Dependencies a policy is constructed with, besides configuration.
#[derive(Clone)]
pub struct PolicyContext {
    pub region_name: String,
    pub region_type: RegionType,
    pub store: Arc<dyn RecordStore>,
    pub topology: Arc<CpuTopology>,
    pub metrics: Arc<dyn MetricsReader>,
    pub emitter: AdvisorMetrics,
}

/// Shared dependencies handed to every region the advisor creates.
#[derive(Clone)]
pub struct RegionDeps {
    pub store: Arc<dyn RecordStore>,
    pub topology: Arc<CpuTopology>,
    pub metrics: Arc<dyn MetricsReader>,
    pub emitter: AdvisorMetrics,
}

/// Provision and headroom registries, populated at startup.
pub struct PolicyRegistries {
    pub provision: ProvisionPolicyRegistry,
    pub headroom: HeadroomPolicyRegistry,
}

impl PolicyRegistries {
    pub fn with_defaults() -> Self {
        Self {
            provision: ProvisionPolicyRegistry::with_defaults(),
            headroom: HeadroomPolicyRegistry::with_defaults(),
        }
    }
}

impl Default for PolicyRegistries {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Estimated CPU usage of a membership set: the metric value per container
/// when available, the declared request otherwise. Containers missing from
/// the store are skipped with a warning.
pub(crate) fn estimate_cpu_usage(
    pod_set: &PodSet,
    store: &dyn RecordStore,
    metrics: &dyn MetricsReader,
) -> f64 {
    let mut estimation = 0.0;
    for (pod_uid, containers) in pod_set.iter() {
        for container_name in containers {
            match store.get_container(pod_uid, container_name) {
                Some(record) => {
                    estimation += metrics
                        .container_cpu_usage(pod_uid, container_name)
                        .unwrap_or(record.cpu_request);
                }
                None => {
                    warn!(
                        pod_uid = %pod_uid,
                        container = %container_name,
                        "container missing from record store, skipped in estimation"
                    );
                }
            }
        }
    }
    estimation
}

/// Reserve-pool cores sitting on the given NUMA nodes.
pub(crate) fn reserve_pool_cpus_on(store: &dyn RecordStore, numas: &CpuSet) -> usize {
    store.get_pool(POOL_NAME_RESERVE).map_or(0, |pool| {
        numas.iter().map(|node| pool.cpus_on_node(node)).sum()
    })
}

struct ProvisionEntry {
    name: String,
    status: PolicyUpdateStatus,
    policy: Box<dyn ProvisionPolicy>,
}

struct HeadroomEntry {
    name: String,
    status: PolicyUpdateStatus,
    policy: Box<dyn HeadroomPolicy>,
}

struct RegionState {
    binding_numas: CpuSet,
    pod_set: PodSet,
    /// Reference assignment adopted from the first container; later members
    /// are checked against it without blocking.
    container_assignment: TopologyAwareAssignment,
    assignment_conflicts: u64,
    essentials: ResourceEssentials,

    provision_policies: Vec<ProvisionEntry>,
    provision_in_use: Option<usize>,
    headroom_policies: Vec<HeadroomEntry>,
    headroom_in_use: Option<usize>,
}

/// One allocation domain with its live membership and policy chains.
pub struct Region {
    name: String,
    owner_pool_name: String,
    region_type: RegionType,
    state: Mutex<RegionState>,
}

impl Region {
    pub fn new(
        name: impl Into<String>,
        owner_pool_name: impl Into<String>,
        region_type: RegionType,
        binding_numas: CpuSet,
        conf: &AdminQosConfig,
        extra: Option<&serde_json::Value>,
        deps: &RegionDeps,
        registries: &PolicyRegistries,
    ) -> Self {
        let name = name.into();
        let owner_pool_name = owner_pool_name.into();

        let ctx = PolicyContext {
            region_name: name.clone(),
            region_type,
            store: deps.store.clone(),
            topology: deps.topology.clone(),
            metrics: deps.metrics.clone(),
            emitter: deps.emitter.clone(),
        };

        let provision_policies =
            Self::init_provision_policies(&name, region_type, &binding_numas, conf, extra, &ctx, registries);
        let headroom_policies =
            Self::init_headroom_policies(&name, region_type, &binding_numas, conf, extra, &ctx, registries);

        Self {
            name,
            owner_pool_name,
            region_type,
            state: Mutex::new(RegionState {
                binding_numas,
                pod_set: PodSet::new(),
                container_assignment: TopologyAwareAssignment::new(),
                assignment_conflicts: 0,
                essentials: ResourceEssentials::default(),
                provision_policies,
                provision_in_use: None,
                headroom_policies,
                headroom_in_use: None,
            }),
        }
    }

    fn init_provision_policies(
        region_name: &str,
        region_type: RegionType,
        binding_numas: &CpuSet,
        conf: &AdminQosConfig,
        extra: Option<&serde_json::Value>,
        ctx: &PolicyContext,
        registries: &PolicyRegistries,
    ) -> Vec<ProvisionEntry> {
        let Some(configured) = conf.cpu_advisor.provision_policies.get(&region_type) else {
            warn!(
                region = %region_name,
                region_type = %region_type,
                "no provision policies configured for region type"
            );
            return Vec::new();
        };

        let mut entries = Vec::new();
        for policy_name in configured {
            let Some(mut policy) = registries.provision.construct(
                policy_name,
                ctx.clone(),
                conf,
                extra,
                CpuRegulator::new(),
            ) else {
                warn!(
                    region = %region_name,
                    policy = %policy_name,
                    "unknown provision policy skipped"
                );
                continue;
            };
            policy.set_binding_numas(binding_numas.clone());
            entries.push(ProvisionEntry {
                name: policy_name.clone(),
                status: PolicyUpdateStatus::Failed,
                policy,
            });
        }
        entries
    }

    fn init_headroom_policies(
        region_name: &str,
        region_type: RegionType,
        binding_numas: &CpuSet,
        conf: &AdminQosConfig,
        extra: Option<&serde_json::Value>,
        ctx: &PolicyContext,
        registries: &PolicyRegistries,
    ) -> Vec<HeadroomEntry> {
        let Some(configured) = conf.cpu_advisor.headroom_policies.get(&region_type) else {
            warn!(
                region = %region_name,
                region_type = %region_type,
                "no headroom policies configured for region type"
            );
            return Vec::new();
        };

        let mut entries = Vec::new();
        for policy_name in configured {
            let Some(mut policy) =
                registries.headroom.construct(policy_name, ctx.clone(), conf, extra)
            else {
                warn!(
                    region = %region_name,
                    policy = %policy_name,
                    "unknown headroom policy skipped"
                );
                continue;
            };
            policy.set_binding_numas(binding_numas.clone());
            entries.push(HeadroomEntry {
                name: policy_name.clone(),
                status: PolicyUpdateStatus::Failed,
                policy,
            });
        }
        entries
    }

    fn state(&self) -> MutexGuard<'_, RegionState> {
        // A panic while holding the lock leaves state consistent enough for
        // read-only observers; recover instead of poisoning the whole loop.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region_type(&self) -> RegionType {
        self.region_type
    }

    pub fn owner_pool_name(&self) -> &str {
        &self.owner_pool_name
    }

    pub fn is_empty(&self) -> bool {
        self.state().pod_set.is_empty()
    }

    /// Reset membership and reference assignment; used when a region becomes
    /// uninhabited before being dropped and at the start of reconciliation.
    pub fn clear(&self) {
        let mut state = self.state();
        state.pod_set = PodSet::new();
        state.container_assignment = TopologyAwareAssignment::new();
    }

    /// Current membership; an independently mutable copy.
    pub fn pods(&self) -> PodSet {
        self.state().pod_set.clone()
    }

    /// NUMA nodes assigned to this region; an independently mutable copy.
    pub fn binding_numas(&self) -> CpuSet {
        self.state().binding_numas.clone()
    }

    pub fn set_binding_numas(&self, numas: CpuSet) {
        let mut state = self.state();
        for entry in &mut state.provision_policies {
            entry.policy.set_binding_numas(numas.clone());
        }
        for entry in &mut state.headroom_policies {
            entry.policy.set_binding_numas(numas.clone());
        }
        state.binding_numas = numas;
    }

    /// Replace resource tunables; takes effect for all policies on the next
    /// update.
    pub fn set_essentials(&self, essentials: ResourceEssentials) {
        self.state().essentials = essentials;
    }

    /// Times the assignment sanity check has failed since creation.
    pub fn assignment_conflicts(&self) -> u64 {
        self.state().assignment_conflicts
    }

    /// Insert a container into membership. The first container's topology
    /// assignment becomes the region's reference assignment; a later
    /// container whose assignment differs is still admitted, since a
    /// transient mismatch during ramp-up must not stall the provisioning
    /// cycle, but the conflict is recorded and logged.
    pub fn add_container(&self, record: Option<&ContainerRecord>) -> Result<(), RegionError> {
        let Some(record) = record else {
            return Err(RegionError::NilContainer);
        };

        let mut state = self.state();
        state.pod_set.insert(&record.pod_uid, &record.container_name);

        if state.container_assignment.is_empty() {
            state.container_assignment = record.topology_aware_assignments.clone();
        } else if state.container_assignment != record.topology_aware_assignments {
            state.assignment_conflicts += 1;
            warn!(
                region = %self.name,
                pod_uid = %record.pod_uid,
                container = %record.container_name,
                "container topology assignment differs from region reference, sanity check failed"
            );
        }

        Ok(())
    }

    /// Refresh every provision policy, best-effort: failures are logged and
    /// recorded per entry, never propagated, so a later [`Region::get_provision`]
    /// can fall back cheaply.
    pub fn try_update_provision(&self) {
        let mut state = self.state();
        let pod_set = state.pod_set.clone();
        let essentials = state.essentials;
        let numas = state.binding_numas.clone();
        for entry in &mut state.provision_policies {
            entry.status = PolicyUpdateStatus::Failed;

            entry.policy.set_pod_set(pod_set.clone());
            entry.policy.set_essentials(essentials);
            entry.policy.set_binding_numas(numas.clone());

            if let Err(err) = entry.policy.update() {
                debug!(
                    region = %self.name,
                    policy = %entry.name,
                    error = %err,
                    "provision policy update failed"
                );
                continue;
            }
            entry.status = PolicyUpdateStatus::Succeeded;
        }
    }

    /// Refresh every headroom policy, best-effort; mirror of
    /// [`Region::try_update_provision`].
    pub fn try_update_headroom(&self) {
        let mut state = self.state();
        let pod_set = state.pod_set.clone();
        let essentials = state.essentials;
        let numas = state.binding_numas.clone();
        for entry in &mut state.headroom_policies {
            entry.status = PolicyUpdateStatus::Failed;

            entry.policy.set_pod_set(pod_set.clone());
            entry.policy.set_essentials(essentials);
            entry.policy.set_binding_numas(numas.clone());

            if let Err(err) = entry.policy.update() {
                debug!(
                    region = %self.name,
                    policy = %entry.name,
                    error = %err,
                    "headroom policy update failed"
                );
                continue;
            }
            entry.status = PolicyUpdateStatus::Succeeded;
        }
    }

    /// Control knob from the highest-priority policy whose last update
    /// succeeded and which can produce an adjusted value; records that
    /// policy as in-use.
    pub fn get_provision(&self) -> Result<ControlKnob, RegionError> {
        let mut state = self.state();
        for index in 0..state.provision_policies.len() {
            let entry = &state.provision_policies[index];
            if entry.status != PolicyUpdateStatus::Succeeded {
                continue;
            }
            match entry.policy.control_knob_adjusted() {
                Ok(knob) => {
                    state.provision_in_use = Some(index);
                    return Ok(knob);
                }
                Err(err) => {
                    warn!(
                        region = %self.name,
                        policy = %entry.name,
                        error = %err,
                        "get control knob adjusted failed"
                    );
                }
            }
        }
        Err(RegionError::NoValidProvision(self.name.clone()))
    }

    /// Headroom from the highest-priority policy currently valid; same
    /// fallback-first-success protocol as [`Region::get_provision`].
    pub fn get_headroom(&self) -> Result<f64, RegionError> {
        let mut state = self.state();
        for index in 0..state.headroom_policies.len() {
            let entry = &state.headroom_policies[index];
            if entry.status != PolicyUpdateStatus::Succeeded {
                continue;
            }
            match entry.policy.headroom() {
                Ok(headroom) => {
                    state.headroom_in_use = Some(index);
                    return Ok(headroom);
                }
                Err(err) => {
                    warn!(
                        region = %self.name,
                        policy = %entry.name,
                        error = %err,
                        "get headroom failed"
                    );
                }
            }
        }
        Err(RegionError::NoValidHeadroom(self.name.clone()))
    }

    /// Configured top-priority and currently in-use provision policy names;
    /// observability only, defaults to the "none" sentinel.
    pub fn provision_policy_names(&self) -> (String, String) {
        let state = self.state();
        let top_priority = state
            .provision_policies
            .first()
            .map_or(POLICY_NAME_NONE.to_string(), |entry| entry.name.clone());
        let in_use = state
            .provision_in_use
            .and_then(|index| state.provision_policies.get(index))
            .map_or(POLICY_NAME_NONE.to_string(), |entry| entry.name.clone());
        (top_priority, in_use)
    }

    /// Configured top-priority and currently in-use headroom policy names.
    pub fn headroom_policy_names(&self) -> (String, String) {
        let state = self.state();
        let top_priority = state
            .headroom_policies
            .first()
            .map_or(POLICY_NAME_NONE.to_string(), |entry| entry.name.clone());
        let in_use = state
            .headroom_in_use
            .and_then(|index| state.headroom_policies.get(index))
            .map_or(POLICY_NAME_NONE.to_string(), |entry| entry.name.clone());
        (top_priority, in_use)
    }
}

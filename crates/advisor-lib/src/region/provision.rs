//! Provision policy contract and built-in policies
//!
//! A provision policy turns a region's membership, essentials, and metrics
//! into an adjusted control knob. Policies are independently replaceable
//! units; the region only depends on the contract here and composes multiple
//! policies with priority-ordered fallback.

use super::{estimate_cpu_usage, PolicyContext, PolicyError};
use super::regulator::CpuRegulator;
use crate::config::AdminQosConfig;
use crate::cpuset::CpuSet;
use crate::models::{
    ControlKnob, ControlKnobName, ControlKnobValue, PodSet, RegionType, ResourceEssentials,
    POLICY_NAME_CANONICAL,
};
use std::collections::HashMap;
use tracing::warn;

/// One CPU provision estimator.
///
/// The owning region pushes membership and essentials before each update;
/// `update` failures are recoverable and handled by the region's fallback
/// protocol.
pub trait ProvisionPolicy: Send {
    fn name(&self) -> &str;

    fn set_pod_set(&mut self, pod_set: PodSet);

    fn set_essentials(&mut self, essentials: ResourceEssentials);

    fn set_binding_numas(&mut self, numas: CpuSet);

    /// Perform one estimation pass.
    fn update(&mut self) -> Result<(), PolicyError>;

    /// Pull the last computed, regulator-adjusted control knob.
    fn control_knob_adjusted(&self) -> Result<ControlKnob, PolicyError>;
}

/// Constructor for a provision policy: region context, global configuration,
/// an opaque extra-configuration payload, and the regulator the policy owns.
pub type ProvisionPolicyCtor = Box<
    dyn Fn(
            PolicyContext,
            &AdminQosConfig,
            Option<&serde_json::Value>,
            CpuRegulator,
        ) -> Box<dyn ProvisionPolicy>
        + Send
        + Sync,
>;

/// Name-keyed table of provision policy constructors, populated at startup.
pub struct ProvisionPolicyRegistry {
    ctors: HashMap<String, ProvisionPolicyCtor>,
}

impl ProvisionPolicyRegistry {
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in policies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            POLICY_NAME_CANONICAL,
            Box::new(|ctx, conf, extra, regulator| {
                Box::new(CanonicalProvisionPolicy::new(ctx, conf, extra, regulator))
            }),
        );
        registry
    }

    pub fn register(&mut self, name: &str, ctor: ProvisionPolicyCtor) {
        self.ctors.insert(name.to_string(), ctor);
    }

    /// Construct the named policy; `None` for unregistered names (the caller
    /// skips those with a warning, never fatally).
    pub fn construct(
        &self,
        name: &str,
        ctx: PolicyContext,
        conf: &AdminQosConfig,
        extra: Option<&serde_json::Value>,
        regulator: CpuRegulator,
    ) -> Option<Box<dyn ProvisionPolicy>> {
        self.ctors.get(name).map(|ctor| ctor(ctx, conf, extra, regulator))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }
}

impl Default for ProvisionPolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Request-based provision estimation.
///
/// Share regions require the estimated usage of their members plus the
/// region's allocate reserve; dedicated NUMA-exclusive regions require their
/// full upper bound, being sole occupants of their node. With reclaim
/// disabled a share region expands to its upper bound so no capacity is left
/// to reclaimable work.
pub struct CanonicalProvisionPolicy {
    ctx: PolicyContext,
    regulator: CpuRegulator,
    pod_set: PodSet,
    essentials: ResourceEssentials,
    binding_numas: CpuSet,
    knob: Option<ControlKnob>,
}

impl CanonicalProvisionPolicy {
    pub fn new(
        ctx: PolicyContext,
        _conf: &AdminQosConfig,
        _extra: Option<&serde_json::Value>,
        regulator: CpuRegulator,
    ) -> Self {
        Self {
            ctx,
            regulator,
            pod_set: PodSet::new(),
            essentials: ResourceEssentials::default(),
            binding_numas: CpuSet::new(),
            knob: None,
        }
    }
}

impl ProvisionPolicy for CanonicalProvisionPolicy {
    fn name(&self) -> &str {
        POLICY_NAME_CANONICAL
    }

    fn set_pod_set(&mut self, pod_set: PodSet) {
        self.pod_set = pod_set;
    }

    fn set_essentials(&mut self, essentials: ResourceEssentials) {
        self.essentials = essentials;
    }

    fn set_binding_numas(&mut self, numas: CpuSet) {
        self.binding_numas = numas;
    }

    fn update(&mut self) -> Result<(), PolicyError> {
        let requirement = match self.ctx.region_type {
            RegionType::Share => {
                if self.essentials.enable_reclaim {
                    let estimation = estimate_cpu_usage(
                        &self.pod_set,
                        self.ctx.store.as_ref(),
                        self.ctx.metrics.as_ref(),
                    );
                    estimation + self.essentials.reserved_for_allocate
                } else {
                    self.essentials.resource_upper_bound
                }
            }
            RegionType::DedicatedNumaExclusive => self.essentials.resource_upper_bound,
            RegionType::Empty => {
                return Err(PolicyError::InsufficientData(
                    "empty region carries no provisioned workload".to_string(),
                ))
            }
        };

        if self.binding_numas.is_empty() {
            warn!(
                region = %self.ctx.region_name,
                "updating provision for a region with no binding numa nodes"
            );
        }

        self.regulator.set_bounds(
            self.essentials.resource_lower_bound.round() as usize,
            self.ctx.topology.num_cpus(),
        );
        let adjusted = self.regulator.regulate(requirement);
        self.knob = Some(ControlKnob::from([(
            ControlKnobName::NonReclaimedCpusetSize,
            ControlKnobValue::new(adjusted as f64),
        )]));
        Ok(())
    }

    fn control_knob_adjusted(&self) -> Result<ControlKnob, PolicyError> {
        self.knob.clone().ok_or(PolicyError::NotUpdated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{CpuTopology, MetricsReader, NullMetricsReader};
    use crate::models::{ContainerRecord, QosLevel, POOL_NAME_SHARE};
    use crate::observability::AdvisorMetrics;
    use crate::store::{InMemoryStore, RecordStore};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn share_container(pod_uid: &str, cpu_request: f64) -> ContainerRecord {
        ContainerRecord {
            pod_uid: pod_uid.to_string(),
            pod_namespace: "default".to_string(),
            pod_name: format!("pod-{}", pod_uid),
            container_name: "c1".to_string(),
            container_index: 0,
            qos_level: QosLevel::SharedCores,
            cpu_request,
            memory_request: 0.0,
            owner_pool_name: POOL_NAME_SHARE.to_string(),
            numa_binding: false,
            topology_aware_assignments: BTreeMap::new(),
            original_topology_aware_assignments: BTreeMap::new(),
            region_names: BTreeSet::new(),
        }
    }

    fn policy_context(region_type: RegionType, store: Arc<InMemoryStore>) -> PolicyContext {
        PolicyContext {
            region_name: "share-share".to_string(),
            region_type,
            store,
            topology: Arc::new(CpuTopology::synthetic(96, 2).unwrap()),
            metrics: Arc::new(NullMetricsReader),
            emitter: AdvisorMetrics::new(),
        }
    }

    fn essentials(enable_reclaim: bool) -> ResourceEssentials {
        ResourceEssentials {
            enable_reclaim,
            resource_upper_bound: 90.0,
            resource_lower_bound: 4.0,
            reserved_for_allocate: 4.0,
        }
    }

    #[test]
    fn test_share_requirement_adds_allocate_reserve() {
        let store = Arc::new(InMemoryStore::new());
        store.set_container(share_container("uid1", 4.0));

        let conf = AdminQosConfig::default();
        let mut policy = CanonicalProvisionPolicy::new(
            policy_context(RegionType::Share, store),
            &conf,
            None,
            CpuRegulator::new(),
        );
        let mut pods = PodSet::new();
        pods.insert("uid1", "c1");
        policy.set_pod_set(pods);
        policy.set_essentials(essentials(true));
        policy.set_binding_numas(CpuSet::from_cores([0, 1]));

        policy.update().unwrap();
        let knob = policy.control_knob_adjusted().unwrap();
        assert_eq!(knob[&ControlKnobName::NonReclaimedCpusetSize].value, 8.0);
    }

    #[test]
    fn test_share_without_reclaim_expands_to_upper_bound() {
        let store = Arc::new(InMemoryStore::new());
        store.set_container(share_container("uid1", 4.0));

        let conf = AdminQosConfig::default();
        let mut policy = CanonicalProvisionPolicy::new(
            policy_context(RegionType::Share, store),
            &conf,
            None,
            CpuRegulator::new(),
        );
        let mut pods = PodSet::new();
        pods.insert("uid1", "c1");
        policy.set_pod_set(pods);
        policy.set_essentials(essentials(false));
        policy.set_binding_numas(CpuSet::from_cores([0, 1]));

        policy.update().unwrap();
        let knob = policy.control_knob_adjusted().unwrap();
        assert_eq!(knob[&ControlKnobName::NonReclaimedCpusetSize].value, 90.0);
    }

    #[test]
    fn test_metric_usage_overrides_request() {
        struct FixedUsage(f64);
        impl MetricsReader for FixedUsage {
            fn container_cpu_usage(&self, _pod_uid: &str, _container_name: &str) -> Option<f64> {
                Some(self.0)
            }
            fn node_cpu_usage(&self, _numa_node: usize) -> Option<f64> {
                None
            }
        }

        let store = Arc::new(InMemoryStore::new());
        store.set_container(share_container("uid1", 4.0));

        let conf = AdminQosConfig::default();
        let mut ctx = policy_context(RegionType::Share, store);
        ctx.metrics = Arc::new(FixedUsage(6.0));
        let mut policy = CanonicalProvisionPolicy::new(ctx, &conf, None, CpuRegulator::new());
        let mut pods = PodSet::new();
        pods.insert("uid1", "c1");
        policy.set_pod_set(pods);
        policy.set_essentials(essentials(true));
        policy.set_binding_numas(CpuSet::from_cores([0, 1]));

        policy.update().unwrap();
        let knob = policy.control_knob_adjusted().unwrap();
        assert_eq!(knob[&ControlKnobName::NonReclaimedCpusetSize].value, 10.0);
    }

    #[test]
    fn test_knob_unavailable_before_update() {
        let store = Arc::new(InMemoryStore::new());
        let conf = AdminQosConfig::default();
        let policy = CanonicalProvisionPolicy::new(
            policy_context(RegionType::Share, store),
            &conf,
            None,
            CpuRegulator::new(),
        );
        assert!(matches!(
            policy.control_knob_adjusted(),
            Err(PolicyError::NotUpdated)
        ));
    }

    #[test]
    fn test_registry_constructs_known_names_only() {
        let registry = ProvisionPolicyRegistry::with_defaults();
        assert!(registry.contains(POLICY_NAME_CANONICAL));
        assert!(!registry.contains("rama"));

        let store = Arc::new(InMemoryStore::new());
        let conf = AdminQosConfig::default();
        assert!(registry
            .construct(
                "rama",
                policy_context(RegionType::Share, store),
                &conf,
                None,
                CpuRegulator::new()
            )
            .is_none());
    }
}

//! Headroom policy contract and built-in policies
//!
//! A headroom policy estimates the spare CPU capacity a region can offer to
//! reclaimable work. Like provision policies, headroom policies are
//! replaceable units composed by the region with priority-ordered fallback.

use super::{estimate_cpu_usage, reserve_pool_cpus_on, PolicyContext, PolicyError};
use crate::config::AdminQosConfig;
use crate::cpuset::CpuSet;
use crate::models::{PodSet, RegionType, ResourceEssentials, POLICY_NAME_CANONICAL};
use std::collections::HashMap;

/// One CPU headroom estimator.
pub trait HeadroomPolicy: Send {
    fn name(&self) -> &str;

    fn set_pod_set(&mut self, pod_set: PodSet);

    fn set_essentials(&mut self, essentials: ResourceEssentials);

    fn set_binding_numas(&mut self, numas: CpuSet);

    /// Perform one estimation pass.
    fn update(&mut self) -> Result<(), PolicyError>;

    /// Pull the last computed headroom, in cores.
    fn headroom(&self) -> Result<f64, PolicyError>;
}

/// Constructor for a headroom policy: region context, global configuration,
/// and an opaque extra-configuration payload.
pub type HeadroomPolicyCtor = Box<
    dyn Fn(PolicyContext, &AdminQosConfig, Option<&serde_json::Value>) -> Box<dyn HeadroomPolicy>
        + Send
        + Sync,
>;

/// Name-keyed table of headroom policy constructors, populated at startup.
pub struct HeadroomPolicyRegistry {
    ctors: HashMap<String, HeadroomPolicyCtor>,
}

impl HeadroomPolicyRegistry {
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
            Box::new(|ctx, conf, extra| Box::new(CanonicalHeadroomPolicy::new(ctx, conf, extra))),
        );
        registry
    }

    pub fn register(&mut self, name: &str, ctor: HeadroomPolicyCtor) {
        self.ctors.insert(name.to_string(), ctor);
    }

    pub fn construct(
        &self,
        name: &str,
        ctx: PolicyContext,
        conf: &AdminQosConfig,
        extra: Option<&serde_json::Value>,
    ) -> Option<Box<dyn HeadroomPolicy>> {
        self.ctors.get(name).map(|ctor| ctor(ctx, conf, extra))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }
}

impl Default for HeadroomPolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Request-based headroom estimation.
///
/// Headroom is the capacity of the region's binding NUMA nodes minus the
/// reserve-pool cores on those nodes and the region's own non-reclaimed
/// requirement. With reclaim disabled nothing may be offered and headroom is
/// zero.
pub struct CanonicalHeadroomPolicy {
    ctx: PolicyContext,
    pod_set: PodSet,
    essentials: ResourceEssentials,
    binding_numas: CpuSet,
    headroom: Option<f64>,
}

impl CanonicalHeadroomPolicy {
    pub fn new(
        ctx: PolicyContext,
        _conf: &AdminQosConfig,
        _extra: Option<&serde_json::Value>,
    ) -> Self {
        Self {
            ctx,
            pod_set: PodSet::new(),
            essentials: ResourceEssentials::default(),
            binding_numas: CpuSet::new(),
            headroom: None,
        }
    }
}

impl HeadroomPolicy for CanonicalHeadroomPolicy {
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
        if !self.essentials.enable_reclaim {
            self.headroom = Some(0.0);
            return Ok(());
        }

        let requirement = match self.ctx.region_type {
            RegionType::Share => {
                estimate_cpu_usage(
                    &self.pod_set,
                    self.ctx.store.as_ref(),
                    self.ctx.metrics.as_ref(),
                ) + self.essentials.reserved_for_allocate
            }
            RegionType::DedicatedNumaExclusive => self.essentials.resource_upper_bound,
            RegionType::Empty => 0.0,
        };

        let capacity = self.ctx.topology.cpus_on_nodes(&self.binding_numas) as f64;
        let reserve = reserve_pool_cpus_on(self.ctx.store.as_ref(), &self.binding_numas) as f64;
        self.headroom = Some((capacity - reserve - requirement).max(0.0));
        Ok(())
    }

    fn headroom(&self) -> Result<f64, PolicyError> {
        self.headroom.ok_or(PolicyError::NotUpdated)
    }
}

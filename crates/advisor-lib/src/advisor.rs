//! CPU resource advisor loop
//!
//! The advisor is the sole owner of the live region set. Each cycle it reads
//! a snapshot of container and pool records, rebuilds region membership,
//! drives every region's policy updates, folds the per-region control knobs
//! into one per-pool-per-NUMA-node allocation table, and answers the
//! enforcement consumer over a single-slot handshake: one recompute signal
//! in, exactly one allocation table out, nothing buffered in between.

use crate::config::AdminQosConfig;
use crate::cpuset::CpuSet;
use crate::machine::{CpuTopology, MetricsReader};
use crate::models::{
    ContainerRecord, ControlKnobName, InternalCalculationResult, PoolRecord, QosLevel,
    RegionRecord, RegionType, ResourceEssentials, NUMA_ID_AGGREGATE, POOL_NAME_RECLAIM,
    POOL_NAME_RESERVE, POOL_NAME_SHARE,
};
use crate::observability::AdvisorMetrics;
use crate::region::{reserve_pool_cpus_on, PolicyRegistries, Region, RegionDeps, RegionError};
use crate::store::RecordStore;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Failure of an advisor query.
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor is still in its warm-up period")]
    WarmingUp,
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Consumer side of the advisor handshake.
///
/// The protocol is send-then-receive: push one recompute signal, then block
/// for the single allocation table answering it. Both channels hold at most
/// one message, so at most one computation is ever outstanding and responses
/// arrive in signal order.
pub struct AdvisorHandle {
    pub signal_tx: mpsc::Sender<()>,
    pub result_rx: mpsc::Receiver<InternalCalculationResult>,
}

/// Top-level control loop producing allocation decisions and headroom.
pub struct CpuResourceAdvisor {
    conf: Arc<RwLock<AdminQosConfig>>,
    extra: Option<serde_json::Value>,
    deps: RegionDeps,
    registries: PolicyRegistries,
    regions: RwLock<BTreeMap<String, Arc<Region>>>,
    start_time: Mutex<Instant>,
    signal_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    result_tx: mpsc::Sender<InternalCalculationResult>,
}

impl CpuResourceAdvisor {
    pub fn new(
        conf: Arc<RwLock<AdminQosConfig>>,
        extra: Option<serde_json::Value>,
        store: Arc<dyn RecordStore>,
        topology: Arc<CpuTopology>,
        metrics: Arc<dyn MetricsReader>,
        emitter: AdvisorMetrics,
        registries: PolicyRegistries,
    ) -> (Self, AdvisorHandle) {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(1);

        let advisor = Self {
            conf,
            extra,
            deps: RegionDeps {
                store,
                topology,
                metrics,
                emitter,
            },
            registries,
            regions: RwLock::new(BTreeMap::new()),
            start_time: Mutex::new(Instant::now()),
            signal_rx: tokio::sync::Mutex::new(signal_rx),
            result_tx,
        };
        (
            advisor,
            AdvisorHandle {
                signal_tx,
                result_rx,
            },
        )
    }

    /// Run the advisor loop until shutdown.
    ///
    /// The loop suspends only while waiting for the next recompute signal
    /// and while delivering the single result answering it. A signal that
    /// arrives concurrently with shutdown may be dropped; the consumer must
    /// tolerate a missed response at shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut signal_rx = match self.signal_rx.try_lock() {
            Ok(rx) => rx,
            Err(_) => {
                warn!("advisor loop is already running, refusing second start");
                return;
            }
        };
        info!("Starting cpu advisor loop");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down cpu advisor loop");
                    break;
                }
                signal = signal_rx.recv() => {
                    if signal.is_none() {
                        info!("Consumer signal channel closed, stopping advisor loop");
                        break;
                    }
                    let result = self.update();
                    tokio::select! {
                        sent = self.result_tx.send(result) => {
                            if sent.is_err() {
                                info!("Consumer result channel closed, stopping advisor loop");
                                break;
                            }
                        }
                        _ = shutdown.recv() => {
                            info!("Shutdown while delivering result, abandoning in-flight answer");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Aggregate spare capacity for reclaimable work: the sum of every live
    /// region's current headroom. Callable independently of the cycle, e.g.
    /// from a metrics scrape.
    pub fn get_headroom(&self) -> Result<f64, AdvisorError> {
        if self.in_warmup() {
            return Err(AdvisorError::WarmingUp);
        }
        let regions = self.read_regions();
        let mut total = 0.0;
        for region in regions.values() {
            total += region.get_headroom()?;
        }
        let total = total.max(0.0);
        self.deps.emitter.set_headroom(total);
        Ok(total)
    }

    fn conf_snapshot(&self) -> AdminQosConfig {
        self.conf
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn read_regions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Region>>> {
        self.regions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_warmup(&self) -> bool {
        let grace = Duration::from_secs(self.conf_snapshot().cpu_advisor.startup_grace_secs);
        let start = *self
            .start_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        start.elapsed() < grace
    }

    /// Compute one cycle. Never fails: a failed cycle yields the best-effort
    /// (possibly empty) table rather than an error, because the consumer
    /// must receive exactly one answer per signal.
    fn update(&self) -> InternalCalculationResult {
        let started = Instant::now();
        let conf = self.conf_snapshot();

        if self.in_warmup() {
            debug!("advisor warming up, answering with empty result");
            return InternalCalculationResult::default();
        }

        let Some(reserve_pool) = self.deps.store.get_pool(POOL_NAME_RESERVE) else {
            warn!("reserve pool missing from record store, answering with empty result");
            return InternalCalculationResult::default();
        };
        let containers = self.deps.store.list_containers();

        let regions = self.reconcile_regions(&conf, &containers);
        self.push_essentials_and_update(&conf, &regions);
        let result = self.assemble(&conf, &reserve_pool, &regions);
        self.persist_region_records(&regions);

        let elapsed = started.elapsed();
        self.deps
            .emitter
            .observe_cycle_latency(elapsed.as_secs_f64());
        for (pool, entries) in &result.pool_entries {
            let total: usize = entries.values().sum();
            self.deps.emitter.set_pool_allocation(pool, total as i64);
        }
        debug!(
            regions = regions.len(),
            pools = result.pool_entries.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "provisioning cycle completed"
        );
        result
    }

    /// Rebuild region membership from current container records.
    ///
    /// Regions are looked up first by a container's recorded region names so
    /// ownership survives restarts, falling back to deterministic creation.
    /// Regions that became uninhabited are dropped, along with their
    /// persisted summaries.
    fn reconcile_regions(
        &self,
        conf: &AdminQosConfig,
        containers: &[ContainerRecord],
    ) -> BTreeMap<String, Arc<Region>> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        for region in regions.values() {
            region.clear();
        }

        let mut live: BTreeMap<String, Arc<Region>> = BTreeMap::new();
        for record in containers {
            let assigned = match record.qos_level {
                QosLevel::SharedCores => {
                    self.assign_share_container(conf, &regions, &mut live, record)
                }
                QosLevel::DedicatedCores if record.is_numa_binding() => {
                    self.assign_dedicated_container(conf, &regions, &mut live, record)
                }
                // Reclaimed and system cores are not provisioned through regions
                _ => continue,
            };

            if assigned != record.region_names {
                let mut updated = record.clone();
                updated.region_names = assigned;
                self.deps.store.set_container(updated);
            }
        }

        // Share regions spread over every NUMA node not claimed exclusively
        let all_numas = self.deps.topology.numa_nodes();
        let dedicated_numas = live
            .values()
            .filter(|region| region.region_type() == RegionType::DedicatedNumaExclusive)
            .fold(CpuSet::new(), |acc, region| {
                acc.union(&region.binding_numas())
            });
        let shared_numas = all_numas.difference(&dedicated_numas);
        let has_share_regions = live
            .values()
            .any(|region| region.region_type() == RegionType::Share);
        for region in live.values() {
            if region.region_type() == RegionType::Share {
                region.set_binding_numas(shared_numas.clone());
            }
        }

        // Idle NUMA nodes get empty wrapper regions so aggregation has a
        // uniform unit for their capacity
        if !has_share_regions {
            for numa in shared_numas.iter() {
                let name = format!("empty-{}", numa);
                let region = regions
                    .get(&name)
                    .filter(|region| region.region_type() == RegionType::Empty)
                    .cloned()
                    .unwrap_or_else(|| {
                        Arc::new(self.create_region(
                            conf,
                            &name,
                            "",
                            RegionType::Empty,
                            CpuSet::from_cores([numa]),
                        ))
                    });
                live.insert(name, region);
            }
        }

        for (name, region) in regions.iter() {
            if !live.contains_key(name) {
                info!(
                    region = %name,
                    region_type = %region.region_type(),
                    "region became uninhabited, dropping"
                );
                self.deps.store.remove_region(name);
            }
        }

        let mut counts: BTreeMap<RegionType, i64> = BTreeMap::new();
        for region in live.values() {
            *counts.entry(region.region_type()).or_default() += 1;
        }
        for region_type in [
            RegionType::Share,
            RegionType::DedicatedNumaExclusive,
            RegionType::Empty,
        ] {
            self.deps.emitter.set_region_count(
                &region_type.to_string(),
                counts.get(&region_type).copied().unwrap_or(0),
            );
        }

        *regions = live.clone();
        live
    }

    fn assign_share_container(
        &self,
        conf: &AdminQosConfig,
        previous: &BTreeMap<String, Arc<Region>>,
        live: &mut BTreeMap<String, Arc<Region>>,
        record: &ContainerRecord,
    ) -> std::collections::BTreeSet<String> {
        let owner_pool = if record.owner_pool_name.is_empty() {
            POOL_NAME_SHARE
        } else {
            record.owner_pool_name.as_str()
        };
        let name = self
            .recorded_share_region(record)
            .unwrap_or_else(|| format!("share-{}", owner_pool));

        let region = live
            .entry(name.clone())
            .or_insert_with(|| {
                previous
                    .get(&name)
                    .filter(|region| region.region_type() == RegionType::Share)
                    .cloned()
                    .unwrap_or_else(|| {
                        Arc::new(self.create_region(
                            conf,
                            &name,
                            owner_pool,
                            RegionType::Share,
                            CpuSet::new(),
                        ))
                    })
            })
            .clone();
        if let Err(err) = region.add_container(Some(record)) {
            warn!(
                pod_uid = %record.pod_uid,
                container = %record.container_name,
                error = %err,
                "failed to add container to share region"
            );
        }
        std::collections::BTreeSet::from([name])
    }

    fn assign_dedicated_container(
        &self,
        conf: &AdminQosConfig,
        previous: &BTreeMap<String, Arc<Region>>,
        live: &mut BTreeMap<String, Arc<Region>>,
        record: &ContainerRecord,
    ) -> std::collections::BTreeSet<String> {
        let mut assigned = std::collections::BTreeSet::new();
        // One region per NUMA node the workload is bound to
        for numa in record.topology_aware_assignments.keys().copied() {
            let name = self
                .recorded_dedicated_region(record, numa)
                .unwrap_or_else(|| {
                    format!("dedicated-numa-exclusive-{}-{}", record.pod_uid, numa)
                });
            let region = live
                .entry(name.clone())
                .or_insert_with(|| {
                    previous
                        .get(&name)
                        .filter(|region| {
                            region.region_type() == RegionType::DedicatedNumaExclusive
                        })
                        .cloned()
                        .unwrap_or_else(|| {
                            Arc::new(self.create_region(
                                conf,
                                &name,
                                &record.owner_pool_name,
                                RegionType::DedicatedNumaExclusive,
                                CpuSet::from_cores([numa]),
                            ))
                        })
                })
                .clone();
            if let Err(err) = region.add_container(Some(record)) {
                warn!(
                    pod_uid = %record.pod_uid,
                    container = %record.container_name,
                    error = %err,
                    "failed to add container to dedicated region"
                );
            }
            assigned.insert(name);
        }
        assigned
    }

    fn create_region(
        &self,
        conf: &AdminQosConfig,
        name: &str,
        owner_pool: &str,
        region_type: RegionType,
        binding_numas: CpuSet,
    ) -> Region {
        info!(
            region = %name,
            region_type = %region_type,
            owner_pool = %owner_pool,
            "region created"
        );
        Region::new(
            name,
            owner_pool,
            region_type,
            binding_numas,
            conf,
            self.extra.as_ref(),
            &self.deps,
            &self.registries,
        )
    }

    fn recorded_share_region(&self, record: &ContainerRecord) -> Option<String> {
        if record.region_names.len() != 1 {
            return None;
        }
        let name = record.region_names.iter().next()?.clone();
        let info = self.deps.store.get_region(&name)?;
        (info.region_type == RegionType::Share).then_some(name)
    }

    fn recorded_dedicated_region(&self, record: &ContainerRecord, numa: usize) -> Option<String> {
        for name in &record.region_names {
            if let Some(info) = self.deps.store.get_region(name) {
                if info.region_type == RegionType::DedicatedNumaExclusive
                    && info.binding_numas == CpuSet::from_cores([numa])
                {
                    return Some(name.clone());
                }
            }
        }
        None
    }

    /// Propagate the reclaim flag, bounds, and reserve shares into every
    /// region, then refresh both policy chains.
    fn push_essentials_and_update(
        &self,
        conf: &AdminQosConfig,
        regions: &BTreeMap<String, Arc<Region>>,
    ) {
        let topology = &self.deps.topology;
        let numa_count = topology.num_numa_nodes().max(1) as f64;
        let alloc_per_numa = conf.reclaim.reserved_cpus_for_allocate / numa_count;
        let reclaim_per_numa = conf.reclaim.reserved_cpus_for_reclaim / numa_count;
        let share_region_count = regions
            .values()
            .filter(|region| region.region_type() == RegionType::Share)
            .count()
            .max(1) as f64;

        for region in regions.values() {
            let numas = region.binding_numas();
            let capacity = topology.cpus_on_nodes(&numas) as f64;
            let reserve_on = reserve_pool_cpus_on(self.deps.store.as_ref(), &numas) as f64;
            let numa_share = numas.size() as f64;

            let essentials = match region.region_type() {
                RegionType::Share => ResourceEssentials {
                    enable_reclaim: conf.reclaim.enable_reclaim,
                    resource_upper_bound: capacity - reserve_on - reclaim_per_numa * numa_share,
                    resource_lower_bound: conf.cpu_advisor.min_share_cpus,
                    reserved_for_allocate: alloc_per_numa * numa_share / share_region_count,
                },
                RegionType::DedicatedNumaExclusive => ResourceEssentials {
                    enable_reclaim: conf.reclaim.enable_reclaim,
                    resource_upper_bound: capacity - reserve_on - reclaim_per_numa * numa_share,
                    resource_lower_bound: 0.0,
                    reserved_for_allocate: alloc_per_numa * numa_share,
                },
                RegionType::Empty => ResourceEssentials {
                    enable_reclaim: conf.reclaim.enable_reclaim,
                    resource_upper_bound: capacity - reserve_on,
                    resource_lower_bound: 0.0,
                    reserved_for_allocate: 0.0,
                },
            };
            region.set_essentials(essentials);
            region.try_update_provision();
            region.try_update_headroom();
        }
    }

    /// Fold per-region control knobs into the final allocation table.
    ///
    /// The reserve pool keeps its static cores; share pools receive their
    /// fitted knob values; every core on shared NUMA nodes not claimed by
    /// reserve or share falls to the reclaim pool, plus the per-node
    /// leftover of each dedicated-exclusive node.
    fn assemble(
        &self,
        conf: &AdminQosConfig,
        reserve_pool: &PoolRecord,
        regions: &BTreeMap<String, Arc<Region>>,
    ) -> InternalCalculationResult {
        let topology = &self.deps.topology;
        let numa_count = topology.num_numa_nodes().max(1) as f64;
        let reclaim_per_numa = conf.reclaim.reserved_cpus_for_reclaim / numa_count;

        let mut share_requirements: Vec<(String, f64)> = Vec::new();
        let mut dedicated_leftovers: BTreeMap<i64, usize> = BTreeMap::new();
        let mut dedicated_numas = CpuSet::new();

        for region in regions.values() {
            match region.region_type() {
                RegionType::Share => match region.get_provision() {
                    Ok(knob) => {
                        let Some(size) = knob.get(&ControlKnobName::NonReclaimedCpusetSize)
                        else {
                            warn!(
                                region = %region.name(),
                                "provision knob lacks non-reclaimed cpuset size, skipped"
                            );
                            continue;
                        };
                        share_requirements
                            .push((region.owner_pool_name().to_string(), size.value));
                    }
                    Err(err) => {
                        self.deps
                            .emitter
                            .inc_policy_update_failure(region.name(), "provision");
                        warn!(
                            region = %region.name(),
                            error = %err,
                            "region contributes nothing to provisioning this cycle"
                        );
                    }
                },
                RegionType::DedicatedNumaExclusive => {
                    let numas = region.binding_numas();
                    dedicated_numas = dedicated_numas.union(&numas);
                    match region.get_provision() {
                        Ok(knob) => {
                            let Some(size) = knob.get(&ControlKnobName::NonReclaimedCpusetSize)
                            else {
                                warn!(
                                    region = %region.name(),
                                    "provision knob lacks non-reclaimed cpuset size, skipped"
                                );
                                continue;
                            };
                            for numa in numas.iter() {
                                let node_capacity = topology.cpus_per_node(numa);
                                let reserve_on = reserve_pool.cpus_on_node(numa);
                                let leftover = (node_capacity as f64
                                    - reserve_on as f64
                                    - size.value)
                                    .max(0.0)
                                    .round() as usize;
                                dedicated_leftovers.insert(numa as i64, leftover);
                            }
                        }
                        Err(err) => {
                            self.deps
                                .emitter
                                .inc_policy_update_failure(region.name(), "provision");
                            warn!(
                                region = %region.name(),
                                error = %err,
                                "dedicated region contributes nothing this cycle"
                            );
                        }
                    }
                }
                RegionType::Empty => {}
            }
        }

        let mut result = InternalCalculationResult::default();
        result.set_pool_entry(POOL_NAME_RESERVE, NUMA_ID_AGGREGATE, reserve_pool.cpu_count());

        let shared_numas = topology.numa_nodes().difference(&dedicated_numas);
        let shared_capacity: usize = shared_numas
            .iter()
            .map(|numa| {
                topology
                    .cpus_per_node(numa)
                    .saturating_sub(reserve_pool.cpus_on_node(numa))
            })
            .sum();
        let available_share =
            shared_capacity as f64 - reclaim_per_numa * shared_numas.size() as f64;

        let fitted = fit_share_requirements(&share_requirements, available_share);
        let mut share_total = 0usize;
        for ((pool, _), size) in share_requirements.iter().zip(fitted.iter()) {
            result.set_pool_entry(pool, NUMA_ID_AGGREGATE, *size);
            share_total += size;
        }

        for (numa, leftover) in &dedicated_leftovers {
            result.set_pool_entry(POOL_NAME_RECLAIM, *numa, *leftover);
        }
        result.set_pool_entry(
            POOL_NAME_RECLAIM,
            NUMA_ID_AGGREGATE,
            shared_capacity.saturating_sub(share_total),
        );
        result
    }

    /// Write each region's summary back to the store so ownership can be
    /// reconstructed after a restart.
    fn persist_region_records(&self, regions: &BTreeMap<String, Arc<Region>>) {
        for (name, region) in regions {
            let headroom = region.get_headroom().unwrap_or(0.0);
            let knob = region.get_provision().unwrap_or_default();
            let (provision_top, provision_in_use) = region.provision_policy_names();
            let (headroom_top, headroom_in_use) = region.headroom_policy_names();
            self.deps.store.set_region(
                name,
                RegionRecord {
                    region_type: region.region_type(),
                    binding_numas: region.binding_numas(),
                    headroom,
                    headroom_policy_top_priority: headroom_top,
                    headroom_policy_in_use: headroom_in_use,
                    control_knob_map: knob,
                    provision_policy_top_priority: provision_top,
                    provision_policy_in_use: provision_in_use,
                },
            );
        }
    }
}

/// Fit share-pool requirements into the capacity available to them: when
/// demand exceeds supply every pool is squeezed proportionally, otherwise
/// requirements are taken as-is (rounded).
fn fit_share_requirements(requirements: &[(String, f64)], available: f64) -> Vec<usize> {
    let total: f64 = requirements.iter().map(|(_, value)| value).sum();
    if total <= 0.0 {
        return vec![0; requirements.len()];
    }
    if total <= available {
        return requirements
            .iter()
            .map(|(_, value)| value.round().max(0.0) as usize)
            .collect();
    }

    let budget = available.max(0.0).floor() as usize;
    let scale = budget as f64 / total;
    let mut fitted: Vec<usize> = requirements
        .iter()
        .map(|(_, value)| (value * scale).round() as usize)
        .collect();

    // Settle integer rounding drift on the largest entry
    let drift = budget as i64 - fitted.iter().sum::<usize>() as i64;
    if drift != 0 {
        if let Some(largest) = (0..fitted.len())
            .max_by(|&a, &b| fitted[a].cmp(&fitted[b]))
        {
            fitted[largest] = (fitted[largest] as i64 + drift).max(0) as usize;
        }
    }
    fitted
}

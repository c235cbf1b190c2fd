//! Record store boundary
//!
//! The advisor treats pod/container/pool/region records as a read-mostly
//! external store: it reads a snapshot of containers and pools at the start
//! of each cycle and writes region summaries back at the end. The concrete
//! storage format lives behind [`RecordStore`]; the in-memory implementation
//! here backs tests and single-process deployments.

use crate::models::{ContainerRecord, PoolRecord, RegionRecord};
use dashmap::DashMap;

/// Source of truth for membership, sink for region-summary persistence.
pub trait RecordStore: Send + Sync {
    fn get_container(&self, pod_uid: &str, container_name: &str) -> Option<ContainerRecord>;
    fn list_containers(&self) -> Vec<ContainerRecord>;
    fn set_container(&self, record: ContainerRecord);
    fn remove_container(&self, pod_uid: &str, container_name: &str);

    fn get_pool(&self, pool_name: &str) -> Option<PoolRecord>;
    fn list_pools(&self) -> Vec<PoolRecord>;
    fn set_pool(&self, record: PoolRecord);

    fn get_region(&self, region_name: &str) -> Option<RegionRecord>;
    fn list_regions(&self) -> Vec<(String, RegionRecord)>;
    fn set_region(&self, region_name: &str, record: RegionRecord);
    fn remove_region(&self, region_name: &str);
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    containers: DashMap<(String, String), ContainerRecord>,
    pools: DashMap<String, PoolRecord>,
    regions: DashMap<String, RegionRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryStore {
    fn get_container(&self, pod_uid: &str, container_name: &str) -> Option<ContainerRecord> {
        self.containers
            .get(&(pod_uid.to_string(), container_name.to_string()))
            .map(|entry| entry.value().clone())
    }

    fn list_containers(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> = self
            .containers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        // Deterministic iteration order keeps reconciliation stable
        records.sort_by(|a, b| {
            (&a.pod_uid, &a.container_name).cmp(&(&b.pod_uid, &b.container_name))
        });
        records
    }

    fn set_container(&self, record: ContainerRecord) {
        let key = (record.pod_uid.clone(), record.container_name.clone());
        self.containers.insert(key, record);
    }

    fn remove_container(&self, pod_uid: &str, container_name: &str) {
        self.containers
            .remove(&(pod_uid.to_string(), container_name.to_string()));
    }

    fn get_pool(&self, pool_name: &str) -> Option<PoolRecord> {
        self.pools.get(pool_name).map(|entry| entry.value().clone())
    }

    fn list_pools(&self) -> Vec<PoolRecord> {
        let mut records: Vec<PoolRecord> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.pool_name.cmp(&b.pool_name));
        records
    }

    fn set_pool(&self, record: PoolRecord) {
        self.pools.insert(record.pool_name.clone(), record);
    }

    fn get_region(&self, region_name: &str) -> Option<RegionRecord> {
        self.regions
            .get(region_name)
            .map(|entry| entry.value().clone())
    }

    fn list_regions(&self) -> Vec<(String, RegionRecord)> {
        let mut records: Vec<(String, RegionRecord)> = self
            .regions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    fn set_region(&self, region_name: &str, record: RegionRecord) {
        self.regions.insert(region_name.to_string(), record);
    }

    fn remove_region(&self, region_name: &str) {
        self.regions.remove(region_name);
    }
}

//! Advisor library for node-local CPU provisioning
//!
//! This crate provides the core functionality for:
//! - Grouping containers into allocation regions
//! - Priority-ordered provision and headroom policy chains
//! - The advisor loop folding regions into per-pool allocation tables
//! - Health checks and observability

pub mod advisor;
pub mod config;
pub mod cpuset;
pub mod health;
pub mod machine;
pub mod models;
pub mod observability;
pub mod region;
pub mod store;

pub use advisor::{AdvisorError, AdvisorHandle, CpuResourceAdvisor};
pub use config::{AdminQosConfig, AdminQosPatch};
pub use cpuset::CpuSet;
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use machine::{CpuTopology, MetricsReader, NullMetricsReader};
pub use models::*;
pub use observability::{AdvisorLogger, AdvisorMetrics};
pub use region::{PolicyRegistries, Region};
pub use store::{InMemoryStore, RecordStore};

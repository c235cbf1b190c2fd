//! Health tracking for the advisor agent
//!
//! Component health feeds the liveness and readiness probes exposed by the
//! binary. The advisor loop reports itself degraded when regions keep
//! falling back and unhealthy when it can no longer answer the consumer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Experiencing issues but still operational
    Degraded,
    Unhealthy,
}

/// Last reported health of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_timestamp: i64,
}

impl ComponentHealth {
    pub fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_transition_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Aggregated health over all registered components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

/// Readiness of the agent as a whole
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names tracked by the agent
pub mod components {
    pub const ADVISOR: &str = "advisor";
    pub const RECORD_STORE: &str = "record_store";
    pub const CONSUMER_BRIDGE: &str = "consumer_bridge";
}

/// Registry of component health, shared across tasks.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component, initially healthy.
    pub async fn register(&self, name: &str) {
        self.report(name, ComponentStatus::Healthy, None).await;
    }

    /// Report a component's current status.
    pub async fn report(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::new(status, message));
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Aggregate health: unhealthy dominates, then degraded.
    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let mut status = ComponentStatus::Healthy;
        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => {
                    status = ComponentStatus::Unhealthy;
                    break;
                }
                ComponentStatus::Degraded => status = ComponentStatus::Degraded,
                ComponentStatus::Healthy => {}
            }
        }
        HealthResponse { status, components }
    }

    /// Ready only after initialization and while no component is unhealthy.
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("Agent not yet initialized".to_string()),
            };
        }
        if self.health().await.status == ComponentStatus::Unhealthy {
            return ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            };
        }
        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}

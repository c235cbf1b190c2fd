//! CPU QoS Advisor - node-local CPU provisioning agent
//!
//! This binary runs on each node, continuously recomputing how much CPU
//! capacity each workload pool is entitled to and handing the allocation to
//! the enforcement layer, together with a spare-capacity estimate for
//! reclaimable work.

use advisor_lib::{
    health::{components, ComponentStatus, HealthRegistry},
    models::POOL_NAME_RECLAIM,
    observability::{AdvisorLogger, AdvisorMetrics},
    AdvisorHandle, CpuResourceAdvisor, InMemoryStore, NullMetricsReader, PolicyRegistries,
};
use anyhow::Result;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting cpu-qos-advisor");

    // Load configuration
    let agent_config = config::AgentConfig::load()?;
    let topology = Arc::new(agent_config.cpu_topology()?);
    info!(
        node_name = %agent_config.node_name,
        numa_nodes = topology.num_numa_nodes(),
        cpus = topology.num_cpus(),
        "Agent configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::ADVISOR).await;
    health_registry.register(components::RECORD_STORE).await;
    health_registry.register(components::CONSUMER_BRIDGE).await;

    // Initialize metrics and structured logger
    let metrics = AdvisorMetrics::new();
    let logger = AdvisorLogger::new(&agent_config.node_name);
    logger.log_startup(AGENT_VERSION);

    // Wire the advisor: the record store is fed by the enforcement layer,
    // the metrics reader by the discovery layer; both attach here.
    let store = Arc::new(InMemoryStore::new());
    let admin_qos = Arc::new(RwLock::new(agent_config.admin_qos()));
    let (advisor, handle) = CpuResourceAdvisor::new(
        admin_qos,
        None,
        store,
        topology,
        Arc::new(NullMetricsReader),
        metrics.clone(),
        PolicyRegistries::with_defaults(),
    );
    let advisor = Arc::new(advisor);

    let (shutdown_tx, _) = broadcast::channel(1);
    let advisor_task = tokio::spawn(advisor.clone().run(shutdown_tx.subscribe()));
    let bridge_task = tokio::spawn(run_consumer_bridge(
        handle,
        advisor.clone(),
        Duration::from_secs(agent_config.recompute_interval_secs),
        logger.clone(),
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));

    // Create shared application state and mark the agent ready
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    health_registry.set_ready(true).await;

    // Start health and metrics server
    let api_task = tokio::spawn(api::serve(agent_config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());
    let _ = advisor_task.await;
    let _ = bridge_task.await;
    api_task.abort();

    Ok(())
}

/// Drive the advisor handshake on behalf of the enforcement consumer.
///
/// A real enforcement plugin attaches at [`AdvisorHandle`]; this bridge keeps
/// the send-then-receive protocol (one signal, one answer) and surfaces the
/// results through logs and metrics.
async fn run_consumer_bridge(
    mut handle: AdvisorHandle,
    advisor: Arc<CpuResourceAdvisor>,
    interval: Duration,
    logger: AdvisorLogger,
    health_registry: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if handle.signal_tx.send(()).await.is_err() {
                    health_registry
                        .report(
                            components::ADVISOR,
                            ComponentStatus::Unhealthy,
                            Some("advisor loop gone".to_string()),
                        )
                        .await;
                    break;
                }
                let Some(result) = handle.result_rx.recv().await else {
                    health_registry
                        .report(
                            components::ADVISOR,
                            ComponentStatus::Unhealthy,
                            Some("advisor stopped answering".to_string()),
                        )
                        .await;
                    break;
                };

                let reclaim_cpus = result
                    .pool_entries
                    .get(POOL_NAME_RECLAIM)
                    .map(|entries| entries.values().sum())
                    .unwrap_or(0);
                logger.log_allocation_received(result.pool_entries.len(), reclaim_cpus);

                match advisor.get_headroom() {
                    Ok(headroom) => logger.log_headroom(headroom),
                    Err(err) => logger.log_headroom_unavailable(&err.to_string()),
                }
                health_registry
                    .report(components::CONSUMER_BRIDGE, ComponentStatus::Healthy, None)
                    .await;
            }
            _ = shutdown.recv() => {
                info!("Shutting down consumer bridge");
                break;
            }
        }
    }
}

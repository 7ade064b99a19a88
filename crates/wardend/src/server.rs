//! HTTP server for wardend

use crate::config::NodeConfig;
use crate::health::HealthMonitor;
use crate::network::{CrossNodeCoordinator, FleetMetrics};
use crate::predictor::PredictiveFailureAnalyzer;
use crate::recovery::RecoveryOrchestrator;
use crate::registry::AgentRegistry;
use crate::routes;
use crate::scheduler::Schedule;
use crate::storage::MetricsStore;
use crate::supervisor::BreakerTable;
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub node: NodeConfig,
    pub registry: Arc<AgentRegistry>,
    /// Managed agents only
    pub schedule: Arc<Schedule>,
    pub monitor: HealthMonitor,
    pub breakers: Arc<BreakerTable>,
    pub analyzer: Arc<PredictiveFailureAnalyzer>,
    pub recovery: Arc<RecoveryOrchestrator>,
    pub coordinator: Arc<CrossNodeCoordinator>,
    pub store: Arc<MetricsStore>,
    pub metrics: Arc<FleetMetrics>,
    pub start_time: Instant,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn managed_names(&self) -> Vec<String> {
        self.schedule.ordered_agents().iter().map(|a| a.name.clone()).collect()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::peer_routes())
        .merge(routes::fleet_routes())
        .merge(routes::recovery_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind the API listener. Failure here is fatal at startup.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP API on {}", addr))?;
    info!("Listening on http://{}", addr);
    Ok(listener)
}

/// Serve the API until `shutdown` flips
pub async fn run(
    state: Arc<AppState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("HTTP server failed")?;
    Ok(())
}

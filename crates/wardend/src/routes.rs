//! API routes for wardend

use crate::error::WardenError;
use crate::server::AppState;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use warden_common::{
    AgentView, AgentsResponse, Alert, AlertSeverity, AlertsResponse, BreakersResponse,
    CircuitState, ErrorResponse, HealthResponse, HealthStatus, RecoveryHistoryResponse,
    RecoveryTier, RecoveryTrigger, StatusResponse, SyncHistoryResponse, SyncRequest,
    SyncResponse, TriggerRecoveryRequest, TriggerRecoveryResponse,
};

type AppStateArc = Arc<AppState>;
type ApiError = (StatusCode, Json<ErrorResponse>);

const DEFAULT_HISTORY_LIMIT: usize = 50;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        let status = match &err {
            WardenError::UnknownAgent(_) => StatusCode::NOT_FOUND,
            WardenError::Sync(_) | WardenError::Configuration(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        api_error(status, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

impl HistoryQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(1000)
    }
}

// ============================================================================
// Peer Routes
// ============================================================================

pub fn peer_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/sync_from_peer", post(sync_from_peer))
        .route("/metrics", get(metrics))
}

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    let peer = state.coordinator.state().await;
    Json(HealthResponse {
        status: "healthy".to_string(),
        role: state.node.role.clone(),
        environment: state.node.environment.clone(),
        peer_hub_status: peer.peer_status,
        failover_active: peer.failover_active,
        monitored_agents: state.schedule.ordered_agents().len(),
        uptime_seconds: state.uptime_seconds(),
    })
}

async fn sync_from_peer(
    State(state): State<AppStateArc>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let received = state.coordinator.receive(&req).map_err(|e| {
        warn!(source = %req.source_hub, "Rejected peer metrics: {}", e);
        ApiError::from(e)
    })?;
    info!(source = %req.source_hub, received, "Accepted peer metrics");
    Ok(Json(SyncResponse {
        status: "success".to_string(),
        metrics_received: received,
    }))
}

async fn metrics(State(state): State<AppStateArc>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(),
    )
}

// ============================================================================
// Fleet Routes
// ============================================================================

pub fn fleet_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/v1/agents", get(agents))
        .route("/api/v1/status", get(status))
        .route("/api/v1/alerts", get(alerts))
        .route("/api/v1/breakers", get(breakers))
        .route("/api/v1/sync/history", get(sync_history))
}

async fn agents(State(state): State<AppStateArc>) -> Json<AgentsResponse> {
    let mut agents = Vec::new();
    for agent in state.schedule.ordered_agents() {
        let latest = state.monitor.table().latest(&agent.name).await;
        agents.push(AgentView {
            name: agent.name.clone(),
            group: agent.group.clone(),
            port: agent.port,
            health_port: agent.health_port,
            required: agent.required,
            phase: state.schedule.phase_of(&agent.name).unwrap_or_default(),
            dependencies: agent.dependencies.clone(),
            capabilities: agent.capabilities.clone(),
            status: latest.as_ref().map(|r| r.status).unwrap_or(HealthStatus::Unknown),
            last_checked: latest.as_ref().map(|r| r.timestamp),
            checks: latest.as_ref().map(|r| r.checks.clone()).unwrap_or_default(),
            error_message: latest.and_then(|r| r.error_message),
            failure_probability: state.analyzer.probability(&agent.name).await,
            circuit_state: state.breakers.state(&agent.name).await,
            last_shutdown_reason: state.monitor.shutdown_reason(&agent.name).await,
        });
    }
    Json(AgentsResponse { agents })
}

async fn status(State(state): State<AppStateArc>) -> Json<StatusResponse> {
    let names = state.managed_names();
    let counts = state
        .monitor
        .table()
        .counts(names.iter().map(String::as_str))
        .await;
    let peer = state.coordinator.state().await;

    Json(StatusResponse {
        node: state.node.name.clone(),
        role: state.node.role.clone(),
        environment: state.node.environment.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        phases: state.schedule.len(),
        agents_total: names.len(),
        agents_healthy: counts.healthy,
        agents_degraded: counts.degraded,
        agents_unhealthy: counts.unhealthy,
        agents_unknown: counts.unknown,
        open_breakers: state.breakers.open_count().await,
        peer_status: peer.peer_status,
        failover_active: peer.failover_active,
        last_successful_sync: peer.last_successful_sync,
    })
}

/// Analyzer alerts plus one alert per open breaker and one for failover
async fn alerts(State(state): State<AppStateArc>) -> Json<AlertsResponse> {
    let mut alerts = state.analyzer.alerts().await;
    let now = Utc::now();

    for view in state.breakers.views().await {
        if view.state != CircuitState::Open {
            continue;
        }
        alerts.push(Alert {
            source: "circuit_breaker".to_string(),
            agent_name: view.target.clone(),
            severity: AlertSeverity::Warning,
            message: format!(
                "circuit open after {} consecutive failures ({:.0}% failure rate)",
                view.consecutive_failures,
                view.failure_rate * 100.0
            ),
            probability: None,
            recommended_tier: None,
            raised_at: view.opened_at.unwrap_or(now),
        });
    }

    let peer = state.coordinator.state().await;
    if peer.failover_active {
        alerts.push(Alert {
            source: "cross_node_coordinator".to_string(),
            agent_name: state.coordinator.breaker_target(),
            severity: AlertSeverity::Critical,
            message: format!(
                "failover active: peer {} after {} consecutive failed syncs",
                peer.peer_status.as_str(),
                peer.consecutive_failures
            ),
            probability: None,
            recommended_tier: None,
            raised_at: now,
        });
    }

    Json(AlertsResponse { alerts })
}

async fn breakers(State(state): State<AppStateArc>) -> Json<BreakersResponse> {
    Json(BreakersResponse {
        breakers: state.breakers.views().await,
    })
}

async fn sync_history(
    State(state): State<AppStateArc>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<SyncHistoryResponse>, ApiError> {
    let records = state.store.recent_sync_attempts(query.limit())?;
    Ok(Json(SyncHistoryResponse { records }))
}

// ============================================================================
// Recovery Routes
// ============================================================================

pub fn recovery_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/v1/trigger_recovery", post(trigger_recovery))
        .route("/api/v1/recovery/history", get(recovery_history))
}

async fn trigger_recovery(
    State(state): State<AppStateArc>,
    Json(req): Json<TriggerRecoveryRequest>,
) -> Result<Json<TriggerRecoveryResponse>, ApiError> {
    let tier: RecoveryTier = req
        .strategy
        .parse()
        .map_err(|e: warden_common::ParseTierError| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    info!(agent = %req.agent_name, tier = %tier, "Manual recovery requested");
    let action = state
        .recovery
        .attempt_recovery(&req.agent_name, tier, RecoveryTrigger::Manual)
        .await?;

    Ok(Json(TriggerRecoveryResponse {
        status: action.result.as_str().to_string(),
        action,
    }))
}

async fn recovery_history(
    State(state): State<AppStateArc>,
    Query(query): Query<HistoryQuery>,
) -> Json<RecoveryHistoryResponse> {
    Json(RecoveryHistoryResponse {
        actions: state.recovery.history(query.limit()).await,
    })
}

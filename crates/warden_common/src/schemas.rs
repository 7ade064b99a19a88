//! JSON schemas for the warden HTTP API

use crate::types::{
    Alert, CircuitState, HealthStatus, PeerStatus, PeerSyncRecord, RecoveryAction,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub role: String,
    pub environment: String,
    pub peer_hub_status: PeerStatus,
    pub failover_active: bool,
    pub monitored_agents: usize,
    pub uptime_seconds: u64,
}

impl HealthResponse {
    /// Whether the remote node declares itself able to accept syncs
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// One metric row exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetric {
    pub agent_name: String,
    pub metric_type: String,
    pub metric_value: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When the metric was observed on the source node. Falls back to the
    /// request timestamp when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `POST /api/v1/sync_from_peer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub source_hub: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: Vec<SyncMetric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: String,
    pub metrics_received: usize,
}

/// `POST /api/v1/trigger_recovery`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecoveryRequest {
    pub agent_name: String,
    /// Strategy name or tier (`restart`, `clear_state`, `tier3`, `4`, ...)
    pub strategy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecoveryResponse {
    pub status: String,
    pub action: RecoveryAction,
}

/// Per-agent view served by `GET /api/v1/agents`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub name: String,
    pub group: String,
    pub port: u16,
    pub health_port: u16,
    pub required: bool,
    pub phase: usize,
    pub dependencies: Vec<String>,
    pub capabilities: Vec<String>,
    pub status: HealthStatus,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checks: BTreeMap<String, bool>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub failure_probability: f64,
    pub circuit_state: CircuitState,
    #[serde(default)]
    pub last_shutdown_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentView>,
}

/// `GET /api/v1/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node: String,
    pub role: String,
    pub environment: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub phases: usize,
    pub agents_total: usize,
    pub agents_healthy: usize,
    pub agents_degraded: usize,
    pub agents_unhealthy: usize,
    pub agents_unknown: usize,
    pub open_breakers: usize,
    pub peer_status: PeerStatus,
    pub failover_active: bool,
    #[serde(default)]
    pub last_successful_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsResponse {
    pub alerts: Vec<Alert>,
}

/// Read-only breaker snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerView {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_rate: f64,
    pub window_calls: usize,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakersResponse {
    pub breakers: Vec<BreakerView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryHistoryResponse {
    pub actions: Vec<RecoveryAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistoryResponse {
    pub records: Vec<PeerSyncRecord>,
}

/// Error body returned by every failing API call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

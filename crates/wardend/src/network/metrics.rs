//! Prometheus metrics for the fleet warden

use prometheus::{
    register_gauge_vec_with_registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Encoder, GaugeVec, HistogramVec, IntCounterVec, IntGauge,
    IntGaugeVec, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::warn;
use warden_common::{AlertSeverity, CircuitState, HealthStatus, RecoveryAction};

use crate::supervisor::Transition;

/// Fleet metrics for Prometheus
#[derive(Clone)]
pub struct FleetMetrics {
    // Health
    pub health_checks_total: IntCounterVec,
    pub agent_status: IntGaugeVec,

    // Breakers
    pub breaker_transitions_total: IntCounterVec,
    pub breaker_state: IntGaugeVec,

    // Prediction
    pub failure_probability: GaugeVec,
    pub alerts_total: IntCounterVec,

    // Recovery
    pub recovery_actions_total: IntCounterVec,

    // Peer sync
    pub peer_sync_total: IntCounterVec,
    pub peer_sync_latency_seconds: HistogramVec,
    pub peer_records_received_total: IntCounterVec,
    pub failover_active: IntGauge,

    // Startup
    pub phases_started: IntGauge,

    registry: Arc<Registry>,
}

impl FleetMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let health_checks_total = register_int_counter_vec_with_registry!(
            "warden_health_checks_total",
            "Health checks performed by agent and resulting status",
            &["agent", "status"],
            registry
        )
        .unwrap();

        let agent_status = register_int_gauge_vec_with_registry!(
            "warden_agent_status",
            "Current agent status: 0=healthy, 1=degraded, 2=unhealthy, 3=unknown",
            &["agent"],
            registry
        )
        .unwrap();

        let breaker_transitions_total = register_int_counter_vec_with_registry!(
            "warden_breaker_transitions_total",
            "Circuit breaker transitions by target and new state",
            &["target", "state"],
            registry
        )
        .unwrap();

        let breaker_state = register_int_gauge_vec_with_registry!(
            "warden_breaker_state",
            "Circuit breaker state: 0=closed, 1=open, 2=half_open",
            &["target"],
            registry
        )
        .unwrap();

        let failure_probability = register_gauge_vec_with_registry!(
            "warden_failure_probability",
            "Predicted failure probability per agent",
            &["agent"],
            registry
        )
        .unwrap();

        let alerts_total = register_int_counter_vec_with_registry!(
            "warden_alerts_total",
            "Alerts raised by source and severity",
            &["source", "severity"],
            registry
        )
        .unwrap();

        let recovery_actions_total = register_int_counter_vec_with_registry!(
            "warden_recovery_actions_total",
            "Recovery actions by tier and result",
            &["tier", "result"],
            registry
        )
        .unwrap();

        let peer_sync_total = register_int_counter_vec_with_registry!(
            "warden_peer_sync_total",
            "Peer sync attempts by peer status and outcome",
            &["peer_status", "result"],
            registry
        )
        .unwrap();

        let peer_sync_latency_seconds = register_histogram_vec_with_registry!(
            "warden_peer_sync_latency_seconds",
            "Peer sync round trip in seconds",
            &["peer"],
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            registry
        )
        .unwrap();

        let peer_records_received_total = register_int_counter_vec_with_registry!(
            "warden_peer_records_received_total",
            "Metric records accepted from peers",
            &["source_hub"],
            registry
        )
        .unwrap();

        let failover_active = register_int_gauge_with_registry!(
            "warden_failover_active",
            "Peer failover declared: 0=no, 1=yes",
            registry
        )
        .unwrap();

        let phases_started = register_int_gauge_with_registry!(
            "warden_phases_started",
            "Startup phases that passed health verification",
            registry
        )
        .unwrap();

        Self {
            health_checks_total,
            agent_status,
            breaker_transitions_total,
            breaker_state,
            failure_probability,
            alerts_total,
            recovery_actions_total,
            peer_sync_total,
            peer_sync_latency_seconds,
            peer_records_received_total,
            failover_active,
            phases_started,
            registry: Arc::new(registry),
        }
    }

    pub fn record_health(&self, agent: &str, status: HealthStatus) {
        self.health_checks_total
            .with_label_values(&[agent, status.as_str()])
            .inc();
        self.agent_status
            .with_label_values(&[agent])
            .set(status.gauge_value());
    }

    pub fn record_transition(&self, transition: &Transition) {
        self.breaker_transitions_total
            .with_label_values(&[&transition.target, transition.to.as_str()])
            .inc();
        self.set_breaker_state(&transition.target, transition.to);
    }

    pub fn set_breaker_state(&self, target: &str, state: CircuitState) {
        self.breaker_state
            .with_label_values(&[target])
            .set(state.gauge_value());
    }

    pub fn set_failure_probability(&self, agent: &str, probability: f64) {
        self.failure_probability
            .with_label_values(&[agent])
            .set(probability);
    }

    pub fn record_alert(&self, source: &str, severity: AlertSeverity) {
        self.alerts_total
            .with_label_values(&[source, severity.as_str()])
            .inc();
    }

    pub fn record_recovery(&self, action: &RecoveryAction) {
        let tier = format!("tier{}", action.tier.number());
        self.recovery_actions_total
            .with_label_values(&[&tier, action.result.as_str()])
            .inc();
    }

    pub fn record_sync(&self, peer: &str, peer_status: &str, success: bool, latency_secs: f64) {
        let result = if success { "success" } else { "failure" };
        self.peer_sync_total
            .with_label_values(&[peer_status, result])
            .inc();
        self.peer_sync_latency_seconds
            .with_label_values(&[peer])
            .observe(latency_secs);
    }

    pub fn record_received(&self, source_hub: &str, count: usize) {
        self.peer_records_received_total
            .with_label_values(&[source_hub])
            .inc_by(count as u64);
    }

    pub fn set_failover(&self, active: bool) {
        self.failover_active.set(if active { 1 } else { 0 });
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_series() {
        let metrics = FleetMetrics::new();
        metrics.record_health("memory", HealthStatus::Degraded);
        metrics.set_failover(true);
        metrics.set_failure_probability("memory", 0.42);

        let text = metrics.export();
        assert!(text.contains("warden_health_checks_total"));
        assert!(text.contains("agent=\"memory\""));
        assert!(text.contains("warden_failover_active 1"));
        assert!(text.contains("warden_failure_probability"));
    }

    #[test]
    fn test_independent_registries() {
        // Two instances must not collide on registration
        let a = FleetMetrics::new();
        let b = FleetMetrics::new();
        a.set_failover(true);
        assert!(b.export().contains("warden_failover_active 0"));
    }
}

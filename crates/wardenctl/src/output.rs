//! Terminal rendering, ASCII only

use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;
use warden_common::{
    AgentsResponse, AlertSeverity, AlertsResponse, BreakersResponse, CircuitState,
    HealthResponse, HealthStatus, PeerStatus, RecoveryAction, RecoveryResult, StatusResponse,
    SyncHistoryResponse,
};

fn status_label(status: HealthStatus) -> String {
    match status {
        HealthStatus::Healthy => "[HEALTHY]".bright_green().to_string(),
        HealthStatus::Degraded => "[DEGRADED]".yellow().to_string(),
        HealthStatus::Unhealthy => "[UNHEALTHY]".bright_red().to_string(),
        HealthStatus::Unknown => "[UNKNOWN]".dimmed().to_string(),
    }
}

fn circuit_label(state: CircuitState) -> String {
    match state {
        CircuitState::Closed => state.as_str().green().to_string(),
        CircuitState::HalfOpen => state.as_str().yellow().to_string(),
        CircuitState::Open => state.as_str().bright_red().to_string(),
    }
}

fn peer_label(status: PeerStatus) -> String {
    match status {
        PeerStatus::Healthy => status.as_str().green().to_string(),
        PeerStatus::Unhealthy => status.as_str().yellow().to_string(),
        PeerStatus::Unreachable => status.as_str().bright_red().to_string(),
        PeerStatus::Unknown => status.as_str().dimmed().to_string(),
    }
}

fn ago(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => {
            let secs = (Utc::now() - at).num_seconds().max(0);
            format!("{}s ago", secs)
        }
        None => "never".to_string(),
    }
}

pub fn print_status(status: &StatusResponse) {
    println!();
    println!(
        "{} {} ({}, {}) v{}",
        "Node".bold(),
        status.node,
        status.role,
        status.environment,
        status.version
    );
    println!("  Uptime:     {}s", status.uptime_seconds);
    println!("  Phases:     {}", status.phases);
    println!(
        "  Agents:     {} total, {} healthy, {} degraded, {} unhealthy, {} unknown",
        status.agents_total,
        status.agents_healthy.to_string().green(),
        status.agents_degraded.to_string().yellow(),
        status.agents_unhealthy.to_string().bright_red(),
        status.agents_unknown
    );
    println!("  Breakers:   {} open", status.open_breakers);
    println!(
        "  Peer:       {} (last sync {})",
        peer_label(status.peer_status),
        ago(status.last_successful_sync)
    );
    if status.failover_active {
        println!("  {}", "[FAILOVER ACTIVE]".bright_red().bold());
    }
    println!();
}

pub fn print_health(health: &HealthResponse) {
    println!(
        "{} {} ({}), {} agents, peer {}, up {}s",
        if health.is_healthy() {
            "[OK]".bright_green().to_string()
        } else {
            "[FAIL]".bright_red().to_string()
        },
        health.role,
        health.environment,
        health.monitored_agents,
        peer_label(health.peer_hub_status),
        health.uptime_seconds
    );
    if health.failover_active {
        println!("{}", "[FAILOVER ACTIVE]".bright_red());
    }
}

pub fn print_agents(response: &AgentsResponse) {
    println!();
    println!(
        "{:<4} {:<20} {:<12} {:<7} {:<12} {:<10} {:>6}",
        "PH", "AGENT", "GROUP", "PORT", "STATUS", "CIRCUIT", "P(F)"
    );
    for agent in &response.agents {
        println!(
            "{:<4} {:<20} {:<12} {:<7} {:<12} {:<10} {:>6.2}",
            agent.phase,
            agent.name,
            agent.group,
            agent.port,
            status_label(agent.status),
            circuit_label(agent.circuit_state),
            agent.failure_probability
        );
        if let Some(message) = &agent.error_message {
            println!("     {}", message.dimmed());
        }
        if let Some(reason) = &agent.last_shutdown_reason {
            println!("     last shutdown: {}", reason.dimmed());
        }
    }
    println!();
}

pub fn print_alerts(response: &AlertsResponse) {
    if response.alerts.is_empty() {
        println!("{}", "No active alerts".green());
        return;
    }
    for alert in &response.alerts {
        let label = match alert.severity {
            AlertSeverity::Critical => "[CRITICAL]".bright_red().to_string(),
            AlertSeverity::Warning => "[WARNING]".yellow().to_string(),
        };
        print!("{} {} ({}): {}", label, alert.agent_name, alert.source, alert.message);
        if let Some(tier) = alert.recommended_tier {
            print!(" -> recommend {}", tier);
        }
        println!();
    }
}

pub fn print_breakers(response: &BreakersResponse) {
    println!();
    println!(
        "{:<24} {:<10} {:>8} {:>8} {:>8}",
        "TARGET", "STATE", "FAILS", "RATE", "CALLS"
    );
    for breaker in &response.breakers {
        println!(
            "{:<24} {:<10} {:>8} {:>7.0}% {:>8}",
            breaker.target,
            circuit_label(breaker.state),
            breaker.consecutive_failures,
            breaker.failure_rate * 100.0,
            breaker.window_calls
        );
    }
    println!();
}

pub fn print_recovery(action: &RecoveryAction) {
    let label = match action.result {
        RecoveryResult::Success => "[OK]".bright_green().to_string(),
        RecoveryResult::Failed => "[FAILED]".bright_red().to_string(),
        RecoveryResult::Cooldown => "[COOLDOWN]".yellow().to_string(),
        RecoveryResult::Blocked => "[BLOCKED]".yellow().to_string(),
    };
    let steps: Vec<&str> = action.actions.iter().map(|s| s.as_str()).collect();
    println!(
        "{} {} {} via {} in {}ms [{}]",
        label,
        action.agent_name,
        action.tier,
        action.trigger.as_str(),
        action.duration_ms,
        steps.join(", ")
    );
    if let Some(error) = &action.error {
        println!("     {}", error.dimmed());
    }
}

pub fn print_sync_history(response: &SyncHistoryResponse) {
    for record in &response.records {
        println!(
            "{} {} -> {} {} sent={} {}ms{}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.source_node,
            record.target_node,
            if record.success {
                "ok".green().to_string()
            } else {
                "fail".bright_red().to_string()
            },
            record.records_sent,
            record.latency_ms,
            record
                .error
                .as_ref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }
}

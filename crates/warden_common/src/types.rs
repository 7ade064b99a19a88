//! Core data types for the fleet warden

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Reduced health of one agent for one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Every check passed
    Healthy,
    /// Port and ready signal fine, a peripheral check failed
    Degraded,
    /// Port unreachable or ready signal missing/stale
    Unhealthy,
    /// The checks themselves could not be executed
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// HEALTHY and DEGRADED agents are serving traffic
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Numeric sample fed to the predictive analyzer
    pub fn sample_value(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Unhealthy | Self::Unknown => 0.0,
        }
    }

    /// Prometheus gauge encoding
    pub fn gauge_value(&self) -> i64 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
            Self::Unknown => 3,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One health poll result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub agent_name: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    /// Check name -> passed
    pub checks: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected
    Open,
    /// A trial request is testing whether the target recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn gauge_value(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalating recovery tiers. Each tier performs a superset of the
/// previous tier's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RecoveryTier {
    /// Restart the agent process
    Restart = 1,
    /// Clear on-disk state, then restart
    ClearState = 2,
    /// Restart dependencies, clear state, restart
    RestartDependencies = 3,
    /// Restart the whole fleet
    RestartAll = 4,
}

impl RecoveryTier {
    pub fn number(&self) -> u8 {
        *self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Restart),
            2 => Some(Self::ClearState),
            3 => Some(Self::RestartDependencies),
            4 => Some(Self::RestartAll),
            _ => None,
        }
    }

    /// Strategy name used by the HTTP API
    pub fn strategy_name(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::ClearState => "clear_state",
            Self::RestartDependencies => "restart_dependencies",
            Self::RestartAll => "restart_all",
        }
    }

    /// Ordered steps this tier executes
    pub fn steps(&self) -> Vec<RecoveryStep> {
        match self {
            Self::Restart => vec![RecoveryStep::Restart],
            Self::ClearState => vec![RecoveryStep::ClearState, RecoveryStep::Restart],
            Self::RestartDependencies => vec![
                RecoveryStep::RestartDependencies,
                RecoveryStep::ClearState,
                RecoveryStep::Restart,
            ],
            Self::RestartAll => vec![RecoveryStep::RestartAll],
        }
    }
}

impl From<RecoveryTier> for u8 {
    fn from(tier: RecoveryTier) -> u8 {
        tier.number()
    }
}

impl TryFrom<u8> for RecoveryTier {
    type Error = ParseTierError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Self::from_number(n).ok_or_else(|| ParseTierError(n.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown recovery strategy '{0}' (expected restart, clear_state, restart_dependencies, restart_all or tier1..tier4)")]
pub struct ParseTierError(pub String);

impl FromStr for RecoveryTier {
    type Err = ParseTierError;

    /// Accepts strategy names, `tierN` and bare tier numbers
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let tier = match normalized.as_str() {
            "restart" | "tier1" | "1" => Self::Restart,
            "clear_state" | "tier2" | "2" => Self::ClearState,
            "restart_dependencies" | "tier3" | "3" => Self::RestartDependencies,
            "restart_all" | "tier4" | "4" => Self::RestartAll,
            _ => return Err(ParseTierError(s.to_string())),
        };
        Ok(tier)
    }
}

impl fmt::Display for RecoveryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{} ({})", self.number(), self.strategy_name())
    }
}

/// A single step performed during recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    Restart,
    ClearState,
    RestartDependencies,
    RestartAll,
}

impl RecoveryStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::ClearState => "clear_state",
            Self::RestartDependencies => "restart_dependencies",
            Self::RestartAll => "restart_all",
        }
    }
}

/// Outcome of a recovery request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryResult {
    /// Every step completed
    Success,
    /// A step failed; see `error`
    Failed,
    /// Rejected because the agent is inside its cooldown window
    Cooldown,
    /// Rejected because the agent's circuit breaker is open
    Blocked,
}

impl RecoveryResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cooldown => "cooldown",
            Self::Blocked => "blocked",
        }
    }
}

/// What caused a recovery request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    /// HealthMonitor reported UNHEALTHY
    HealthCheck,
    /// Predictive analyzer raised a critical alert
    Predictive,
    /// Critical alerts across most of the fleet
    SystemWide,
    /// Operator or API call
    Manual,
}

impl RecoveryTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthCheck => "health_check",
            Self::Predictive => "predictive",
            Self::SystemWide => "system_wide",
            Self::Manual => "manual",
        }
    }

    pub fn is_automatic(&self) -> bool {
        !matches!(self, Self::Manual)
    }
}

/// Audit log entry for one recovery request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: String,
    pub agent_name: String,
    pub tier: RecoveryTier,
    pub actions: Vec<RecoveryStep>,
    pub result: RecoveryResult,
    pub trigger: RecoveryTrigger,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Predictive alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Monitor only
    Warning,
    /// Immediate tier-2 recovery recommended
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Alert raised by the analyzer, a breaker or the peer coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub source: String,
    pub agent_name: String,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_tier: Option<RecoveryTier>,
    pub raised_at: DateTime<Utc>,
}

/// Reachability classification of the peer node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Healthy,
    Unhealthy,
    Unreachable,
    /// No sync cycle has run yet, or no peer is configured
    Unknown,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unreachable => "unreachable",
            Self::Unknown => "unknown",
        }
    }
}

/// Audit entry for one peer synchronization attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSyncRecord {
    pub source_node: String,
    pub target_node: String,
    pub timestamp: DateTime<Utc>,
    pub peer_status: PeerStatus,
    pub records_sent: usize,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parsing_accepts_all_spellings() {
        assert_eq!("restart".parse::<RecoveryTier>().unwrap(), RecoveryTier::Restart);
        assert_eq!("TIER2".parse::<RecoveryTier>().unwrap(), RecoveryTier::ClearState);
        assert_eq!("3".parse::<RecoveryTier>().unwrap(), RecoveryTier::RestartDependencies);
        assert_eq!("restart_all".parse::<RecoveryTier>().unwrap(), RecoveryTier::RestartAll);
        assert!("tier5".parse::<RecoveryTier>().is_err());
    }

    #[test]
    fn test_tiers_are_supersets() {
        assert_eq!(RecoveryTier::Restart.steps(), vec![RecoveryStep::Restart]);
        let tier3 = RecoveryTier::RestartDependencies.steps();
        assert_eq!(tier3.first(), Some(&RecoveryStep::RestartDependencies));
        assert!(tier3.contains(&RecoveryStep::ClearState));
        assert_eq!(tier3.last(), Some(&RecoveryStep::Restart));
    }

    #[test]
    fn test_tier_serializes_as_number() {
        let json = serde_json::to_string(&RecoveryTier::RestartDependencies).unwrap();
        assert_eq!(json, "3");
        let tier: RecoveryTier = serde_json::from_str("2").unwrap();
        assert_eq!(tier, RecoveryTier::ClearState);
        assert!(serde_json::from_str::<RecoveryTier>("9").is_err());
    }

    #[test]
    fn test_health_status_wire_format() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"DEGRADED\"");
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Unknown.is_operational());
    }
}

//! Error taxonomy for the fleet warden.
//!
//! Only `Configuration` is allowed to end the process. Every other variant is
//! local to one agent or target and is logged, recorded and absorbed by the
//! loop that produced it.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    /// Cyclic dependencies, unknown dependencies, duplicate names, missing scripts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The dependency graph contains at least one cycle.
    #[error("dependency cycle detected involving agents: {agents:?}")]
    DependencyCycle { agents: Vec<String> },

    /// An agent process could not be started or exited immediately.
    #[error("failed to launch agent {agent}: {reason}")]
    Launch { agent: String, reason: String },

    /// A required agent of a phase never became healthy.
    #[error("phase {phase} failed health verification: {agents:?}")]
    PhaseUnhealthy { phase: usize, agents: Vec<String> },

    /// The check machinery itself failed (not the agent).
    #[error("health check for {agent} failed to execute: {reason}")]
    HealthCheck { agent: String, reason: String },

    /// Deliberate rejection by an open circuit breaker.
    #[error("circuit breaker open for {target}")]
    CircuitOpen { target: String },

    /// A call guarded by a breaker exceeded its request timeout.
    #[error("call to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    /// The peer answered, but with an error status or a malformed payload.
    #[error("peer sync error: {0}")]
    Sync(String),

    /// No answer from the peer at all (connect failure, request timeout).
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    /// A restart or state clean-up step failed.
    #[error("recovery of {agent} failed: {reason}")]
    Recovery { agent: String, reason: String },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl WardenError {
    /// Whether this error must abort the orchestrator before any launch
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::DependencyCycle { .. })
    }
}

pub type WardenResult<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_cycle_lists_agents() {
        let err = WardenError::DependencyCycle {
            agents: vec!["memory".to_string(), "router".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("memory"));
        assert!(msg.contains("router"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_circuit_open_is_not_fatal() {
        let err = WardenError::CircuitOpen {
            target: "peer".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("peer"));
    }
}

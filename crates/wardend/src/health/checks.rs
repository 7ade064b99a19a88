//! Individual health checks
//!
//! Two checks are built in and decide liveness: TCP reachability of the
//! agent's listen port and a fresh ready record. Anything registered through
//! [`CheckRegistry`] is peripheral and can only degrade an agent.

use crate::registry::AgentDescriptor;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

pub const PORT_CHECK: &str = "port";
pub const READY_CHECK: &str = "ready";

/// Whether a TCP connection to `host:port` succeeds within `timeout`.
///
/// Refused or timed out connections are a failed check, not an error.
pub async fn tcp_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            trace!("{}:{} unreachable: {}", host, port, e);
            false
        }
        Err(_) => {
            trace!("{}:{} connect timed out", host, port);
            false
        }
    }
}

/// Peripheral per-agent check
#[async_trait]
pub trait AgentCheck: Send + Sync {
    /// Key under which the result appears in the health record
    fn name(&self) -> &str;

    /// `Ok(false)` means the agent failed the check; `Err` means the check
    /// could not run at all.
    async fn run(&self, agent: &AgentDescriptor) -> Result<bool>;
}

/// Separate health port must accept connections
pub struct HealthPortCheck {
    host: String,
    timeout: Duration,
}

impl HealthPortCheck {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

#[async_trait]
impl AgentCheck for HealthPortCheck {
    fn name(&self) -> &str {
        "health_port"
    }

    async fn run(&self, agent: &AgentDescriptor) -> Result<bool> {
        Ok(tcp_reachable(&self.host, agent.health_port, self.timeout).await)
    }
}

/// Peripheral checks, either for every agent or for named ones
#[derive(Default, Clone)]
pub struct CheckRegistry {
    global: Vec<Arc<dyn AgentCheck>>,
    per_agent: HashMap<String, Vec<Arc<dyn AgentCheck>>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_global(&mut self, check: Arc<dyn AgentCheck>) {
        self.global.push(check);
    }

    pub fn register_for(&mut self, agent: impl Into<String>, check: Arc<dyn AgentCheck>) {
        self.per_agent.entry(agent.into()).or_default().push(check);
    }

    /// Checks that apply to `agent`, global ones first
    pub fn checks_for(&self, agent: &str) -> Vec<Arc<dyn AgentCheck>> {
        let mut checks = self.global.clone();
        if let Some(extra) = self.per_agent.get(agent) {
            checks.extend(extra.iter().cloned());
        }
        checks
    }

    /// Builtin peripheral checks for a set of agents: a health-port check for
    /// every agent whose health port differs from its listen port
    pub fn for_agents<'a>(
        agents: impl IntoIterator<Item = &'a Arc<AgentDescriptor>>,
        host: &str,
        timeout: Duration,
    ) -> Self {
        let mut registry = Self::new();
        let health_port: Arc<dyn AgentCheck> = Arc::new(HealthPortCheck::new(host, timeout));
        for agent in agents {
            if agent.health_port != agent.port {
                registry.register_for(agent.name.clone(), health_port.clone());
            }
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_reachable("127.0.0.1", port, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!tcp_reachable("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[test]
    fn test_health_port_check_only_when_distinct() {
        let mut split = AgentDescriptor::new("translator", 7200);
        split.health_port = 7201;
        let agents = vec![
            Arc::new(AgentDescriptor::new("memory", 7100)),
            Arc::new(split),
        ];
        let registry = CheckRegistry::for_agents(&agents, "127.0.0.1", Duration::from_secs(1));
        assert!(registry.checks_for("memory").is_empty());
        let checks = registry.checks_for("translator");
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name(), "health_port");
    }
}

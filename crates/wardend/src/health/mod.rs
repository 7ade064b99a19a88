//! Health subsystem - per-agent liveness reduced to one of four states.
//!
//! Each poll runs the built-in port and ready checks plus any peripheral
//! checks, reduces them to a [`HealthStatus`] and appends the record to a
//! bounded per-agent history. Startup uses [`HealthMonitor::verify_phase_health`]
//! to gate phases; the daemon loop calls [`HealthMonitor::check_all`] on the
//! poll interval and feeds the results to the breakers, the analyzer and
//! recovery.

pub mod checks;
pub mod ready_store;

pub use checks::{tcp_reachable, AgentCheck, CheckRegistry, HealthPortCheck, PORT_CHECK, READY_CHECK};
pub use ready_store::{
    read_ready, read_shutdown, ready_key, shutdown_key, FileReadyStore, MemoryReadyStore,
    ReadySignal, ReadySignalStore, ShutdownRecord,
};

use crate::config::HealthConfig;
use crate::error::WardenError;
use crate::registry::AgentDescriptor;
use crate::scheduler::Phase;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use warden_common::{HealthRecord, HealthStatus};

/// Reduce check results to a status.
///
/// Port and ready decide liveness; any other failing check only degrades.
pub fn reduce(checks: &BTreeMap<String, bool>) -> HealthStatus {
    let port = checks.get(PORT_CHECK).copied().unwrap_or(false);
    let ready = checks.get(READY_CHECK).copied().unwrap_or(false);
    if !(port && ready) {
        return HealthStatus::Unhealthy;
    }
    let peripheral_ok = checks
        .iter()
        .filter(|(name, _)| name.as_str() != PORT_CHECK && name.as_str() != READY_CHECK)
        .all(|(_, passed)| *passed);
    if peripheral_ok {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

/// Count of agents per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

/// Latest record and bounded history per agent
pub struct HealthTable {
    records: RwLock<HashMap<String, VecDeque<HealthRecord>>>,
    history_len: usize,
}

impl HealthTable {
    pub fn new(history_len: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            history_len: history_len.max(1),
        }
    }

    pub async fn record(&self, record: HealthRecord) {
        let mut records = self.records.write().await;
        let history = records.entry(record.agent_name.clone()).or_default();
        history.push_back(record);
        while history.len() > self.history_len {
            history.pop_front();
        }
    }

    pub async fn latest(&self, agent: &str) -> Option<HealthRecord> {
        self.records
            .read()
            .await
            .get(agent)
            .and_then(|h| h.back().cloned())
    }

    /// Oldest first
    pub async fn history(&self, agent: &str) -> Vec<HealthRecord> {
        self.records
            .read()
            .await
            .get(agent)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest record of every agent seen so far
    pub async fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter_map(|(name, h)| h.back().map(|r| (name.clone(), r.clone())))
            .collect()
    }

    /// Status counts over `agents`; agents never checked count as unknown
    pub async fn counts<'a>(&self, agents: impl IntoIterator<Item = &'a str>) -> StatusCounts {
        let records = self.records.read().await;
        let mut counts = StatusCounts::default();
        for agent in agents {
            let status = records
                .get(agent)
                .and_then(|h| h.back())
                .map(|r| r.status)
                .unwrap_or(HealthStatus::Unknown);
            match status {
                HealthStatus::Healthy => counts.healthy += 1,
                HealthStatus::Degraded => counts.degraded += 1,
                HealthStatus::Unhealthy => counts.unhealthy += 1,
                HealthStatus::Unknown => counts.unknown += 1,
            }
        }
        counts
    }
}

/// Outcome of gating one startup phase
#[derive(Debug, Clone)]
pub struct PhaseHealthReport {
    pub phase: usize,
    pub attempts: u32,
    /// Last record per agent in the phase
    pub records: BTreeMap<String, HealthRecord>,
    /// Required agents that never became operational
    pub failed_required: Vec<String>,
    /// Optional agents that never became operational
    pub failed_optional: Vec<String>,
}

impl PhaseHealthReport {
    pub fn passed(&self) -> bool {
        self.failed_required.is_empty()
    }

    pub fn into_error(self) -> Option<WardenError> {
        if self.passed() {
            None
        } else {
            Some(WardenError::PhaseUnhealthy {
                phase: self.phase,
                agents: self.failed_required,
            })
        }
    }
}

/// Runs checks against agents and keeps the health table
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    store: Arc<dyn ReadySignalStore>,
    checks: Arc<CheckRegistry>,
    table: Arc<HealthTable>,
    limiter: Arc<Semaphore>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, store: Arc<dyn ReadySignalStore>, checks: CheckRegistry) -> Self {
        let table = Arc::new(HealthTable::new(config.history_len));
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_checks.max(1)));
        Self {
            config,
            store,
            checks: Arc::new(checks),
            table,
            limiter,
        }
    }

    pub fn table(&self) -> &Arc<HealthTable> {
        &self.table
    }

    pub fn store(&self) -> &Arc<dyn ReadySignalStore> {
        &self.store
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Check one agent and record the result
    pub async fn check_agent(&self, agent: &AgentDescriptor) -> HealthRecord {
        let record = self.evaluate(agent).await;
        debug!(
            agent = %record.agent_name,
            status = %record.status,
            "Health check complete"
        );
        self.table.record(record.clone()).await;
        record
    }

    /// Check agents concurrently, bounded by `max_concurrent_checks`.
    /// Results come back in input order.
    pub async fn check_all(&self, agents: &[Arc<AgentDescriptor>]) -> Vec<HealthRecord> {
        let mut tasks = JoinSet::new();
        for (i, agent) in agents.iter().enumerate() {
            let monitor = self.clone();
            let agent = agent.clone();
            tasks.spawn(async move {
                let _permit = monitor.limiter.clone().acquire_owned().await;
                (i, monitor.check_agent(&agent).await)
            });
        }

        let mut results: Vec<Option<HealthRecord>> = vec![None; agents.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, record)) => results[i] = Some(record),
                Err(e) => warn!("Health check task panicked: {}", e),
            }
        }

        results
            .into_iter()
            .zip(agents)
            .map(|(record, agent)| {
                record.unwrap_or_else(|| {
                    unknown_record(&agent.name, BTreeMap::new(), "check task aborted".to_string())
                })
            })
            .collect()
    }

    /// Gate a startup phase.
    ///
    /// Every agent of the phase is checked up to `retries` times, `interval`
    /// apart. Agents that reach HEALTHY or DEGRADED drop out of the retry set.
    /// The phase passes when no required agent is left.
    pub async fn verify_phase_health(
        &self,
        phase: &Phase,
        retries: u32,
        interval: Duration,
    ) -> PhaseHealthReport {
        let mut pending: Vec<Arc<AgentDescriptor>> = phase.agents.clone();
        let mut records = BTreeMap::new();
        let mut attempts = 0;

        for attempt in 1..=retries.max(1) {
            attempts = attempt;
            let results = self.check_all(&pending).await;
            let mut still_pending = Vec::new();
            for (agent, record) in pending.into_iter().zip(results) {
                if !record.status.is_operational() {
                    still_pending.push(agent);
                }
                records.insert(record.agent_name.clone(), record);
            }
            pending = still_pending;

            if pending.is_empty() {
                break;
            }
            debug!(
                phase = phase.index,
                attempt,
                pending = pending.len(),
                "Phase not yet healthy"
            );
            if attempt < retries {
                tokio::time::sleep(interval).await;
            }
        }

        let (required, optional): (Vec<_>, Vec<_>) = pending.into_iter().partition(|a| a.required);
        let failed_required: Vec<String> = required.iter().map(|a| a.name.clone()).collect();
        let failed_optional: Vec<String> = optional.iter().map(|a| a.name.clone()).collect();

        if !failed_optional.is_empty() {
            warn!(
                phase = phase.index,
                "Optional agents not healthy, continuing: {:?}", failed_optional
            );
        }
        if failed_required.is_empty() {
            info!(phase = phase.index, attempts, "Phase healthy");
        } else {
            warn!(
                phase = phase.index,
                attempts,
                "Required agents failed health verification: {:?}", failed_required
            );
        }

        PhaseHealthReport {
            phase: phase.index,
            attempts,
            records,
            failed_required,
            failed_optional,
        }
    }

    /// Last shutdown reason an agent left in the store, if readable
    pub async fn shutdown_reason(&self, agent: &str) -> Option<String> {
        match read_shutdown(self.store.as_ref(), agent).await {
            Ok(record) => record.map(|r| r.reason),
            Err(e) => {
                debug!("Could not read shutdown reason for {}: {:#}", agent, e);
                None
            }
        }
    }

    async fn evaluate(&self, agent: &AgentDescriptor) -> HealthRecord {
        let timeout = self.config.check_timeout();
        let mut checks = BTreeMap::new();

        let port_ok = tcp_reachable(&self.config.agent_host, agent.port, timeout).await;
        checks.insert(PORT_CHECK.to_string(), port_ok);

        let ready = tokio::time::timeout(timeout, read_ready(self.store.as_ref(), &agent.name)).await;
        let ready_ok = match ready {
            Ok(Ok(signal)) => signal
                .map(|s| s.is_fresh(Utc::now(), self.config.ready_ttl()))
                .unwrap_or(false),
            Ok(Err(e)) => {
                return unknown_record(&agent.name, checks, format!("ready store: {:#}", e));
            }
            Err(_) => {
                return unknown_record(&agent.name, checks, "ready store read timed out".to_string());
            }
        };
        checks.insert(READY_CHECK.to_string(), ready_ok);

        for check in self.checks.checks_for(&agent.name) {
            match tokio::time::timeout(timeout, check.run(agent)).await {
                Ok(Ok(passed)) => {
                    checks.insert(check.name().to_string(), passed);
                }
                Ok(Err(e)) => {
                    return unknown_record(&agent.name, checks, format!("{}: {:#}", check.name(), e));
                }
                Err(_) => {
                    return unknown_record(&agent.name, checks, format!("{}: timed out", check.name()));
                }
            }
        }

        let status = reduce(&checks);
        let error_message = match status {
            HealthStatus::Unhealthy if !port_ok => Some(format!("port {} unreachable", agent.port)),
            HealthStatus::Unhealthy => Some("ready signal missing or stale".to_string()),
            HealthStatus::Degraded => {
                let failed: Vec<&str> = checks
                    .iter()
                    .filter(|(_, passed)| !**passed)
                    .map(|(name, _)| name.as_str())
                    .collect();
                Some(format!("failing checks: {}", failed.join(", ")))
            }
            _ => None,
        };

        HealthRecord {
            agent_name: agent.name.clone(),
            status,
            timestamp: Utc::now(),
            checks,
            error_message,
        }
    }
}

fn unknown_record(agent: &str, checks: BTreeMap<String, bool>, reason: String) -> HealthRecord {
    let err = WardenError::HealthCheck {
        agent: agent.to_string(),
        reason,
    };
    warn!("{}", err);
    HealthRecord {
        agent_name: agent.to_string(),
        status: HealthStatus::Unknown,
        timestamp: Utc::now(),
        checks,
        error_message: Some(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use ready_store::READY_TTL;
    use tokio::net::TcpListener;

    fn checks(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_reduce() {
        assert_eq!(reduce(&checks(&[("port", true), ("ready", true)])), HealthStatus::Healthy);
        assert_eq!(
            reduce(&checks(&[("port", true), ("ready", true), ("health_port", false)])),
            HealthStatus::Degraded
        );
        assert_eq!(reduce(&checks(&[("port", false), ("ready", true)])), HealthStatus::Unhealthy);
        assert_eq!(reduce(&checks(&[("port", true), ("ready", false)])), HealthStatus::Unhealthy);
        assert_eq!(reduce(&checks(&[])), HealthStatus::Unhealthy);
    }

    struct BrokenCheck;

    #[async_trait]
    impl AgentCheck for BrokenCheck {
        fn name(&self) -> &str {
            "broken"
        }

        async fn run(&self, _agent: &AgentDescriptor) -> anyhow::Result<bool> {
            Err(anyhow!("check binary missing"))
        }
    }

    #[tokio::test]
    async fn test_healthy_then_unknown_on_check_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store = Arc::new(MemoryReadyStore::new());
        store
            .set(
                &ready_key("memory"),
                serde_json::to_value(ReadySignal::new("ready", port)).unwrap(),
                READY_TTL,
            )
            .await
            .unwrap();

        let agent = AgentDescriptor::new("memory", port);
        let monitor = HealthMonitor::new(HealthConfig::default(), store.clone(), CheckRegistry::new());
        assert_eq!(monitor.check_agent(&agent).await.status, HealthStatus::Healthy);

        let mut registry = CheckRegistry::new();
        registry.register_for("memory", Arc::new(BrokenCheck));
        let monitor = HealthMonitor::new(HealthConfig::default(), store, registry);
        let record = monitor.check_agent(&agent).await;
        assert_eq!(record.status, HealthStatus::Unknown);
        assert!(record.error_message.unwrap().contains("check binary missing"));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let table = HealthTable::new(3);
        for _ in 0..5 {
            table
                .record(HealthRecord {
                    agent_name: "audio".to_string(),
                    status: HealthStatus::Unhealthy,
                    timestamp: Utc::now(),
                    checks: BTreeMap::new(),
                    error_message: None,
                })
                .await;
        }
        assert_eq!(table.history("audio").await.len(), 3);
        let counts = table.counts(["audio", "never-seen"]).await;
        assert_eq!(counts.unhealthy, 1);
        assert_eq!(counts.unknown, 1);
    }
}

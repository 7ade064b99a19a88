//! Tiered recovery
//!
//! Tier 1 restarts the agent; tier 2 clears its on-disk state first; tier 3
//! also restarts its dependencies (transitively, in phase order) before the
//! agent; tier 4 restarts every managed agent in phase order.
//!
//! Every request ends up in the audit log, including the ones refused for
//! cooldown or an open breaker. Failed recoveries are recorded and never
//! escalated automatically.

pub mod state;

use crate::config::RecoveryConfig;
use crate::error::{WardenError, WardenResult};
use crate::launcher::AgentRuntime;
use crate::network::metrics::FleetMetrics;
use crate::predictor::FLEET;
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::scheduler::Schedule;
use crate::storage::{MetricsStore, METRIC_RECOVERY};
use crate::supervisor::{Admission, BreakerTable};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_common::{RecoveryAction, RecoveryResult, RecoveryStep, RecoveryTier, RecoveryTrigger};

/// Queued recovery request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub agent_name: String,
    pub tier: RecoveryTier,
    pub trigger: RecoveryTrigger,
}

impl RecoveryRequest {
    pub fn new(agent_name: impl Into<String>, tier: RecoveryTier, trigger: RecoveryTrigger) -> Self {
        Self {
            agent_name: agent_name.into(),
            tier,
            trigger,
        }
    }
}

pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    registry: Arc<AgentRegistry>,
    schedule: Arc<Schedule>,
    /// Agents restarted by tier 4; every scheduled agent unless narrowed
    managed: Vec<String>,
    runtime: Arc<dyn AgentRuntime>,
    breakers: Arc<BreakerTable>,
    metrics: Option<Arc<FleetMetrics>>,
    store: Option<Arc<MetricsStore>>,
    last_recovery: Mutex<HashMap<String, Instant>>,
    audit: RwLock<VecDeque<RecoveryAction>>,
    pending: Mutex<HashSet<String>>,
    queue_tx: mpsc::Sender<RecoveryRequest>,
    queue_rx: Mutex<Option<mpsc::Receiver<RecoveryRequest>>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        config: RecoveryConfig,
        registry: Arc<AgentRegistry>,
        schedule: Arc<Schedule>,
        runtime: Arc<dyn AgentRuntime>,
        breakers: Arc<BreakerTable>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth.max(1));
        let managed = schedule.ordered_agents().iter().map(|a| a.name.clone()).collect();
        Self {
            config,
            registry,
            schedule,
            managed,
            runtime,
            breakers,
            metrics: None,
            store: None,
            last_recovery: Mutex::new(HashMap::new()),
            audit: RwLock::new(VecDeque::new()),
            pending: Mutex::new(HashSet::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<FleetMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_store(mut self, store: Arc<MetricsStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Restrict tier-4 restarts to `names`
    pub fn with_managed(mut self, mut names: Vec<String>) -> Self {
        self.schedule.sort_by_phase(&mut names);
        self.managed = names;
        self
    }

    /// Queue an automatic request for the worker. Returns false when the
    /// request was dropped (auto recovery off, already queued, queue full).
    pub async fn submit(&self, request: RecoveryRequest) -> bool {
        if request.trigger.is_automatic() && !self.config.auto_recover {
            debug!(agent = %request.agent_name, "Auto recovery disabled, ignoring request");
            return false;
        }
        let mut pending = self.pending.lock().await;
        if pending.contains(&request.agent_name) {
            return false;
        }
        match self.queue_tx.try_send(request.clone()) {
            Ok(()) => {
                pending.insert(request.agent_name);
                true
            }
            Err(e) => {
                warn!(agent = %request.agent_name, "Recovery queue rejected request: {}", e);
                false
            }
        }
    }

    /// Drain the request queue until shutdown
    pub async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut rx) = self.queue_rx.lock().await.take() else {
            warn!("Recovery worker already running");
            return;
        };
        info!("Recovery worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    self.pending.lock().await.remove(&request.agent_name);
                    if let Err(e) = self
                        .attempt_recovery(&request.agent_name, request.tier, request.trigger)
                        .await
                    {
                        warn!(agent = %request.agent_name, "Recovery request rejected: {}", e);
                    }
                }
            }
        }
        info!("Recovery worker stopped");
    }

    /// Run a recovery now.
    ///
    /// Only an unknown agent is an error; cooldown, blocked and failed
    /// outcomes are returned as the recorded action.
    pub async fn attempt_recovery(
        &self,
        agent_name: &str,
        tier: RecoveryTier,
        trigger: RecoveryTrigger,
    ) -> WardenResult<RecoveryAction> {
        let fleet_wide = agent_name == FLEET && tier == RecoveryTier::RestartAll;
        let agent = match self.registry.get(agent_name) {
            Some(agent) => Some(Arc::clone(agent)),
            None if fleet_wide => None,
            None => return Err(WardenError::UnknownAgent(agent_name.to_string())),
        };

        let now = Instant::now();
        let previous = match self.reserve_slot(agent_name, now).await {
            Ok(previous) => previous,
            Err(remaining) => {
                info!(
                    agent = %agent_name,
                    remaining_secs = remaining.as_secs(),
                    "Recovery refused, agent in cooldown"
                );
                let action = self.build_action(
                    agent_name,
                    tier,
                    trigger,
                    Vec::new(),
                    RecoveryResult::Cooldown,
                    0,
                    Some(format!("in cooldown for another {}s", remaining.as_secs())),
                );
                self.record(&action).await;
                return Ok(action);
            }
        };

        // Automatic recoveries go through the agent's breaker: refused while
        // open, and once half-open the recovery itself is the trial.
        let mut trial = false;
        if trigger.is_automatic() && agent.is_some() {
            match self.breakers.try_acquire(agent_name).await {
                Ok(admission) => trial = admission == Admission::Trial,
                Err(_) => {
                    info!(agent = %agent_name, "Recovery refused, circuit breaker open");
                    self.release_slot(agent_name, now, previous).await;
                    let action = self.build_action(
                        agent_name,
                        tier,
                        trigger,
                        Vec::new(),
                        RecoveryResult::Blocked,
                        0,
                        Some("circuit breaker open".to_string()),
                    );
                    self.record(&action).await;
                    return Ok(action);
                }
            }
        }

        info!(agent = %agent_name, tier = %tier, trigger = trigger.as_str(), "Starting recovery");
        let (steps, outcome) = self.execute(agent.as_deref(), tier).await;
        let duration_ms = now.elapsed().as_millis() as u64;

        let (result, error) = match outcome {
            Ok(()) => {
                info!(agent = %agent_name, tier = %tier, duration_ms, "Recovery succeeded");
                (RecoveryResult::Success, None)
            }
            Err(e) => {
                error!(agent = %agent_name, tier = %tier, "Recovery failed: {}", e);
                if trial {
                    self.breakers.record(agent_name, false).await;
                }
                (RecoveryResult::Failed, Some(e.to_string()))
            }
        };
        let action = self.build_action(agent_name, tier, trigger, steps, result, duration_ms, error);
        self.record(&action).await;
        Ok(action)
    }

    /// Claim the cooldown slot for `agent_name`. Returns the previous
    /// timestamp, or the remaining cooldown when the slot is taken.
    async fn reserve_slot(&self, agent_name: &str, now: Instant) -> Result<Option<Instant>, Duration> {
        let mut last = self.last_recovery.lock().await;
        if let Some(at) = last.get(agent_name) {
            let elapsed = now.duration_since(*at);
            if elapsed < self.config.cooldown() {
                return Err(self.config.cooldown() - elapsed);
            }
        }
        Ok(last.insert(agent_name.to_string(), now))
    }

    /// Undo [`Self::reserve_slot`] for a recovery that never ran
    async fn release_slot(&self, agent_name: &str, reserved: Instant, previous: Option<Instant>) {
        let mut last = self.last_recovery.lock().await;
        if last.get(agent_name) != Some(&reserved) {
            return;
        }
        match previous {
            Some(at) => last.insert(agent_name.to_string(), at),
            None => last.remove(agent_name),
        };
    }

    async fn execute(
        &self,
        agent: Option<&AgentDescriptor>,
        tier: RecoveryTier,
    ) -> (Vec<RecoveryStep>, WardenResult<()>) {
        let mut steps = Vec::new();
        let outcome = match agent {
            Some(agent) => self.run_tier(agent, tier, &mut steps).await,
            None => self.restart_all(&mut steps).await,
        };
        (steps, outcome)
    }

    async fn run_tier(
        &self,
        agent: &AgentDescriptor,
        tier: RecoveryTier,
        steps: &mut Vec<RecoveryStep>,
    ) -> WardenResult<()> {
        if tier == RecoveryTier::RestartAll {
            return self.restart_all(steps).await;
        }

        if tier == RecoveryTier::RestartDependencies {
            let mut deps: Vec<String> = self
                .registry
                .transitive_dependencies(&agent.name)
                .into_iter()
                .collect();
            self.schedule.sort_by_phase(&mut deps);
            for dep in &deps {
                let Some(descriptor) = self.registry.get(dep) else {
                    continue;
                };
                debug!(agent = %agent.name, dependency = %dep, "Restarting dependency");
                self.runtime.restart(descriptor).await?;
            }
            steps.push(RecoveryStep::RestartDependencies);
        }

        if tier.number() >= RecoveryTier::ClearState.number() {
            state::clear_state(agent, &self.config.state_root)
                .await
                .map_err(|e| WardenError::Recovery {
                    agent: agent.name.clone(),
                    reason: format!("{:#}", e),
                })?;
            steps.push(RecoveryStep::ClearState);
        }

        self.runtime.restart(agent).await?;
        steps.push(RecoveryStep::Restart);
        Ok(())
    }

    async fn restart_all(&self, steps: &mut Vec<RecoveryStep>) -> WardenResult<()> {
        warn!(agents = self.managed.len(), "Restarting every managed agent");
        for name in &self.managed {
            if let Some(agent) = self.registry.get(name) {
                self.runtime.restart(agent).await?;
            }
        }
        steps.push(RecoveryStep::RestartAll);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_action(
        &self,
        agent_name: &str,
        tier: RecoveryTier,
        trigger: RecoveryTrigger,
        actions: Vec<RecoveryStep>,
        result: RecoveryResult,
        duration_ms: u64,
        error: Option<String>,
    ) -> RecoveryAction {
        RecoveryAction {
            id: Uuid::new_v4().to_string(),
            agent_name: agent_name.to_string(),
            tier,
            actions,
            result,
            trigger,
            timestamp: Utc::now(),
            duration_ms,
            error,
        }
    }

    async fn record(&self, action: &RecoveryAction) {
        {
            let mut audit = self.audit.write().await;
            audit.push_back(action.clone());
            while audit.len() > self.config.audit_len.max(1) {
                audit.pop_front();
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_recovery(action);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.record_recovery(action) {
                warn!("Failed to persist recovery action: {}", e);
            }
            let metadata = serde_json::json!({
                "result": action.result.as_str(),
                "trigger": action.trigger.as_str(),
                "actions": action.actions,
                "error": action.error,
            });
            if let Err(e) = store.record_local(
                &action.agent_name,
                METRIC_RECOVERY,
                action.tier.number() as f64,
                metadata,
            ) {
                warn!("Failed to export recovery action: {}", e);
            }
        }
    }

    /// Newest first
    pub async fn history(&self, limit: usize) -> Vec<RecoveryAction> {
        self.audit
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

//! Daemon lifecycle: build components, start the fleet phase by phase, run
//! the background loops, shut everything down.

use crate::config::{BreakerConfig, WardenConfig};
use crate::error::{WardenError, WardenResult};
use crate::health::{CheckRegistry, FileReadyStore, HealthMonitor, ReadySignalStore};
use crate::launcher::{AgentRuntime, ProcessLauncher};
use crate::network::{CrossNodeCoordinator, FleetMetrics};
use crate::predictor::{PredictiveFailureAnalyzer, FLEET};
use crate::recovery::{RecoveryOrchestrator, RecoveryRequest};
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::scheduler::{schedule, Phase, Schedule};
use crate::server::{self, AppState};
use crate::storage::{MetricsStore, METRIC_FAILURE_PROBABILITY, METRIC_HEALTH};
use crate::supervisor::BreakerTable;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use warden_common::{AlertSeverity, HealthRecord, HealthStatus, RecoveryTier, RecoveryTrigger};

/// Command-line selection of what to manage
#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    /// Only agents of this group
    pub group: Option<String>,
    /// Only the first N phases
    pub phases: Option<usize>,
    /// Skip launching; monitor an already-running fleet
    pub no_launch: bool,
}

pub struct Warden {
    config: WardenConfig,
    options: StartupOptions,
    registry: Arc<AgentRegistry>,
    /// Managed agents
    schedule: Arc<Schedule>,
    monitor: HealthMonitor,
    breakers: Arc<BreakerTable>,
    analyzer: Arc<PredictiveFailureAnalyzer>,
    launcher: Arc<ProcessLauncher>,
    recovery: Arc<RecoveryOrchestrator>,
    coordinator: Arc<CrossNodeCoordinator>,
    store: Arc<MetricsStore>,
    metrics: Arc<FleetMetrics>,
    shutdown_tx: watch::Sender<bool>,
    started_at: Instant,
}

impl Warden {
    /// Validate the configuration and wire every component.
    ///
    /// Configuration errors (cycles, unknown dependencies, missing scripts)
    /// surface here, before anything is launched.
    pub async fn build(config: WardenConfig, options: StartupOptions) -> Result<Self> {
        let registry = AgentRegistry::from_specs(&config.agents, &config.launcher, !options.no_launch)?;
        let full = schedule(&registry)?;

        let mut managed = match &options.group {
            Some(group) => full.only_group(group),
            None => full.clone(),
        };
        if let Some(count) = options.phases {
            managed = managed.first_phases(count);
        }
        if managed.is_empty() {
            return Err(WardenError::Configuration("no agents selected to manage".to_string()).into());
        }
        info!(
            agents = managed.ordered_agents().len(),
            phases = managed.len(),
            "Startup plan ready"
        );
        for phase in managed.phases() {
            debug!(phase = phase.index, agents = ?phase.names(), "Phase");
        }

        let registry = Arc::new(registry);
        let full = Arc::new(full);
        let managed = Arc::new(managed);
        let managed_agents = managed.ordered_agents();

        let metrics = Arc::new(FleetMetrics::new());
        let store = Arc::new(
            MetricsStore::open_at(&config.storage.db_path, &config.node.name, &config.node.environment)
                .context("Failed to open metrics store")?,
        );

        let breakers = Arc::new(
            BreakerTable::new(config.breaker.clone())
                .with_metrics(metrics.clone())
                .with_store(store.clone()),
        );
        for agent in &managed_agents {
            breakers.register(&agent.name).await;
        }

        let ready_store: Arc<dyn ReadySignalStore> = Arc::new(FileReadyStore::new(&config.ready_store.dir));
        let checks = CheckRegistry::for_agents(
            &managed_agents,
            &config.health.agent_host,
            config.health.check_timeout(),
        );
        let monitor = HealthMonitor::new(config.health.clone(), ready_store, checks);

        let analyzer = Arc::new(PredictiveFailureAnalyzer::new(config.predictor.clone()));
        let launcher = Arc::new(ProcessLauncher::new(config.launcher.clone()));
        let runtime: Arc<dyn AgentRuntime> = launcher.clone();

        let recovery = Arc::new(
            RecoveryOrchestrator::new(
                config.recovery.clone(),
                registry.clone(),
                full,
                runtime,
                breakers.clone(),
            )
            .with_managed(managed_agents.iter().map(|a| a.name.clone()).collect())
            .with_metrics(metrics.clone())
            .with_store(store.clone()),
        );

        let coordinator = Arc::new(
            CrossNodeCoordinator::new(
                config.peer.clone(),
                config.node.name.clone(),
                store.clone(),
                breakers.clone(),
            )?
            .with_metrics(metrics.clone()),
        );
        if coordinator.is_enabled() {
            let peer_breaker = BreakerConfig {
                request_timeout_secs: config.peer.request_timeout_secs,
                ..config.breaker.clone()
            };
            breakers
                .register_with(&coordinator.breaker_target(), &peer_breaker)
                .await;
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            options,
            registry,
            schedule: managed,
            monitor,
            breakers,
            analyzer,
            launcher,
            recovery,
            coordinator,
            store,
            metrics,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    pub fn schedule(&self) -> &Arc<Schedule> {
        &self.schedule
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            node: self.config.node.clone(),
            registry: self.registry.clone(),
            schedule: self.schedule.clone(),
            monitor: self.monitor.clone(),
            breakers: self.breakers.clone(),
            analyzer: self.analyzer.clone(),
            recovery: self.recovery.clone(),
            coordinator: self.coordinator.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            start_time: self.started_at,
        })
    }

    /// Launch and verify each phase in order.
    ///
    /// A required agent that fails to launch or never becomes healthy aborts
    /// startup; every phase started so far is torn down in reverse order.
    pub async fn start_fleet(&self) -> WardenResult<()> {
        if self.options.no_launch {
            info!("Launch disabled, monitoring the running fleet");
            return Ok(());
        }

        let settle = self.config.launcher.settle_interval();
        let retries = self.config.launcher.retries;
        let mut started: Vec<&Phase> = Vec::new();

        for phase in self.schedule.phases() {
            let results = self.launcher.launch_phase(phase).await;
            started.push(phase);

            let mut launch_failure = None;
            for (name, result) in results {
                let Err(e) = result else { continue };
                let required = self.registry.get(&name).map(|a| a.required).unwrap_or(true);
                if required {
                    error!(agent = %name, phase = phase.index, "Required agent failed to launch: {}", e);
                    launch_failure.get_or_insert(e);
                } else {
                    warn!(agent = %name, phase = phase.index, "Optional agent failed to launch: {}", e);
                }
            }
            if let Some(err) = launch_failure {
                self.teardown(&started).await;
                return Err(err);
            }

            debug!(phase = phase.index, "Waiting {:?} for agents to settle", settle);
            tokio::time::sleep(settle).await;

            let report = self.monitor.verify_phase_health(phase, retries, settle).await;
            for record in report.records.values() {
                self.metrics.record_health(&record.agent_name, record.status);
            }
            if let Some(err) = report.into_error() {
                error!(phase = phase.index, "Startup aborted: {}", err);
                self.teardown(&started).await;
                return Err(err);
            }
            self.metrics.phases_started.set(phase.index as i64 + 1);
            info!(phase = phase.index, "Phase started");
        }

        info!(phases = self.schedule.len(), "Fleet started");
        Ok(())
    }

    async fn teardown(&self, phases: &[&Phase]) {
        warn!(phases = phases.len(), "Tearing down started phases");
        for phase in phases.iter().rev() {
            self.launcher.stop_all(&phase.names()).await;
        }
    }

    /// One health poll: record, feed breakers and the analyzer, persist and
    /// request tier-1 recovery for unhealthy agents
    pub async fn poll_health(&self) -> Vec<HealthRecord> {
        let agents = self.schedule.ordered_agents();
        let records = self.monitor.check_all(&agents).await;

        for record in &records {
            let name = record.agent_name.as_str();
            self.metrics.record_health(name, record.status);

            // UNKNOWN means the check machinery failed, not the agent
            if record.status != HealthStatus::Unknown {
                self.analyzer.record_sample(name, record.status).await;
                self.breakers.observe(name, record.status.is_operational()).await;
            }

            let metadata = serde_json::json!({
                "status": record.status.as_str(),
                "checks": record.checks,
                "error": record.error_message,
            });
            if let Err(e) = self.store.record_local(name, METRIC_HEALTH, record.status.sample_value(), metadata) {
                warn!(agent = %name, "Failed to persist health record: {}", e);
            }

            if record.status == HealthStatus::Unhealthy {
                self.recovery
                    .submit(RecoveryRequest::new(name, RecoveryTier::Restart, RecoveryTrigger::HealthCheck))
                    .await;
            }
        }
        records
    }

    /// One analysis cycle; critical agents get tier 2, a fleet-wide
    /// critical state gets tier 4
    pub async fn analyze(&self) {
        let report = self.analyzer.analyze(self.schedule.ordered_agents().len()).await;

        for prediction in &report.predictions {
            self.metrics
                .set_failure_probability(&prediction.agent_name, prediction.probability);
            let metadata = serde_json::json!({
                "confidence": prediction.confidence,
                "z_score": prediction.z_score,
                "trend_slope": prediction.trend_slope,
                "samples": prediction.samples,
            });
            if let Err(e) = self.store.record_local(
                &prediction.agent_name,
                METRIC_FAILURE_PROBABILITY,
                prediction.probability,
                metadata,
            ) {
                warn!(agent = %prediction.agent_name, "Failed to persist prediction: {}", e);
            }
        }
        for alert in &report.alerts {
            self.metrics.record_alert(&alert.source, alert.severity);
            if alert.severity == AlertSeverity::Critical {
                warn!(agent = %alert.agent_name, "{}", alert.message);
            }
        }

        if report.system_wide {
            self.recovery
                .submit(RecoveryRequest::new(FLEET, RecoveryTier::RestartAll, RecoveryTrigger::SystemWide))
                .await;
            return;
        }
        for agent in report.critical_agents() {
            self.recovery
                .submit(RecoveryRequest::new(agent, RecoveryTier::ClearState, RecoveryTrigger::Predictive))
                .await;
        }
    }

    fn purge(&self) {
        match self.store.purge_older_than(self.config.storage.retention_days) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Purged expired metrics"),
            Err(e) => warn!("Retention purge failed: {}", e),
        }
    }

    /// Spawn the background loops onto `tasks`
    pub fn spawn_loops(self: &Arc<Self>, tasks: &mut JoinSet<()>) {
        let warden = Arc::clone(self);
        tasks.spawn(every(
            "health",
            self.config.health.poll_interval(),
            self.shutdown_tx.subscribe(),
            move || {
                let warden = warden.clone();
                async move {
                    warden.poll_health().await;
                }
            },
        ));

        let warden = Arc::clone(self);
        tasks.spawn(every(
            "analysis",
            self.config.predictor.analysis_interval(),
            self.shutdown_tx.subscribe(),
            move || {
                let warden = warden.clone();
                async move { warden.analyze().await }
            },
        ));

        let warden = Arc::clone(self);
        tasks.spawn(every(
            "purge",
            Duration::from_secs(self.config.storage.purge_interval_secs.max(1)),
            self.shutdown_tx.subscribe(),
            move || {
                let warden = warden.clone();
                async move { warden.purge() }
            },
        ));

        tasks.spawn(self.recovery.clone().run_worker(self.shutdown_tx.subscribe()));
        tasks.spawn(self.coordinator.clone().run(self.shutdown_tx.subscribe()));
    }

    /// Start the fleet, serve the API and run until `stop` resolves.
    ///
    /// `stop` is watched from the start: resolving it while the fleet is
    /// still starting stops whatever was launched so far.
    pub async fn run<S>(self: Arc<Self>, listener: TcpListener, stop: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(stop);
        tokio::select! {
            started = self.start_fleet() => started?,
            _ = &mut stop => {
                warn!("Shutdown requested during startup");
                self.shutdown().await;
                return Ok(());
            }
        }

        let mut tasks = JoinSet::new();
        self.spawn_loops(&mut tasks);

        let server = tokio::spawn(server::run(
            self.app_state(),
            listener,
            self.shutdown_tx.subscribe(),
        ));

        stop.await;
        info!("Shutdown requested");
        let _ = self.shutdown_tx.send(true);

        // Loops finish their current tick first, so an in-flight recovery
        // cannot relaunch an agent after it was stopped
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.stop_fleet().await;

        match server.await {
            Ok(result) => result?,
            Err(e) => warn!("HTTP server task ended abnormally: {}", e),
        }
        info!("Warden stopped");
        Ok(())
    }

    /// Signal every loop and stop launched agents in reverse phase order
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.stop_fleet().await;
    }

    async fn stop_fleet(&self) {
        if self.options.no_launch {
            return;
        }
        let mut names: Vec<String> = self
            .schedule
            .ordered_agents()
            .iter()
            .map(|a| a.name.clone())
            .collect();
        names.reverse();
        self.launcher.stop_all(&names).await;
    }

    pub fn managed_agents(&self) -> Vec<Arc<AgentDescriptor>> {
        self.schedule.ordered_agents()
    }
}

/// Run `tick` every `period` until shutdown
async fn every<F, Fut>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    debug!(task = name, period_secs = period.as_secs_f64(), "Loop started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => tick().await,
        }
    }
    debug!(task = name, "Loop stopped");
}

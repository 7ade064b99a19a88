//! Startup ordering, phase gating and dependency-aware recovery

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use warden_common::{RecoveryResult, RecoveryStep, RecoveryTier, RecoveryTrigger};
use wardend::config::{BreakerConfig, HealthConfig, RecoveryConfig};
use wardend::health::{
    ready_key, CheckRegistry, HealthMonitor, MemoryReadyStore, ReadySignal, ReadySignalStore,
    READY_CHECK,
};
use wardend::launcher::AgentRuntime;
use wardend::recovery::RecoveryOrchestrator;
use wardend::registry::{AgentDescriptor, AgentRegistry};
use wardend::scheduler::schedule;
use wardend::supervisor::BreakerTable;
use wardend::{WardenError, WardenResult};

#[test]
fn test_random_dags_respect_dependency_order() {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let count = rng.gen_range(1..25);
        let mut agents = Vec::new();
        for i in 0..count {
            let mut agent = AgentDescriptor::new(format!("agent-{}", i), 7000 + i as u16);
            // Only lower indices, so the graph is acyclic
            for j in 0..i {
                if rng.gen_bool(0.2) {
                    agent = agent.depends_on(format!("agent-{}", j));
                }
            }
            agents.push(agent);
        }

        let registry = AgentRegistry::from_descriptors(agents).unwrap();
        let plan = schedule(&registry).unwrap();
        assert_eq!(plan.ordered_agents().len(), count);

        for agent in registry.iter() {
            let phase = plan.phase_of(&agent.name).unwrap();
            for dep in &agent.dependencies {
                assert!(
                    plan.phase_of(dep).unwrap() < phase,
                    "{} must start before {}",
                    dep,
                    agent.name
                );
            }
        }
    }
}

#[test]
fn test_cycle_blocks_every_phase() {
    let registry = AgentRegistry::from_descriptors(vec![
        AgentDescriptor::new("store", 7000),
        AgentDescriptor::new("memory", 7100).depends_on("router"),
        AgentDescriptor::new("router", 7200).depends_on("memory"),
        AgentDescriptor::new("ui", 7300).depends_on("router"),
    ])
    .unwrap();

    match schedule(&registry) {
        Err(WardenError::DependencyCycle { mut agents }) => {
            agents.sort();
            assert_eq!(agents, vec!["memory", "router"]);
        }
        other => panic!("expected a cycle, got {:?}", other.map(|s| s.len())),
    }
}

async fn publish_ready(store: &MemoryReadyStore, agent: &str, port: u16) {
    let signal = serde_json::to_value(ReadySignal::new("ready", port)).unwrap();
    store
        .set(&ready_key(agent), signal, Duration::from_secs(300))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_phase_gate_names_the_agent_that_never_came_up() {
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let ports = [
        first.local_addr().unwrap().port(),
        second.local_addr().unwrap().port(),
        dead_port,
    ];
    let registry = AgentRegistry::from_descriptors(vec![
        AgentDescriptor::new("asr", ports[0]),
        AgentDescriptor::new("memory", ports[1]),
        AgentDescriptor::new("translator", ports[2]),
    ])
    .unwrap();
    let plan = schedule(&registry).unwrap();
    assert_eq!(plan.len(), 1);

    let store = Arc::new(MemoryReadyStore::new());
    publish_ready(&store, "asr", ports[0]).await;
    publish_ready(&store, "memory", ports[1]).await;
    publish_ready(&store, "translator", ports[2]).await;

    let config = HealthConfig {
        check_timeout_secs: 1,
        ..HealthConfig::default()
    };
    let monitor = HealthMonitor::new(config, store, CheckRegistry::new());
    let report = monitor
        .verify_phase_health(&plan.phases()[0], 5, Duration::from_millis(10))
        .await;

    assert!(!report.passed());
    assert_eq!(report.attempts, 5);
    assert_eq!(report.failed_required, vec!["translator"]);
    assert!(report.records["translator"].checks[READY_CHECK]);

    match report.into_error() {
        Some(WardenError::PhaseUnhealthy { phase, agents }) => {
            assert_eq!(phase, 0);
            assert_eq!(agents, vec!["translator"]);
        }
        other => panic!("expected PhaseUnhealthy, got {:?}", other),
    }
}

#[tokio::test]
async fn test_optional_agent_never_fails_the_phase() {
    let up = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_port = up.local_addr().unwrap().port();
    let registry = AgentRegistry::from_descriptors(vec![
        AgentDescriptor::new("store", up_port),
        AgentDescriptor::new("telemetry", 1).optional(),
    ])
    .unwrap();
    let plan = schedule(&registry).unwrap();

    let store = Arc::new(MemoryReadyStore::new());
    publish_ready(&store, "store", up_port).await;
    let monitor = HealthMonitor::new(HealthConfig::default(), store, CheckRegistry::new());
    let report = monitor
        .verify_phase_health(&plan.phases()[0], 2, Duration::from_millis(5))
        .await;

    assert!(report.passed());
    assert_eq!(report.failed_optional, vec!["telemetry"]);
}

#[derive(Default)]
struct RecordingRuntime {
    starts: Mutex<Vec<String>>,
}

#[async_trait]
impl AgentRuntime for RecordingRuntime {
    async fn start(&self, agent: &AgentDescriptor) -> WardenResult<()> {
        self.starts.lock().await.push(agent.name.clone());
        Ok(())
    }

    async fn stop(&self, _agent: &AgentDescriptor) -> WardenResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_tier3_restarts_dependencies_first() {
    let temp = TempDir::new().unwrap();
    let registry = AgentRegistry::from_descriptors(vec![
        AgentDescriptor::new("store", 7000),
        AgentDescriptor::new("cache", 7050),
        AgentDescriptor::new("memory", 7100).depends_on("store"),
        AgentDescriptor::new("router", 7200)
            .depends_on("memory")
            .depends_on("cache"),
        AgentDescriptor::new("ui", 7300).depends_on("router"),
    ])
    .unwrap();
    let plan = schedule(&registry).unwrap();
    let runtime = Arc::new(RecordingRuntime::default());

    let orchestrator = RecoveryOrchestrator::new(
        RecoveryConfig {
            state_root: temp.path().to_path_buf(),
            ..RecoveryConfig::default()
        },
        Arc::new(registry),
        Arc::new(plan),
        runtime.clone(),
        Arc::new(BreakerTable::new(BreakerConfig::default())),
    );

    let action = orchestrator
        .attempt_recovery("router", RecoveryTier::RestartDependencies, RecoveryTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(action.result, RecoveryResult::Success);
    assert_eq!(action.actions, RecoveryTier::RestartDependencies.steps());
    assert_eq!(
        action.actions,
        vec![
            RecoveryStep::RestartDependencies,
            RecoveryStep::ClearState,
            RecoveryStep::Restart
        ]
    );

    // Phase 0 (cache, store) before phase 1 (memory) before the agent itself;
    // the dependent `ui` is untouched
    let starts = runtime.starts.lock().await.clone();
    assert_eq!(starts, vec!["cache", "store", "memory", "router"]);
    assert!(temp.path().join("router/cache").exists());
}

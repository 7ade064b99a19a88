//! Breaker timing and failure prediction, end to end through the public API

use approx::assert_abs_diff_eq;
use std::sync::Arc;
use std::time::Duration;
use warden_common::{AlertSeverity, CircuitState, HealthStatus, RecoveryTier};
use wardend::config::{BreakerConfig, PredictorConfig};
use wardend::predictor::{failure_probability, PredictiveFailureAnalyzer};
use wardend::supervisor::BreakerTable;
use wardend::{WardenError, WardenResult};

#[tokio::test(start_paused = true)]
async fn test_breaker_rejects_then_admits_one_trial() {
    let table = BreakerTable::new(BreakerConfig {
        failure_threshold: 5,
        timeout_secs: 30,
        ..BreakerConfig::default()
    });

    for _ in 0..5 {
        let result: WardenResult<()> = table
            .call("memory", async { Err(WardenError::Sync("boom".to_string())) })
            .await;
        assert!(matches!(result, Err(WardenError::Sync(_))));
    }
    assert_eq!(table.state("memory").await, CircuitState::Open);

    let rejected: WardenResult<u32> = table.call("memory", async { Ok(1) }).await;
    assert!(matches!(rejected, Err(WardenError::CircuitOpen { .. })));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(table.state("memory").await, CircuitState::HalfOpen);
    table.try_acquire("memory").await.unwrap();
    assert!(table.try_acquire("memory").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_breakers_do_not_share_failures() {
    let table = Arc::new(BreakerTable::new(BreakerConfig {
        failure_threshold: 2,
        ..BreakerConfig::default()
    }));
    table.observe("asr", false).await;
    table.observe("asr", false).await;
    table.observe("memory", true).await;

    assert!(table.is_open("asr").await);
    assert!(!table.is_open("memory").await);
    assert_eq!(table.open_count().await, 1);
}

#[test]
fn test_probability_needs_minimum_history() {
    let config = PredictorConfig::default();
    let (p, _, _) = failure_probability(&[0.0; 9], &config);
    assert_eq!(p, 0.0);
}

#[test]
fn test_all_healthy_history_scores_zero() {
    let config = PredictorConfig::default();
    for len in [10, 17, 50, 100] {
        let (p, z, slope) = failure_probability(&vec![1.0; len], &config);
        assert_abs_diff_eq!(p, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(z, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(slope, 0.0, epsilon = 1e-9);
    }
}

#[tokio::test]
async fn test_degrading_agent_gets_tier2_recommendation() {
    let analyzer = PredictiveFailureAnalyzer::new(PredictorConfig::default());
    for _ in 0..15 {
        analyzer.record_sample("memory", HealthStatus::Healthy).await;
        analyzer.record_sample("asr", HealthStatus::Healthy).await;
    }
    for _ in 0..5 {
        analyzer.record_sample("memory", HealthStatus::Unhealthy).await;
        analyzer.record_sample("asr", HealthStatus::Healthy).await;
    }

    let report = analyzer.analyze(2).await;
    assert_eq!(report.critical_agents(), vec!["memory"]);
    assert!(!report.system_wide);

    let alert = report
        .alerts
        .iter()
        .find(|a| a.agent_name == "memory")
        .unwrap();
    assert_eq!(alert.severity, AlertSeverity::Critical);
    assert_eq!(alert.recommended_tier, Some(RecoveryTier::ClearState));
    assert_abs_diff_eq!(analyzer.probability("asr").await, 0.0, epsilon = 1e-9);
}

//! Predictive failure analysis
//!
//! Each health result becomes a sample (1.0 healthy, 0.5 degraded, 0.0
//! otherwise) in a rolling per-agent window. Every analysis cycle scores each
//! agent from three signals:
//! - how far the latest sample sits below the recent mean (z-score)
//! - the slope over the last few samples
//! - the share of recent samples that are failing
//!
//! High scores raise alerts that drive tier-2 recovery.

use crate::config::PredictorConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use warden_common::{Alert, AlertSeverity, HealthStatus, RecoveryTier};

/// Alert source for analyzer alerts
pub const SOURCE: &str = "predictive_analyzer";

/// Pseudo-agent name used for fleet-wide alerts
pub const FLEET: &str = "fleet";

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub agent_name: String,
    pub probability: f64,
    pub confidence: f64,
    pub samples: usize,
    pub z_score: f64,
    pub trend_slope: f64,
    pub computed_at: DateTime<Utc>,
}

/// Result of one analysis cycle
#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub predictions: Vec<Prediction>,
    pub alerts: Vec<Alert>,
    /// Critical alerts for more than half of the fleet
    pub system_wide: bool,
}

impl AnalysisReport {
    pub fn critical_agents(&self) -> Vec<String> {
        self.alerts
            .iter()
            .filter(|a| a.severity == AlertSeverity::Critical && a.agent_name != FLEET)
            .map(|a| a.agent_name.clone())
            .collect()
    }
}

/// Least-squares slope of `values` against their index
pub fn linear_slope(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, &y) in values.iter().enumerate() {
        let x = i as f64;
        numerator += (x - x_mean) * (y - y_mean);
        denominator += (x - x_mean).powi(2);
    }

    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn tail(values: &[f64], n: usize) -> &[f64] {
    &values[values.len().saturating_sub(n)..]
}

/// Failure probability for a sample history (oldest first).
///
/// Returns `(probability, z_score, slope)`. Fewer than `min_samples` samples
/// always score 0.0.
pub fn failure_probability(samples: &[f64], config: &PredictorConfig) -> (f64, f64, f64) {
    if samples.is_empty() || samples.len() < config.min_samples {
        return (0.0, 0.0, 0.0);
    }

    let recent = tail(samples, config.stats_window.max(1));
    let (mean, std) = mean_and_std(recent);
    let latest = samples[samples.len() - 1];
    let z_score = if std == 0.0 { 0.0 } else { (mean - latest) / std };

    let trend = tail(samples, config.trend_window.max(1));
    let slope = linear_slope(trend);
    let trend_penalty = if slope < 0.0 { (-slope * 2.0).min(1.0) } else { 0.0 };

    let failing_share = trend.iter().map(|v| 1.0 - v).sum::<f64>() / trend.len() as f64;

    let z_component = if config.z_threshold > 0.0 {
        (z_score.max(0.0) / config.z_threshold).min(1.0)
    } else {
        0.0
    };

    let probability = (z_component * 0.7 + trend_penalty * 0.3 + failing_share).clamp(0.0, 1.0);
    (probability, z_score, slope)
}

pub struct PredictiveFailureAnalyzer {
    config: PredictorConfig,
    windows: RwLock<HashMap<String, VecDeque<f64>>>,
    predictions: RwLock<HashMap<String, Prediction>>,
    alerts: RwLock<Vec<Alert>>,
}

impl PredictiveFailureAnalyzer {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
            predictions: RwLock::new(HashMap::new()),
            alerts: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub async fn record_sample(&self, agent: &str, status: HealthStatus) {
        self.record_value(agent, status.sample_value()).await;
    }

    pub async fn record_value(&self, agent: &str, value: f64) {
        let mut windows = self.windows.write().await;
        let window = windows.entry(agent.to_string()).or_default();
        window.push_back(value.clamp(0.0, 1.0));
        while window.len() > self.config.window_size.max(1) {
            window.pop_front();
        }
    }

    pub async fn sample_count(&self, agent: &str) -> usize {
        self.windows
            .read()
            .await
            .get(agent)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    /// Score one agent from its current window
    pub async fn predict(&self, agent: &str) -> Prediction {
        let samples: Vec<f64> = self
            .windows
            .read()
            .await
            .get(agent)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default();
        self.score(agent, &samples)
    }

    fn score(&self, agent: &str, samples: &[f64]) -> Prediction {
        let (probability, z_score, trend_slope) = failure_probability(samples, &self.config);
        let confidence = (samples.len() as f64 / self.config.window_size.max(1) as f64).min(1.0);
        Prediction {
            agent_name: agent.to_string(),
            probability,
            confidence,
            samples: samples.len(),
            z_score,
            trend_slope,
            computed_at: Utc::now(),
        }
    }

    /// Run one analysis cycle over every agent with samples.
    ///
    /// `fleet_size` is the number of managed agents used for the system-wide
    /// rule. Replaces the current alert set.
    pub async fn analyze(&self, fleet_size: usize) -> AnalysisReport {
        let snapshot: Vec<(String, Vec<f64>)> = self
            .windows
            .read()
            .await
            .iter()
            .map(|(name, w)| (name.clone(), w.iter().copied().collect()))
            .collect();

        let mut report = AnalysisReport::default();
        for (agent, samples) in snapshot {
            let prediction = self.score(&agent, &samples);
            if samples.len() >= self.config.min_samples {
                if let Some(alert) = self.alert_for(&prediction) {
                    report.alerts.push(alert);
                }
            }
            report.predictions.push(prediction);
        }
        report.predictions.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        report.alerts.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));

        let critical = report.critical_agents().len();
        if fleet_size > 0 && critical * 2 > fleet_size {
            warn!(
                critical,
                fleet_size, "Critical failure risk across most of the fleet"
            );
            report.system_wide = true;
            report.alerts.push(Alert {
                source: SOURCE.to_string(),
                agent_name: FLEET.to_string(),
                severity: AlertSeverity::Critical,
                message: format!("{} of {} agents at critical failure risk", critical, fleet_size),
                probability: None,
                recommended_tier: Some(RecoveryTier::RestartAll),
                raised_at: Utc::now(),
            });
        }

        {
            let mut predictions = self.predictions.write().await;
            for prediction in &report.predictions {
                predictions.insert(prediction.agent_name.clone(), prediction.clone());
            }
        }
        *self.alerts.write().await = report.alerts.clone();

        debug!(
            agents = report.predictions.len(),
            alerts = report.alerts.len(),
            "Analysis cycle complete"
        );
        report
    }

    fn alert_for(&self, prediction: &Prediction) -> Option<Alert> {
        let (severity, recommended_tier) = if prediction.probability >= self.config.critical_threshold {
            (AlertSeverity::Critical, Some(RecoveryTier::ClearState))
        } else if prediction.probability >= self.config.warning_threshold {
            (AlertSeverity::Warning, None)
        } else {
            return None;
        };

        Some(Alert {
            source: SOURCE.to_string(),
            agent_name: prediction.agent_name.clone(),
            severity,
            message: format!(
                "failure probability {:.2} (confidence {:.2}, trend {:+.3})",
                prediction.probability, prediction.confidence, prediction.trend_slope
            ),
            probability: Some(prediction.probability),
            recommended_tier,
            raised_at: prediction.computed_at,
        })
    }

    /// Probability from the last analysis cycle
    pub async fn probability(&self, agent: &str) -> f64 {
        self.predictions
            .read()
            .await
            .get(agent)
            .map(|p| p.probability)
            .unwrap_or(0.0)
    }

    pub async fn predictions(&self) -> Vec<Prediction> {
        let mut predictions: Vec<Prediction> =
            self.predictions.read().await.values().cloned().collect();
        predictions.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        predictions
    }

    /// Alerts from the last analysis cycle
    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_slope() {
        assert_relative_eq!(linear_slope(&[1.0, 1.0, 1.0]), 0.0);
        assert_relative_eq!(linear_slope(&[0.0, 1.0, 2.0, 3.0]), 1.0);
        assert_relative_eq!(linear_slope(&[1.0, 0.75, 0.5, 0.25, 0.0]), -0.25);
        assert_relative_eq!(linear_slope(&[0.5]), 0.0);
    }

    #[test]
    fn test_below_min_samples_is_zero() {
        let config = PredictorConfig::default();
        let (p, _, _) = failure_probability(&[0.0; 9], &config);
        assert_relative_eq!(p, 0.0);
    }

    #[test]
    fn test_all_healthy_is_zero() {
        let config = PredictorConfig::default();
        for len in [10, 37, 100] {
            let (p, z, slope) = failure_probability(&vec![1.0; len], &config);
            assert_relative_eq!(p, 0.0);
            assert_relative_eq!(z, 0.0);
            assert_relative_eq!(slope, 0.0);
        }
    }

    #[test]
    fn test_sustained_outage_is_critical() {
        let config = PredictorConfig::default();
        let mut samples = vec![1.0; 20];
        samples.extend([0.0; 10]);
        let (p, _, _) = failure_probability(&samples, &config);
        assert!(p >= config.critical_threshold);
    }

    #[test]
    fn test_sudden_drop_scores_high() {
        let config = PredictorConfig::default();
        let mut samples = vec![1.0; 19];
        samples.push(0.0);
        let (p, z, slope) = failure_probability(&samples, &config);
        assert!(z > config.z_threshold);
        assert!(slope < 0.0);
        assert!(p >= config.critical_threshold, "p = {}", p);
    }

    #[tokio::test]
    async fn test_confidence_and_window_bound() {
        let analyzer = PredictiveFailureAnalyzer::new(PredictorConfig {
            window_size: 20,
            ..PredictorConfig::default()
        });
        for _ in 0..10 {
            analyzer.record_sample("memory", HealthStatus::Healthy).await;
        }
        assert_relative_eq!(analyzer.predict("memory").await.confidence, 0.5);

        for _ in 0..30 {
            analyzer.record_sample("memory", HealthStatus::Healthy).await;
        }
        assert_eq!(analyzer.sample_count("memory").await, 20);
        assert_relative_eq!(analyzer.predict("memory").await.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_system_wide_alert_when_most_agents_critical() {
        let analyzer = PredictiveFailureAnalyzer::new(PredictorConfig::default());
        for agent in ["a", "b", "c"] {
            for _ in 0..10 {
                analyzer.record_sample(agent, HealthStatus::Healthy).await;
            }
        }
        for agent in ["a", "b"] {
            for _ in 0..10 {
                analyzer.record_sample(agent, HealthStatus::Unhealthy).await;
            }
        }

        let report = analyzer.analyze(3).await;
        assert_eq!(report.critical_agents(), vec!["a", "b"]);
        assert!(report.system_wide);
        let fleet = report.alerts.iter().find(|a| a.agent_name == FLEET).unwrap();
        assert_eq!(fleet.recommended_tier, Some(RecoveryTier::RestartAll));

        // Two of five is not a majority
        let report = analyzer.analyze(5).await;
        assert!(!report.system_wide);
        assert_eq!(analyzer.alerts().await.len(), 2);
    }
}

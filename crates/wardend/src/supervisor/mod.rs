//! Failure isolation through circuit breakers.
//!
//! One breaker per agent plus one for the peer link. Health results feed the
//! agent breakers; peer calls go through [`BreakerTable::call`]. Every
//! transition is logged, counted and persisted as a `circuit_state` metric so
//! the peer sees it too.

pub mod circuit;
pub mod registry;

pub use circuit::{Admission, CircuitBreaker, Transition};
pub use registry::BreakerRegistry;

use crate::config::BreakerConfig;
use crate::error::{WardenError, WardenResult};
use crate::network::metrics::FleetMetrics;
use crate::storage::{MetricsStore, METRIC_CIRCUIT_STATE};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use warden_common::{BreakerView, CircuitState};

/// Shared breaker table
pub struct BreakerTable {
    registry: Arc<RwLock<BreakerRegistry>>,
    metrics: Option<Arc<FleetMetrics>>,
    store: Option<Arc<MetricsStore>>,
}

impl BreakerTable {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            registry: Arc::new(RwLock::new(BreakerRegistry::new(config))),
            metrics: None,
            store: None,
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

    pub async fn register(&self, target: &str) {
        self.registry.write().await.register(target);
        if let Some(metrics) = &self.metrics {
            metrics.set_breaker_state(target, CircuitState::Closed);
        }
    }

    pub async fn register_with(&self, target: &str, config: &BreakerConfig) {
        self.registry.write().await.register_with(target, config);
        if let Some(metrics) = &self.metrics {
            metrics.set_breaker_state(target, CircuitState::Closed);
        }
    }

    pub async fn try_acquire(&self, target: &str) -> Result<Admission, WardenError> {
        self.update(|registry| registry.try_acquire(target)).await
    }

    pub async fn record(&self, target: &str, success: bool) {
        self.update(|registry| {
            if success {
                registry.record_success(target);
            } else {
                registry.record_failure(target);
            }
        })
        .await
    }

    /// Feed a health observation. Dropped while the circuit is open; see
    /// [`CircuitBreaker::observe`] for the half-open rules.
    pub async fn observe(&self, target: &str, success: bool) {
        self.update(|registry| registry.observe(target, success)).await
    }

    /// Run `call` through the breaker for `target`.
    ///
    /// Rejected with [`WardenError::CircuitOpen`] without running when the
    /// circuit is open. Calls exceeding the request timeout fail with
    /// [`WardenError::Timeout`] and count as failures.
    pub async fn call<T, F>(&self, target: &str, call: F) -> WardenResult<T>
    where
        F: Future<Output = WardenResult<T>>,
    {
        let timeout = self
            .update(|registry| {
                registry
                    .try_acquire(target)
                    .map(|_| registry.request_timeout(target))
            })
            .await?;

        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(WardenError::Timeout {
                target: target.to_string(),
                timeout,
            }),
        };
        self.record(target, result.is_ok()).await;
        result
    }

    pub async fn is_open(&self, target: &str) -> bool {
        self.state(target).await == CircuitState::Open
    }

    pub async fn state(&self, target: &str) -> CircuitState {
        self.update(|registry| registry.state(target)).await
    }

    pub async fn view(&self, target: &str) -> Option<BreakerView> {
        self.update(|registry| registry.view(target)).await
    }

    pub async fn views(&self) -> Vec<BreakerView> {
        self.update(|registry| registry.views()).await
    }

    pub async fn open_count(&self) -> usize {
        self.views()
            .await
            .iter()
            .filter(|v| v.state == CircuitState::Open)
            .count()
    }

    pub async fn transitions(&self, target: &str) -> Vec<Transition> {
        self.registry.read().await.transitions(target)
    }

    /// Run `f` under the write lock, then publish every transition it caused,
    /// including open timeouts noticed while reading state.
    async fn update<R>(&self, f: impl FnOnce(&mut BreakerRegistry) -> R) -> R {
        let (result, transitions) = {
            let mut registry = self.registry.write().await;
            let result = f(&mut registry);
            (result, registry.take_unpublished())
        };
        for transition in &transitions {
            self.publish(transition);
        }
        result
    }

    fn publish(&self, transition: &Transition) {
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(transition);
        }
        if let Some(store) = &self.store {
            let metadata = serde_json::json!({
                "from": transition.from.as_str(),
                "to": transition.to.as_str(),
                "reason": transition.reason,
            });
            if let Err(e) = store.record_local(
                &transition.target,
                METRIC_CIRCUIT_STATE,
                transition.to.gauge_value() as f64,
                metadata,
            ) {
                warn!("Failed to persist breaker transition for {}: {}", transition.target, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_and_counts_failure() {
        let table = BreakerTable::new(BreakerConfig {
            failure_threshold: 1,
            request_timeout_secs: 1,
            ..BreakerConfig::default()
        });

        let result: WardenResult<()> = table
            .call("peer", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(WardenError::Timeout { .. })));
        assert!(table.is_open("peer").await);

        let rejected: WardenResult<()> = table.call("peer", async { Ok(()) }).await;
        assert!(matches!(rejected, Err(WardenError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_persisted_as_metrics() {
        let store = Arc::new(MetricsStore::open_in_memory("hub-a", "test").unwrap());
        let metrics = Arc::new(FleetMetrics::new());
        let table = BreakerTable::new(BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        })
        .with_metrics(metrics.clone())
        .with_store(store.clone());

        table.register("memory").await;
        table.observe("memory", false).await;
        table.observe("memory", false).await;
        // Dropped while open
        table.observe("memory", true).await;

        assert_eq!(table.state("memory").await, CircuitState::Open);
        let rows = store.recent_metrics("memory", METRIC_CIRCUIT_STATE, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metadata["to"], "OPEN");
        assert!(metrics.export().contains("warden_breaker_transitions_total"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_transition_is_exported() {
        let store = Arc::new(MetricsStore::open_in_memory("hub-a", "test").unwrap());
        let metrics = Arc::new(FleetMetrics::new());
        let table = BreakerTable::new(BreakerConfig {
            failure_threshold: 1,
            timeout_secs: 60,
            ..BreakerConfig::default()
        })
        .with_metrics(metrics.clone())
        .with_store(store.clone());

        table.register("memory").await;
        table.observe("memory", false).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        // A plain state read notices the elapsed timeout
        assert_eq!(table.state("memory").await, CircuitState::HalfOpen);

        let rows = store.recent_metrics("memory", METRIC_CIRCUIT_STATE, 10).unwrap();
        let exported: Vec<&str> = rows.iter().filter_map(|r| r.metadata["to"].as_str()).collect();
        assert!(exported.contains(&"OPEN"));
        assert!(exported.contains(&"HALF_OPEN"));
        assert!(metrics.export().contains("state=\"HALF_OPEN\""));
    }
}

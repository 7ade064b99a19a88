//! Breaker registry - one circuit breaker per target

use super::circuit::{Admission, CircuitBreaker, Transition};
use crate::config::BreakerConfig;
use crate::error::WardenError;
use std::collections::HashMap;
use warden_common::{BreakerView, CircuitState};

/// Breakers keyed by target name (agent name or peer endpoint)
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: HashMap<String, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: HashMap::new(),
        }
    }

    /// Register a target with the default settings; no-op if present
    pub fn register(&mut self, target: &str) {
        self.entry(target);
    }

    /// Register a target with its own settings, replacing any existing breaker
    pub fn register_with(&mut self, target: &str, config: &BreakerConfig) {
        self.breakers
            .insert(target.to_string(), CircuitBreaker::new(target, config));
    }

    fn entry(&mut self, target: &str) -> &mut CircuitBreaker {
        let config = &self.config;
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| CircuitBreaker::new(target, config))
    }

    pub fn try_acquire(&mut self, target: &str) -> Result<Admission, WardenError> {
        self.entry(target).try_acquire()
    }

    pub fn record_failure(&mut self, target: &str) -> Option<Transition> {
        self.entry(target).record_failure()
    }

    pub fn record_success(&mut self, target: &str) -> Option<Transition> {
        self.entry(target).record_success()
    }

    pub fn observe(&mut self, target: &str, healthy: bool) {
        self.entry(target).observe(healthy)
    }

    /// Transitions of every breaker not yet published
    pub fn take_unpublished(&mut self) -> Vec<Transition> {
        let mut pending: Vec<Transition> = self
            .breakers
            .values_mut()
            .flat_map(|b| b.take_unpublished())
            .collect();
        pending.sort_by_key(|t| t.at);
        pending
    }

    /// Unknown targets are closed
    pub fn state(&mut self, target: &str) -> CircuitState {
        self.breakers
            .get_mut(target)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn request_timeout(&mut self, target: &str) -> std::time::Duration {
        self.entry(target).request_timeout()
    }

    pub fn view(&mut self, target: &str) -> Option<BreakerView> {
        self.breakers.get_mut(target).map(|b| b.view())
    }

    /// Sorted by target
    pub fn views(&mut self) -> Vec<BreakerView> {
        let mut views: Vec<BreakerView> = self.breakers.values_mut().map(|b| b.view()).collect();
        views.sort_by(|a, b| a.target.cmp(&b.target));
        views
    }

    pub fn transitions(&self, target: &str) -> Vec<Transition> {
        self.breakers
            .get(target)
            .map(|b| b.transitions().cloned().collect())
            .unwrap_or_default()
    }

    pub fn targets(&self) -> Vec<String> {
        self.breakers.keys().cloned().collect()
    }
}

//! Circuit breaker for agents and the peer link

use crate::config::BreakerConfig;
use crate::error::WardenError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use warden_common::{BreakerView, CircuitState};

/// Transitions kept per breaker
const TRANSITION_HISTORY: usize = 50;

/// One state change
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub target: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Granted by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call through a closed circuit
    Normal,
    /// The single half-open trial
    Trial,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    target: String,
    state: CircuitState,
    /// Consecutive failures while closed (decays on success)
    failure_count: u32,
    /// Consecutive successes while half-open
    success_count: u32,
    trial_in_flight: bool,
    failure_threshold: u32,
    failure_rate_threshold: f64,
    minimum_calls: usize,
    success_threshold: u32,
    rate_window: Duration,
    /// Call outcomes inside the rate window (true = failure)
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    timeout: Duration,
    request_timeout: Duration,
    transitions: VecDeque<Transition>,
    /// Transitions not yet handed to [`CircuitBreaker::take_unpublished`]
    unpublished: Vec<Transition>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            target: target.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            trial_in_flight: false,
            failure_threshold: config.failure_threshold.max(1),
            failure_rate_threshold: config.failure_rate_threshold,
            minimum_calls: config.minimum_calls.max(1),
            success_threshold: config.success_threshold.max(1),
            rate_window: config.rate_window(),
            window: VecDeque::new(),
            opened_at: None,
            opened_at_wall: None,
            timeout: config.timeout(),
            request_timeout: config.request_timeout(),
            transitions: VecDeque::new(),
            unpublished: Vec::new(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Current state, after applying an elapsed open timeout
    pub fn state(&mut self) -> CircuitState {
        self.poll_timeout();
        self.state
    }

    /// Whether calls are currently rejected outright
    pub fn is_open(&mut self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Ask to place a call.
    ///
    /// Open circuits reject until the timeout elapses; after that exactly one
    /// trial is admitted and further calls are rejected until it reports back.
    pub fn try_acquire(&mut self) -> Result<Admission, WardenError> {
        match self.state() {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(WardenError::CircuitOpen {
                target: self.target.clone(),
            }),
        }
    }

    /// Record a failed call. Returns the transition it caused, if any.
    pub fn record_failure(&mut self) -> Option<Transition> {
        let now = Instant::now();
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                self.push_outcome(now, true);
                if self.failure_count >= self.failure_threshold {
                    let reason = format!("{} consecutive failures", self.failure_count);
                    return Some(self.open(reason));
                }
                if let Some(rate) = self.failure_rate() {
                    if rate >= self.failure_rate_threshold {
                        let reason = format!("failure rate {:.2} over {} calls", rate, self.window.len());
                        return Some(self.open(reason));
                    }
                }
                None
            }
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
                Some(self.open("half-open trial failed".to_string()))
            }
            // No call should have been admitted
            CircuitState::Open => None,
        }
    }

    /// Record a successful call. Returns the transition it caused, if any.
    pub fn record_success(&mut self) -> Option<Transition> {
        let now = Instant::now();
        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
                self.push_outcome(now, false);
                None
            }
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    let reason = format!("{} successful trials", self.success_count);
                    Some(self.close(reason))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Feed a health observation of a supervised agent.
    ///
    /// Observations count as calls while closed and are dropped while open.
    /// Half-open, an unhealthy observation does not take the trial: the trial
    /// is left for a recovery attempt, and the next observation after it
    /// reports whether the recovery worked.
    pub fn observe(&mut self, healthy: bool) {
        match self.state() {
            CircuitState::Closed if healthy => {
                self.record_success();
            }
            CircuitState::Closed => {
                self.record_failure();
            }
            CircuitState::Open => {}
            CircuitState::HalfOpen if self.trial_in_flight => {
                if healthy {
                    self.record_success();
                } else {
                    self.record_failure();
                }
            }
            CircuitState::HalfOpen if healthy => {
                self.trial_in_flight = true;
                self.record_success();
            }
            CircuitState::HalfOpen => {}
        }
    }

    /// Transitions since the last call, oldest first
    pub fn take_unpublished(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.unpublished)
    }

    /// Failure fraction inside the rate window, once `minimum_calls` is met
    pub fn failure_rate(&self) -> Option<f64> {
        if self.window.len() < self.minimum_calls {
            return None;
        }
        let failures = self.window.iter().filter(|(_, failed)| *failed).count();
        Some(failures as f64 / self.window.len() as f64)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failure_count
    }

    /// Oldest first
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    pub fn view(&mut self) -> BreakerView {
        let state = self.state();
        BreakerView {
            target: self.target.clone(),
            state,
            consecutive_failures: self.failure_count,
            failure_rate: self.failure_rate().unwrap_or(0.0),
            window_calls: self.window.len(),
            opened_at: self.opened_at_wall,
        }
    }

    fn push_outcome(&mut self, now: Instant, failed: bool) {
        self.window.push_back((now, failed));
        while let Some(&(at, _)) = self.window.front() {
            if now.duration_since(at) > self.rate_window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn poll_timeout(&mut self) {
        if self.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = self.opened_at {
            if opened_at.elapsed() >= self.timeout {
                self.half_open();
            }
        }
    }

    fn open(&mut self, reason: String) -> Transition {
        warn!(target_name = %self.target, "Circuit opened: {}", reason);
        let transition = self.transition(CircuitState::Open, reason);
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(transition.at);
        self.failure_count = 0;
        self.success_count = 0;
        self.trial_in_flight = false;
        transition
    }

    fn half_open(&mut self) {
        info!(target_name = %self.target, "Circuit half-open, admitting a trial");
        self.transition(CircuitState::HalfOpen, "open timeout elapsed".to_string());
        self.success_count = 0;
        self.trial_in_flight = false;
    }

    fn close(&mut self, reason: String) -> Transition {
        info!(target_name = %self.target, "Circuit closed: {}", reason);
        let transition = self.transition(CircuitState::Closed, reason);
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at = None;
        self.opened_at_wall = None;
        self.window.clear();
        transition
    }

    fn transition(&mut self, to: CircuitState, reason: String) -> Transition {
        let transition = Transition {
            target: self.target.clone(),
            from: self.state,
            to,
            at: Utc::now(),
            reason,
        };
        self.state = to;
        self.unpublished.push(transition.clone());
        self.transitions.push_back(transition.clone());
        while self.transitions.len() > TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, timeout_secs: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            timeout_secs,
            ..BreakerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_threshold_failures() {
        let mut cb = CircuitBreaker::new("memory", &config(3, 60));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        let transition = cb.record_failure().unwrap();
        assert_eq!(transition.from, CircuitState::Closed);
        assert_eq!(transition.to, CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_decays_failure_count() {
        let mut cb = CircuitBreaker::new("memory", &config(3, 60));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.consecutive_failures(), 2);

        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 1);

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_and_reopen() {
        let mut cb = CircuitBreaker::new("peer", &config(1, 30));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cb.try_acquire().unwrap(), Admission::Trial);
        assert!(cb.try_acquire().is_err());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Fresh timeout after the failed trial
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_after_success_threshold() {
        let mut cb = CircuitBreaker::new("memory", &config(1, 10));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;

        for _ in 0..2 {
            assert_eq!(cb.try_acquire().unwrap(), Admission::Trial);
            assert!(cb.record_success().is_none());
        }
        assert_eq!(cb.try_acquire().unwrap(), Admission::Trial);
        let transition = cb.record_success().unwrap();
        assert_eq!(transition.to, CircuitState::Closed);
        assert_eq!(cb.try_acquire().unwrap(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rate_opens_without_consecutive_threshold() {
        let mut cb = CircuitBreaker::new(
            "audio",
            &BreakerConfig {
                failure_threshold: 100,
                minimum_calls: 10,
                failure_rate_threshold: 0.5,
                ..BreakerConfig::default()
            },
        );

        // Alternate so consecutive failures never build up
        for _ in 0..4 {
            cb.record_failure();
            cb.record_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.failure_rate().is_none());

        cb.record_failure();
        let transition = cb.record_failure().unwrap();
        assert_eq!(transition.to, CircuitState::Open);
        assert!(transition.reason.contains("failure rate"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_expires_old_calls() {
        let mut cb = CircuitBreaker::new("audio", &config(100, 60));
        for _ in 0..5 {
            cb.record_success();
        }
        tokio::time::advance(Duration::from_secs(301)).await;
        cb.record_success();
        assert_eq!(cb.view().window_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_history_recorded() {
        let mut cb = CircuitBreaker::new("memory", &config(1, 5));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(6)).await;
        cb.state();

        let states: Vec<CircuitState> = cb.transitions().map(|t| t.to).collect();
        assert_eq!(states, vec![CircuitState::Open, CircuitState::HalfOpen]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_transition_is_unpublished_until_taken() {
        let mut cb = CircuitBreaker::new("memory", &config(1, 5));
        cb.record_failure();
        assert_eq!(cb.take_unpublished().len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cb.is_open());
        let pending = cb.take_unpublished();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].from, CircuitState::Open);
        assert_eq!(pending[0].to, CircuitState::HalfOpen);
        assert!(cb.take_unpublished().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_observation_leaves_trial_for_recovery() {
        let mut cb = CircuitBreaker::new("memory", &config(1, 10));
        cb.observe(false);
        assert_eq!(cb.state(), CircuitState::Open);

        // Dropped while open
        cb.observe(false);
        tokio::time::advance(Duration::from_secs(11)).await;

        cb.observe(false);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.try_acquire().unwrap(), Admission::Trial);

        // The observation after the trial decides it
        cb.observe(false);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_observations_close_half_open() {
        let mut cb = CircuitBreaker::new("memory", &config(1, 10));
        cb.observe(false);
        tokio::time::advance(Duration::from_secs(11)).await;

        for _ in 0..3 {
            cb.observe(true);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}

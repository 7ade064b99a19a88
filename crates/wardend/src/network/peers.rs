//! HTTP client for the peer warden
//!
//! Requests are bounded by the configured timeout. Pushes are retried with
//! jittered exponential backoff on retryable failures; health checks are not.

use crate::error::{WardenError, WardenResult};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use warden_common::{HealthResponse, PeerStatus, SyncRequest, SyncResponse};

pub const HEALTH_PATH: &str = "/health";
pub const SYNC_PATH: &str = "/api/v1/sync_from_peer";

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub jitter_percent: f64,
    pub max_ms: u64,
    pub max_attempts: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 200,
            factor: 2.0,
            jitter_percent: 0.20,
            max_ms: 2000,
            max_attempts: 3,
        }
    }
}

impl BackoffConfig {
    /// base * factor^attempt, capped at `max_ms`, ± jitter
    pub fn calculate_backoff(&self, attempt: usize) -> Duration {
        use rand::Rng;

        let base_backoff =
            (self.base_ms as f64 * self.factor.powi(attempt as i32)).min(self.max_ms as f64);

        let jitter_range = base_backoff * self.jitter_percent;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((base_backoff + jitter).max(0.0) as u64)
    }
}

/// Request result classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    NetworkError,
    Http4xx,
    Http5xx,
    Timeout,
    InvalidPayload,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NetworkError => "network_error",
            Self::Http4xx => "http_4xx",
            Self::Http5xx => "http_5xx",
            Self::Timeout => "timeout",
            Self::InvalidPayload => "invalid_payload",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError | Self::Http5xx | Self::Timeout)
    }

    /// No answer at all, as opposed to an answer we did not like
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::NetworkError | Self::Timeout)
    }
}

/// Reachability class of a failed peer call
pub fn peer_status_of(err: &WardenError) -> PeerStatus {
    match err {
        WardenError::PeerUnreachable { .. }
        | WardenError::Timeout { .. }
        | WardenError::CircuitOpen { .. } => PeerStatus::Unreachable,
        _ => PeerStatus::Unhealthy,
    }
}

#[derive(Clone)]
pub struct PeerClient {
    client: reqwest::Client,
    base_url: String,
    peer_name: String,
    backoff: BackoffConfig,
}

impl PeerClient {
    pub fn new(
        base_url: impl Into<String>,
        peer_name: impl Into<String>,
        timeout: Duration,
    ) -> WardenResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| WardenError::Configuration(format!("Failed to build peer client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            peer_name: peer_name.into(),
            backoff: BackoffConfig::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn classify_error(err: &reqwest::Error) -> RequestStatus {
        if err.is_timeout() {
            RequestStatus::Timeout
        } else if err.is_decode() {
            RequestStatus::InvalidPayload
        } else if let Some(status) = err.status() {
            if status.is_client_error() {
                RequestStatus::Http4xx
            } else if status.is_server_error() {
                RequestStatus::Http5xx
            } else {
                RequestStatus::NetworkError
            }
        } else {
            RequestStatus::NetworkError
        }
    }

    fn to_error(&self, status: RequestStatus, detail: impl std::fmt::Display) -> WardenError {
        if status.is_unreachable() {
            WardenError::PeerUnreachable {
                peer: self.peer_name.clone(),
                reason: format!("{}: {}", status.as_str(), detail),
            }
        } else {
            WardenError::Sync(format!("{} ({}): {}", self.peer_name, status.as_str(), detail))
        }
    }

    /// `GET /health` on the peer
    pub async fn get_health(&self) -> WardenResult<HealthResponse> {
        let url = format!("{}{}", self.base_url, HEALTH_PATH);
        debug!(peer = %self.peer_name, "Checking peer health");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.to_error(Self::classify_error(&e), e))?;

        let status = response.status();
        if !status.is_success() {
            let class = if status.is_client_error() {
                RequestStatus::Http4xx
            } else {
                RequestStatus::Http5xx
            };
            return Err(self.to_error(class, status));
        }

        response
            .json::<HealthResponse>()
            .await
            .map_err(|e| self.to_error(RequestStatus::InvalidPayload, e))
    }

    /// `POST /api/v1/sync_from_peer` with retry on retryable failures
    pub async fn push_metrics(&self, request: &SyncRequest) -> WardenResult<SyncResponse> {
        let url = format!("{}{}", self.base_url, SYNC_PATH);
        let attempts = self.backoff.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            debug!(
                peer = %self.peer_name,
                records = request.metrics.len(),
                "Pushing metrics (attempt {}/{})",
                attempt + 1,
                attempts
            );

            let status = match self.client.post(&url).json(request).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<SyncResponse>()
                        .await
                        .map_err(|e| self.to_error(RequestStatus::InvalidPayload, e));
                }
                Ok(response) => {
                    let class = if response.status().is_client_error() {
                        RequestStatus::Http4xx
                    } else {
                        RequestStatus::Http5xx
                    };
                    last_error = Some(self.to_error(class, response.status()));
                    class
                }
                Err(e) => {
                    let class = Self::classify_error(&e);
                    last_error = Some(self.to_error(class, e));
                    class
                }
            };

            if !status.is_retryable() {
                break;
            }
            if attempt + 1 < attempts {
                let backoff = self.backoff.calculate_backoff(attempt);
                warn!(
                    peer = %self.peer_name,
                    "Push failed ({}), retrying in {:?}",
                    status.as_str(),
                    backoff
                );
                sleep(backoff).await;
            }
        }

        Err(last_error.unwrap_or_else(|| self.to_error(RequestStatus::NetworkError, "no attempt made")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            jitter_percent: 0.0,
            ..BackoffConfig::default()
        };
        assert_eq!(backoff.calculate_backoff(0), Duration::from_millis(200));
        assert_eq!(backoff.calculate_backoff(1), Duration::from_millis(400));
        assert_eq!(backoff.calculate_backoff(10), Duration::from_millis(2000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let backoff = BackoffConfig::default();
        for _ in 0..100 {
            let d = backoff.calculate_backoff(0).as_millis();
            assert!((160..=240).contains(&d), "{} out of range", d);
        }
    }

    #[test]
    fn test_peer_status_classification() {
        let unreachable = WardenError::PeerUnreachable {
            peer: "hub-b".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(peer_status_of(&unreachable), PeerStatus::Unreachable);
        let open = WardenError::CircuitOpen {
            target: "peer:hub-b".to_string(),
        };
        assert_eq!(peer_status_of(&open), PeerStatus::Unreachable);
        let bad = WardenError::Sync("hub-b (http_5xx): 500".to_string());
        assert_eq!(peer_status_of(&bad), PeerStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = PeerClient::new(
            format!("http://127.0.0.1:{}/", port),
            "hub-b",
            Duration::from_secs(1),
        )
        .unwrap();
        let err = client.get_health().await.unwrap_err();
        assert_eq!(peer_status_of(&err), PeerStatus::Unreachable);
    }
}

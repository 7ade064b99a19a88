//! HTTP client for the wardend API

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use warden_common::{
    AgentsResponse, AlertsResponse, BreakersResponse, ErrorResponse, HealthResponse,
    RecoveryHistoryResponse, StatusResponse, SyncHistoryResponse, TriggerRecoveryRequest,
    TriggerRecoveryResponse,
};

pub struct WardenClient {
    client: reqwest::Client,
    base_url: String,
}

impl WardenClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.context("Malformed response from wardend");
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(anyhow!("wardend returned {}: {}", status, message))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await.with_context(|| {
            format!("Cannot reach wardend at {}. Is the daemon running?", self.base_url)
        })?;
        self.decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await.with_context(|| {
            format!("Cannot reach wardend at {}. Is the daemon running?", self.base_url)
        })?;
        self.decode(response).await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("/health").await
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.get("/api/v1/status").await
    }

    pub async fn agents(&self) -> Result<AgentsResponse> {
        self.get("/api/v1/agents").await
    }

    pub async fn alerts(&self) -> Result<AlertsResponse> {
        self.get("/api/v1/alerts").await
    }

    pub async fn breakers(&self) -> Result<BreakersResponse> {
        self.get("/api/v1/breakers").await
    }

    pub async fn recovery_history(&self, limit: usize) -> Result<RecoveryHistoryResponse> {
        self.get(&format!("/api/v1/recovery/history?limit={}", limit)).await
    }

    pub async fn sync_history(&self, limit: usize) -> Result<SyncHistoryResponse> {
        self.get(&format!("/api/v1/sync/history?limit={}", limit)).await
    }

    pub async fn trigger_recovery(&self, agent_name: &str, strategy: &str) -> Result<TriggerRecoveryResponse> {
        let request = TriggerRecoveryRequest {
            agent_name: agent_name.to_string(),
            strategy: strategy.to_string(),
        };
        self.post("/api/v1/trigger_recovery", &request).await
    }
}

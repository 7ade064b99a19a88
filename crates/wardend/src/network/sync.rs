//! Cross-node synchronization and failover tracking
//!
//! Each cycle checks the peer's health endpoint and, when the peer is
//! healthy, pushes the locally originated metric rows added since the last
//! successful push. Both calls go through the peer's circuit breaker.

use super::metrics::FleetMetrics;
use super::peers::{peer_status_of, PeerClient};
use crate::config::PeerConfig;
use crate::error::{WardenError, WardenResult};
use crate::storage::MetricsStore;
use crate::supervisor::BreakerTable;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use warden_common::{PeerStatus, PeerSyncRecord, SyncRequest, SyncResponse};

/// Peer link state served by `/health` and `/api/v1/status`
#[derive(Debug, Clone)]
pub struct PeerState {
    pub peer_status: PeerStatus,
    pub failover_active: bool,
    pub consecutive_failures: u32,
    /// Highest local row id the peer has acknowledged
    pub watermark: i64,
    pub last_successful_sync: Option<DateTime<Utc>>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            peer_status: PeerStatus::Unknown,
            failover_active: false,
            consecutive_failures: 0,
            watermark: 0,
            last_successful_sync: None,
        }
    }
}

pub struct CrossNodeCoordinator {
    config: PeerConfig,
    node_name: String,
    client: Option<PeerClient>,
    store: Arc<MetricsStore>,
    breakers: Arc<BreakerTable>,
    metrics: Option<Arc<FleetMetrics>>,
    state: RwLock<PeerState>,
}

impl CrossNodeCoordinator {
    pub fn new(
        config: PeerConfig,
        node_name: impl Into<String>,
        store: Arc<MetricsStore>,
        breakers: Arc<BreakerTable>,
    ) -> WardenResult<Self> {
        let client = match &config.url {
            Some(url) => Some(PeerClient::new(url.clone(), config.node_name.clone(), config.request_timeout())?),
            None => None,
        };
        let state = PeerState {
            watermark: store.load_watermark(&config.node_name)?,
            ..PeerState::default()
        };
        Ok(Self {
            config,
            node_name: node_name.into(),
            client,
            store,
            breakers,
            metrics: None,
            state: RwLock::new(state),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<FleetMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_client(mut self, client: PeerClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Breaker target guarding the peer link
    pub fn breaker_target(&self) -> String {
        format!("peer:{}", self.config.node_name)
    }

    pub async fn state(&self) -> PeerState {
        self.state.read().await.clone()
    }

    /// Run one sync cycle and record its outcome
    pub async fn sync_once(&self) -> WardenResult<PeerSyncRecord> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| WardenError::Configuration("no peer configured".to_string()))?;
        let target = self.breaker_target();
        let started = Instant::now();
        let watermark = self.state.read().await.watermark;

        let (peer_status, outcome) = match self.breakers.call(&target, client.get_health()).await {
            Ok(health) if health.is_healthy() => {
                let outcome = self.push(client, &target, watermark).await;
                let status = match &outcome {
                    Err(e) => peer_status_of(e),
                    Ok(_) => PeerStatus::Healthy,
                };
                (status, outcome)
            }
            Ok(health) => (
                PeerStatus::Unhealthy,
                Err(WardenError::Sync(format!(
                    "{} reports status {}",
                    self.config.node_name, health.status
                ))),
            ),
            Err(e) => (peer_status_of(&e), Err(e)),
        };

        let latency = started.elapsed();
        let record = PeerSyncRecord {
            source_node: self.node_name.clone(),
            target_node: self.config.node_name.clone(),
            timestamp: Utc::now(),
            peer_status,
            records_sent: outcome.as_ref().map(|(sent, _)| *sent).unwrap_or(0),
            success: outcome.is_ok(),
            latency_ms: latency.as_millis() as u64,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };

        let new_watermark = outcome.as_ref().ok().and_then(|(_, last)| *last);
        self.update_state(&record, new_watermark).await;
        if let Some(watermark) = new_watermark {
            if let Err(e) = self.store.save_watermark(&self.config.node_name, watermark) {
                warn!("Failed to persist sync watermark: {}", e);
            }
        }

        if let Err(e) = self.store.record_sync_attempt(&record) {
            warn!("Failed to record sync attempt: {}", e);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_sync(
                &self.config.node_name,
                peer_status.as_str(),
                record.success,
                latency.as_secs_f64(),
            );
        }
        Ok(record)
    }

    /// Push rows above `watermark`. Returns (records sent, new watermark).
    async fn push(
        &self,
        client: &PeerClient,
        target: &str,
        watermark: i64,
    ) -> WardenResult<(usize, Option<i64>)> {
        let batch = self.store.local_after(watermark, self.config.batch_limit)?;
        if batch.is_empty() {
            debug!(peer = %self.config.node_name, "Nothing new to push");
            return Ok((0, None));
        }

        let last_id = batch.last().map(|r| r.id);
        let request = SyncRequest {
            source_hub: self.node_name.clone(),
            timestamp: Utc::now(),
            metrics: batch.iter().map(|r| r.to_sync_metric()).collect(),
        };
        let response: SyncResponse = self.breakers.call(target, client.push_metrics(&request)).await?;
        debug!(
            peer = %self.config.node_name,
            sent = request.metrics.len(),
            accepted = response.metrics_received,
            "Metrics pushed"
        );
        Ok((request.metrics.len(), last_id))
    }

    async fn update_state(&self, record: &PeerSyncRecord, new_watermark: Option<i64>) {
        let mut state = self.state.write().await;
        state.peer_status = record.peer_status;
        let was_active = state.failover_active;

        if record.success {
            state.consecutive_failures = 0;
            state.failover_active = false;
            state.last_successful_sync = Some(record.timestamp);
            if let Some(watermark) = new_watermark {
                state.watermark = watermark;
            }
        } else {
            state.consecutive_failures += 1;
            if record.peer_status == PeerStatus::Unreachable
                || state.consecutive_failures >= self.config.max_failover_attempts
            {
                state.failover_active = true;
            }
        }

        if state.failover_active != was_active {
            if state.failover_active {
                warn!(
                    peer = %self.config.node_name,
                    failures = state.consecutive_failures,
                    status = record.peer_status.as_str(),
                    "Failover activated"
                );
            } else {
                info!(peer = %self.config.node_name, "Peer recovered, failover cleared");
            }
            if let Some(metrics) = &self.metrics {
                metrics.set_failover(state.failover_active);
            }
        }
    }

    /// Ingest metrics pushed by the peer
    pub fn receive(&self, request: &SyncRequest) -> WardenResult<usize> {
        if request.source_hub == self.node_name {
            return Err(WardenError::Sync(format!(
                "refusing metrics labelled with our own node name {}",
                request.source_hub
            )));
        }
        let inserted = self
            .store
            .insert_from_peer(&request.source_hub, request.timestamp, &request.metrics)?;
        if let Some(metrics) = &self.metrics {
            metrics.record_received(&request.source_hub, inserted);
        }
        Ok(inserted)
    }

    /// Sync every `sync_interval` until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.is_enabled() {
            info!("No peer configured, cross-node sync disabled");
            return;
        }
        info!(
            peer = %self.config.node_name,
            interval_secs = self.config.sync_interval_secs,
            "Peer sync started"
        );

        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.sync_once().await {
                        Ok(record) if !record.success => {
                            debug!(peer = %record.target_node, "Sync cycle failed: {:?}", record.error);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Sync cycle aborted: {}", e),
                    }
                }
            }
        }
        info!("Peer sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use axum::{routing::{get, post}, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warden_common::HealthResponse;

    async fn spawn_peer(received: Arc<AtomicUsize>) -> String {
        let app = Router::new()
            .route(
                "/health",
                get(|| async {
                    Json(HealthResponse {
                        status: "healthy".to_string(),
                        role: "secondary".to_string(),
                        environment: "test".to_string(),
                        peer_hub_status: PeerStatus::Unknown,
                        failover_active: false,
                        monitored_agents: 0,
                        uptime_seconds: 1,
                    })
                }),
            )
            .route(
                "/api/v1/sync_from_peer",
                post(move |Json(req): Json<SyncRequest>| {
                    let received = received.clone();
                    async move {
                        received.fetch_add(req.metrics.len(), Ordering::SeqCst);
                        Json(SyncResponse {
                            status: "success".to_string(),
                            metrics_received: req.metrics.len(),
                        })
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn coordinator(url: String, store: Arc<MetricsStore>) -> CrossNodeCoordinator {
        let config = PeerConfig {
            url: Some(url),
            node_name: "hub-b".to_string(),
            request_timeout_secs: 2,
            ..PeerConfig::default()
        };
        let breakers = Arc::new(BreakerTable::new(BreakerConfig::default()));
        CrossNodeCoordinator::new(config, "hub-a", store, breakers).unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_peer_activates_failover() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let store = Arc::new(MetricsStore::open_in_memory("hub-a", "test").unwrap());
        let coordinator = coordinator(format!("http://127.0.0.1:{}", port), store.clone());
        let record = coordinator.sync_once().await.unwrap();

        assert!(!record.success);
        assert_eq!(record.peer_status, PeerStatus::Unreachable);
        let state = coordinator.state().await;
        assert!(state.failover_active);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(store.recent_sync_attempts(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_successful_cycle_pushes_only_new_local_rows() {
        let received = Arc::new(AtomicUsize::new(0));
        let url = spawn_peer(received.clone()).await;
        let store = Arc::new(MetricsStore::open_in_memory("hub-a", "test").unwrap());
        store.record_local("memory", "health", 1.0, serde_json::json!({})).unwrap();
        store.record_local("router", "health", 0.5, serde_json::json!({})).unwrap();
        store
            .insert_from_peer(
                "hub-b",
                Utc::now(),
                &[warden_common::SyncMetric {
                    agent_name: "remote".to_string(),
                    metric_type: "health".to_string(),
                    metric_value: 1.0,
                    metadata: serde_json::json!({}),
                    timestamp: None,
                }],
            )
            .unwrap();

        let coordinator = coordinator(url, store.clone());
        let first = coordinator.sync_once().await.unwrap();
        assert!(first.success);
        assert_eq!(first.records_sent, 2);
        assert_eq!(received.load(Ordering::SeqCst), 2);

        let second = coordinator.sync_once().await.unwrap();
        assert!(second.success);
        assert_eq!(second.records_sent, 0);

        let state = coordinator.state().await;
        assert_eq!(state.peer_status, PeerStatus::Healthy);
        assert!(!state.failover_active);
        assert!(state.last_successful_sync.is_some());
    }

    #[tokio::test]
    async fn test_restarted_coordinator_resumes_from_watermark() {
        let received = Arc::new(AtomicUsize::new(0));
        let url = spawn_peer(received.clone()).await;
        let store = Arc::new(MetricsStore::open_in_memory("hub-a", "test").unwrap());
        store.record_local("memory", "health", 1.0, serde_json::json!({})).unwrap();

        let first = coordinator(url.clone(), store.clone());
        assert_eq!(first.sync_once().await.unwrap().records_sent, 1);
        drop(first);

        store.record_local("router", "health", 1.0, serde_json::json!({})).unwrap();
        let restarted = coordinator(url, store.clone());
        let record = restarted.sync_once().await.unwrap();
        assert!(record.success);
        assert_eq!(record.records_sent, 1);
        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_receive_is_idempotent() {
        let store = Arc::new(MetricsStore::open_in_memory("hub-a", "test").unwrap());
        let coordinator = coordinator("http://127.0.0.1:9".to_string(), store);
        let request = SyncRequest {
            source_hub: "hub-b".to_string(),
            timestamp: Utc::now(),
            metrics: vec![warden_common::SyncMetric {
                agent_name: "memory".to_string(),
                metric_type: "health".to_string(),
                metric_value: 1.0,
                metadata: serde_json::json!({"status": "HEALTHY"}),
                timestamp: None,
            }],
        };
        assert_eq!(coordinator.receive(&request).unwrap(), 1);
        assert_eq!(coordinator.receive(&request).unwrap(), 0);

        let own = SyncRequest {
            source_hub: "hub-a".to_string(),
            ..request
        };
        assert!(coordinator.receive(&own).is_err());
    }
}

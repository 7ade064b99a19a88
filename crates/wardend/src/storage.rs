//! Metrics store - SQLite persistence for metrics, sync attempts and recovery
//!
//! Schema:
//! - distributed_metrics: one row per metric, local or received from a peer.
//!   `(timestamp, agent_name, metric_type, source_hub)` is unique so replays
//!   from a peer are ignored.
//! - sync_attempts: one row per peer sync cycle
//! - recovery_actions: the recovery audit log
//! - sync_watermarks: highest local row id each peer has acknowledged
//!
//! Timestamps are stored as microseconds since the epoch.

use crate::error::WardenResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use warden_common::{
    PeerStatus, PeerSyncRecord, RecoveryAction, RecoveryResult, RecoveryTier, RecoveryTrigger,
    SyncMetric,
};

pub const METRIC_HEALTH: &str = "health";
pub const METRIC_CIRCUIT_STATE: &str = "circuit_state";
pub const METRIC_RECOVERY: &str = "recovery";
pub const METRIC_FAILURE_PROBABILITY: &str = "failure_probability";

/// One row of `distributed_metrics`
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub agent_name: String,
    pub metric_type: String,
    pub metric_value: f64,
    pub source_hub: String,
    pub environment: String,
    pub metadata: serde_json::Value,
}

impl MetricRecord {
    pub fn to_sync_metric(&self) -> SyncMetric {
        SyncMetric {
            agent_name: self.agent_name.clone(),
            metric_type: self.metric_type.clone(),
            metric_value: self.metric_value,
            metadata: self.metadata.clone(),
            timestamp: Some(self.timestamp),
        }
    }
}

/// SQLite-backed metrics store shared by every loop
pub struct MetricsStore {
    conn: Mutex<Connection>,
    node: String,
    environment: String,
}

impl MetricsStore {
    /// Open or create the database at `path`
    pub fn open_at<P: AsRef<Path>>(path: P, node: &str, environment: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open metrics db {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, node, environment)
    }

    /// Throwaway store, used by tests and `--no-launch` dry runs
    pub fn open_in_memory(node: &str, environment: &str) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, node, environment)
    }

    fn init(conn: Connection, node: &str, environment: &str) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS distributed_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                agent_name TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                metric_value REAL NOT NULL,
                source_hub TEXT NOT NULL,
                environment TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT 'null'
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_metrics_identity
                ON distributed_metrics(timestamp, agent_name, metric_type, source_hub);
            CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON distributed_metrics(timestamp);
            CREATE INDEX IF NOT EXISTS idx_metrics_source ON distributed_metrics(source_hub, id);

            CREATE TABLE IF NOT EXISTS sync_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                source_hub TEXT NOT NULL,
                target_hub TEXT NOT NULL,
                sync_type TEXT NOT NULL,
                peer_status TEXT NOT NULL,
                status TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                records_synced INTEGER NOT NULL,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sync_timestamp ON sync_attempts(timestamp);

            CREATE TABLE IF NOT EXISTS recovery_actions (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                agent_name TEXT NOT NULL,
                tier INTEGER NOT NULL,
                actions TEXT NOT NULL,
                result TEXT NOT NULL,
                trigger TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_recovery_timestamp ON recovery_actions(timestamp);

            CREATE TABLE IF NOT EXISTS sync_watermarks (
                peer TEXT PRIMARY KEY,
                watermark INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .context("Failed to create metrics schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            node: node.to_string(),
            environment: environment.to_string(),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a metric observed on this node
    pub fn record_local(
        &self,
        agent_name: &str,
        metric_type: &str,
        metric_value: f64,
        metadata: serde_json::Value,
    ) -> WardenResult<bool> {
        self.insert(
            Utc::now(),
            agent_name,
            metric_type,
            metric_value,
            &self.node,
            &self.environment,
            &metadata,
        )
    }

    /// Store metrics pushed by a peer. Duplicates are skipped; returns the
    /// number of new rows.
    ///
    /// A metric without its own timestamp is stamped `sent_at` plus its index
    /// in microseconds, so rows of one batch stay distinct while a resent
    /// batch still maps onto the same rows.
    pub fn insert_from_peer(
        &self,
        source_hub: &str,
        sent_at: DateTime<Utc>,
        metrics: &[SyncMetric],
    ) -> WardenResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO distributed_metrics
                 (timestamp, agent_name, metric_type, metric_value, source_hub, environment, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (index, metric) in metrics.iter().enumerate() {
                let timestamp = metric
                    .timestamp
                    .unwrap_or_else(|| sent_at + chrono::Duration::microseconds(index as i64));
                inserted += stmt.execute(params![
                    timestamp.timestamp_micros(),
                    &metric.agent_name,
                    &metric.metric_type,
                    metric.metric_value,
                    source_hub,
                    &self.environment,
                    metric.metadata.to_string(),
                ])?;
            }
        }
        tx.commit()?;
        debug!("Accepted {}/{} metrics from {}", inserted, metrics.len(), source_hub);
        Ok(inserted)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        timestamp: DateTime<Utc>,
        agent_name: &str,
        metric_type: &str,
        metric_value: f64,
        source_hub: &str,
        environment: &str,
        metadata: &serde_json::Value,
    ) -> WardenResult<bool> {
        let changed = self.conn().execute(
            "INSERT OR IGNORE INTO distributed_metrics
             (timestamp, agent_name, metric_type, metric_value, source_hub, environment, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                timestamp.timestamp_micros(),
                agent_name,
                metric_type,
                metric_value,
                source_hub,
                environment,
                metadata.to_string(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Locally originated metrics with row id above `after_id`, oldest first.
    /// Rows received from peers are never returned.
    pub fn local_after(&self, after_id: i64, limit: usize) -> WardenResult<Vec<MetricRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, agent_name, metric_type, metric_value, source_hub, environment, metadata
             FROM distributed_metrics
             WHERE source_hub = ?1 AND id > ?2
             ORDER BY id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![&self.node, after_id, limit as i64], metric_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Most recent metrics of one type for an agent, newest first
    pub fn recent_metrics(
        &self,
        agent_name: &str,
        metric_type: &str,
        limit: usize,
    ) -> WardenResult<Vec<MetricRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, agent_name, metric_type, metric_value, source_hub, environment, metadata
             FROM distributed_metrics
             WHERE agent_name = ?1 AND metric_type = ?2
             ORDER BY timestamp DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![agent_name, metric_type, limit as i64], metric_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn count_metrics(&self) -> WardenResult<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM distributed_metrics", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Last acknowledged local row id for `peer`, 0 when nothing was pushed
    pub fn load_watermark(&self, peer: &str) -> WardenResult<i64> {
        let watermark = self
            .conn()
            .query_row(
                "SELECT watermark FROM sync_watermarks WHERE peer = ?1",
                params![peer],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(watermark.unwrap_or(0))
    }

    pub fn save_watermark(&self, peer: &str, watermark: i64) -> WardenResult<()> {
        self.conn().execute(
            "INSERT INTO sync_watermarks (peer, watermark, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(peer) DO UPDATE SET watermark = excluded.watermark, updated_at = excluded.updated_at",
            params![peer, watermark, Utc::now().timestamp_micros()],
        )?;
        Ok(())
    }

    pub fn record_sync_attempt(&self, record: &PeerSyncRecord) -> WardenResult<()> {
        self.conn().execute(
            "INSERT INTO sync_attempts
             (timestamp, source_hub, target_hub, sync_type, peer_status, status, latency_ms, records_synced, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.timestamp.timestamp_micros(),
                &record.source_node,
                &record.target_node,
                "push",
                record.peer_status.as_str(),
                if record.success { "success" } else { "failure" },
                record.latency_ms as i64,
                record.records_sent as i64,
                &record.error,
            ],
        )?;
        Ok(())
    }

    /// Newest first
    pub fn recent_sync_attempts(&self, limit: usize) -> WardenResult<Vec<PeerSyncRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT timestamp, source_hub, target_hub, peer_status, status, latency_ms, records_synced, error_message
             FROM sync_attempts
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let peer_status: String = row.get(3)?;
            let status: String = row.get(4)?;
            Ok(PeerSyncRecord {
                timestamp: from_micros(row.get(0)?),
                source_node: row.get(1)?,
                target_node: row.get(2)?,
                peer_status: parse_peer_status(&peer_status),
                success: status == "success",
                latency_ms: row.get::<_, i64>(5)? as u64,
                records_sent: row.get::<_, i64>(6)? as usize,
                error: row.get(7)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn record_recovery(&self, action: &RecoveryAction) -> WardenResult<()> {
        let actions = serde_json::to_string(&action.actions).unwrap_or_else(|_| "[]".to_string());
        self.conn().execute(
            "INSERT OR REPLACE INTO recovery_actions
             (id, timestamp, agent_name, tier, actions, result, trigger, duration_ms, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &action.id,
                action.timestamp.timestamp_micros(),
                &action.agent_name,
                action.tier.number() as i64,
                actions,
                action.result.as_str(),
                action.trigger.as_str(),
                action.duration_ms as i64,
                &action.error,
            ],
        )?;
        Ok(())
    }

    /// Newest first; rows that no longer parse are skipped
    pub fn recent_recoveries(&self, limit: usize) -> WardenResult<Vec<RecoveryAction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, agent_name, tier, actions, result, trigger, duration_ms, error
             FROM recovery_actions
             ORDER BY timestamp DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (id, ts, agent_name, tier, actions, result, trigger, duration_ms, error) = row?;
            let Some(tier) = RecoveryTier::from_number(tier as u8) else {
                continue;
            };
            let (Ok(result), Ok(trigger)) = (
                serde_json::from_value::<RecoveryResult>(serde_json::Value::String(result)),
                serde_json::from_value::<RecoveryTrigger>(serde_json::Value::String(trigger)),
            ) else {
                continue;
            };
            results.push(RecoveryAction {
                id,
                agent_name,
                tier,
                actions: serde_json::from_str(&actions).unwrap_or_default(),
                result,
                trigger,
                timestamp: from_micros(ts),
                duration_ms: duration_ms as u64,
                error,
            });
        }
        Ok(results)
    }

    /// Delete rows older than `days` from every table
    pub fn purge_older_than(&self, days: u64) -> WardenResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let cutoff = cutoff.timestamp_micros();
        let conn = self.conn();
        let mut deleted = conn.execute(
            "DELETE FROM distributed_metrics WHERE timestamp < ?1",
            params![cutoff],
        )?;
        deleted += conn.execute("DELETE FROM sync_attempts WHERE timestamp < ?1", params![cutoff])?;
        deleted += conn.execute(
            "DELETE FROM recovery_actions WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            info!("Purged {} rows older than {} days", deleted, days);
        }
        Ok(deleted)
    }
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<MetricRecord> {
    let metadata: String = row.get(7)?;
    Ok(MetricRecord {
        id: row.get(0)?,
        timestamp: from_micros(row.get(1)?),
        agent_name: row.get(2)?,
        metric_type: row.get(3)?,
        metric_value: row.get(4)?,
        source_hub: row.get(5)?,
        environment: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn parse_peer_status(s: &str) -> PeerStatus {
    match s {
        "healthy" => PeerStatus::Healthy,
        "unhealthy" => PeerStatus::Unhealthy,
        "unreachable" => PeerStatus::Unreachable,
        _ => PeerStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_peer_metrics_are_deduplicated_and_not_reexported() {
        let store = MetricsStore::open_in_memory("hub-a", "test").unwrap();
        store
            .record_local("memory", METRIC_HEALTH, 1.0, serde_json::json!({"status": "HEALTHY"}))
            .unwrap();

        let sent_at = Utc::now();
        let metrics = vec![SyncMetric {
            agent_name: "audio".to_string(),
            metric_type: METRIC_HEALTH.to_string(),
            metric_value: 0.0,
            metadata: serde_json::Value::Null,
            timestamp: Some(sent_at),
        }];
        assert_eq!(store.insert_from_peer("hub-b", sent_at, &metrics).unwrap(), 1);
        assert_eq!(store.insert_from_peer("hub-b", sent_at, &metrics).unwrap(), 0);
        assert_eq!(store.count_metrics().unwrap(), 2);

        let outgoing = store.local_after(0, 100).unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].agent_name, "memory");
        assert_eq!(outgoing[0].metadata["status"], "HEALTHY");
    }

    #[test]
    fn test_untimestamped_peer_batch_keeps_every_row() {
        let store = MetricsStore::open_in_memory("hub-a", "test").unwrap();
        let sent_at = Utc::now();
        let metrics: Vec<SyncMetric> = (0..10)
            .map(|i| SyncMetric {
                agent_name: "audio".to_string(),
                metric_type: METRIC_HEALTH.to_string(),
                metric_value: i as f64,
                metadata: serde_json::Value::Null,
                timestamp: None,
            })
            .collect();

        assert_eq!(store.insert_from_peer("hub-b", sent_at, &metrics).unwrap(), 10);
        assert_eq!(store.insert_from_peer("hub-b", sent_at, &metrics).unwrap(), 0);
        assert_eq!(store.recent_metrics("audio", METRIC_HEALTH, 100).unwrap().len(), 10);
    }

    #[test]
    fn test_watermark_advances_and_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("metrics.db");
        let store = MetricsStore::open_at(&path, "hub-a", "test").unwrap();
        assert_eq!(store.load_watermark("hub-b").unwrap(), 0);
        for i in 0..3 {
            store
                .record_local(&format!("agent-{}", i), METRIC_HEALTH, 1.0, serde_json::Value::Null)
                .unwrap();
        }
        let first = store.local_after(0, 2).unwrap();
        assert_eq!(first.len(), 2);
        store.save_watermark("hub-b", first[1].id).unwrap();
        drop(store);

        let store = MetricsStore::open_at(&path, "hub-a", "test").unwrap();
        let watermark = store.load_watermark("hub-b").unwrap();
        assert_eq!(watermark, first[1].id);
        let rest = store.local_after(watermark, 100).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].agent_name, "agent-2");
    }

    #[test]
    fn test_sync_and_recovery_round_trip_on_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("metrics.db");
        let store = MetricsStore::open_at(&path, "hub-a", "test").unwrap();

        store
            .record_sync_attempt(&PeerSyncRecord {
                source_node: "hub-a".to_string(),
                target_node: "hub-b".to_string(),
                timestamp: Utc::now(),
                peer_status: PeerStatus::Unreachable,
                records_sent: 0,
                success: false,
                latency_ms: 5000,
                error: Some("connection refused".to_string()),
            })
            .unwrap();

        store
            .record_recovery(&RecoveryAction {
                id: "r-1".to_string(),
                agent_name: "memory".to_string(),
                tier: RecoveryTier::ClearState,
                actions: RecoveryTier::ClearState.steps(),
                result: RecoveryResult::Cooldown,
                trigger: RecoveryTrigger::Predictive,
                timestamp: Utc::now(),
                duration_ms: 0,
                error: None,
            })
            .unwrap();

        drop(store);
        let store = MetricsStore::open_at(&path, "hub-a", "test").unwrap();
        let attempts = store.recent_sync_attempts(10).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].peer_status, PeerStatus::Unreachable);
        assert!(!attempts[0].success);

        let recoveries = store.recent_recoveries(10).unwrap();
        assert_eq!(recoveries.len(), 1);
        assert_eq!(recoveries[0].tier, RecoveryTier::ClearState);
        assert_eq!(recoveries[0].result, RecoveryResult::Cooldown);
        assert_eq!(recoveries[0].actions, RecoveryTier::ClearState.steps());
    }

    #[test]
    fn test_purge_keeps_recent_rows() {
        let store = MetricsStore::open_in_memory("hub-a", "test").unwrap();
        let old = Utc::now() - chrono::Duration::days(45);
        store
            .insert_from_peer(
                "hub-b",
                old,
                &[SyncMetric {
                    agent_name: "audio".to_string(),
                    metric_type: METRIC_HEALTH.to_string(),
                    metric_value: 1.0,
                    metadata: serde_json::Value::Null,
                    timestamp: None,
                }],
            )
            .unwrap();
        store
            .record_local("memory", METRIC_HEALTH, 1.0, serde_json::Value::Null)
            .unwrap();

        assert_eq!(store.purge_older_than(30).unwrap(), 1);
        assert_eq!(store.count_metrics().unwrap(), 1);
    }
}

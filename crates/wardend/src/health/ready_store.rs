//! Shared ready-signal store.
//!
//! Agents prove liveness by refreshing `agent:ready:<name>` (a JSON record with
//! a TTL) and record their last shutdown reason under `agent:shutdown:<name>`.
//! The warden only ever reads these keys. Two backends: a directory with one
//! JSON file per key (shared with agents on the same host), and an in-memory
//! map for tests and embedded use.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;

/// TTL agents are expected to use for their ready record
pub const READY_TTL: Duration = Duration::from_secs(300);

/// TTL of shutdown reason records
pub const SHUTDOWN_TTL: Duration = Duration::from_secs(3600);

pub fn ready_key(agent: &str) -> String {
    format!("agent:ready:{}", agent)
}

pub fn shutdown_key(agent: &str) -> String {
    format!("agent:shutdown:{}", agent)
}

/// Key-value store with per-key expiry
#[async_trait]
pub trait ReadySignalStore: Send + Sync {
    /// Value for `key`, or None when missing or expired
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Store `value` under `key` for `ttl`. Used by agents, never by the warden.
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<()>;
}

/// Payload of `agent:ready:<name>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadySignal {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ReadySignal {
    pub fn new(status: impl Into<String>, port: u16) -> Self {
        Self {
            status: status.into(),
            timestamp: Utc::now(),
            port: Some(port),
            details: serde_json::Value::Null,
        }
    }

    /// Fresh when younger than `max_age` and not self-reported as failing
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let status_ok = !matches!(
            self.status.to_ascii_lowercase().as_str(),
            "error" | "failed" | "stopping" | "shutting_down"
        );
        status_ok && age <= max_age && age >= -chrono::Duration::seconds(5)
    }
}

/// Payload of `agent:shutdown:<name>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRecord {
    pub reason: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Read and decode an agent's ready record
pub async fn read_ready(store: &dyn ReadySignalStore, agent: &str) -> Result<Option<ReadySignal>> {
    match store.get(&ready_key(agent)).await? {
        Some(value) => {
            let signal = serde_json::from_value(value)
                .with_context(|| format!("Malformed ready record for {}", agent))?;
            Ok(Some(signal))
        }
        None => Ok(None),
    }
}

/// Read an agent's last shutdown reason. Accepts either a bare string or a
/// `{reason, timestamp}` object.
pub async fn read_shutdown(store: &dyn ReadySignalStore, agent: &str) -> Result<Option<ShutdownRecord>> {
    let value = match store.get(&shutdown_key(agent)).await? {
        Some(value) => value,
        None => return Ok(None),
    };
    let record = match value {
        serde_json::Value::String(reason) => ShutdownRecord {
            reason,
            timestamp: None,
        },
        other => serde_json::from_value(other)
            .with_context(|| format!("Malformed shutdown record for {}", agent))?,
    };
    Ok(Some(record))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    value: serde_json::Value,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn new(value: serde_json::Value, ttl: Duration) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);
        Self { value, expires_at }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// One `<key>.json` file per key under a shared directory
pub struct FileReadyStore {
    dir: PathBuf,
}

impl FileReadyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

#[async_trait]
impl ReadySignalStore for FileReadyStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let entry: StoredEntry = serde_json::from_str(&content)
            .with_context(|| format!("Malformed store entry: {}", path.display()))?;
        Ok(entry.is_live(Utc::now()).then_some(entry.value))
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec(&StoredEntry::new(value, ttl))?;
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to publish {}", path.display()))?;
        Ok(())
    }
}

/// In-process store
#[derive(Default)]
pub struct MemoryReadyStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryReadyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

#[async_trait]
impl ReadySignalStore for MemoryReadyStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(Utc::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), StoredEntry::new(value, ttl));
        Ok(())
    }
}

//! Configuration management for wardend.
//!
//! Loads settings from /etc/fleetwarden/config.toml (or a YAML file when the
//! path ends in `.yml`/`.yaml`) or uses defaults. Every field carries a serde
//! default so a partial file is always valid. The resulting `WardenConfig` is
//! passed explicitly to every component at construction time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/fleetwarden/config.toml";

/// Identity of this orchestrator node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,

    /// "primary" or "secondary"; advisory only
    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_node_name() -> String {
    "hub-a".to_string()
}

fn default_role() -> String {
    "primary".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            role: default_role(),
            environment: default_environment(),
        }
    }
}

/// HTTP API bind address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Peer node synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Base URL of the peer warden, e.g. `http://10.0.0.2:8088`. Sync is
    /// disabled when unset.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_peer_name")]
    pub node_name: String,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Per-request timeout for peer calls
    #[serde(default = "default_peer_timeout")]
    pub request_timeout_secs: u64,

    /// Consecutive failed cycles before failover is declared
    #[serde(default = "default_max_failover_attempts")]
    pub max_failover_attempts: u32,

    /// Upper bound on records pushed per cycle
    #[serde(default = "default_sync_batch_limit")]
    pub batch_limit: usize,
}

fn default_peer_name() -> String {
    "hub-b".to_string()
}

fn default_sync_interval() -> u64 {
    30
}

fn default_peer_timeout() -> u64 {
    5
}

fn default_max_failover_attempts() -> u32 {
    3
}

fn default_sync_batch_limit() -> usize {
    5_000
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            url: None,
            node_name: default_peer_name(),
            sync_interval_secs: default_sync_interval(),
            request_timeout_secs: default_peer_timeout(),
            max_failover_attempts: default_max_failover_attempts(),
            batch_limit: default_sync_batch_limit(),
        }
    }
}

impl PeerConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Process launching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Relative agent scripts resolve against this directory
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// One `<agent>.log` per agent
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// PID files of launched agents
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Optional interpreter the script is passed to (e.g. "python3")
    #[serde(default)]
    pub interpreter: Option<String>,

    /// Wait after launching a phase before checking it
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,

    /// Health verification attempts per phase
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_max_concurrent_launches")]
    pub max_concurrent_launches: usize,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// A process exiting within this window counts as a failed launch
    #[serde(default = "default_spawn_check_ms")]
    pub spawn_check_ms: u64,
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("/opt/fleetwarden/agents")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/fleetwarden")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/fleetwarden")
}

fn default_settle_secs() -> u64 {
    15
}

fn default_retries() -> u32 {
    5
}

fn default_max_concurrent_launches() -> usize {
    8
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_spawn_check_ms() -> u64 {
    500
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            log_dir: default_log_dir(),
            run_dir: default_run_dir(),
            interpreter: None,
            settle_secs: default_settle_secs(),
            retries: default_retries(),
            max_concurrent_launches: default_max_concurrent_launches(),
            stop_grace_secs: default_stop_grace_secs(),
            spawn_check_ms: default_spawn_check_ms(),
        }
    }
}

impl LauncherConfig {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn spawn_check(&self) -> Duration {
        Duration::from_millis(self.spawn_check_ms)
    }
}

/// Health polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Host the agents listen on
    #[serde(default = "default_agent_host")]
    pub agent_host: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Timeout for a single check (TCP connect, store read)
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    /// Ready records older than this are stale
    #[serde(default = "default_ready_ttl")]
    pub ready_ttl_secs: u64,

    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,

    /// Records kept per agent
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

fn default_agent_host() -> String {
    "127.0.0.1".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_check_timeout() -> u64 {
    3
}

fn default_ready_ttl() -> u64 {
    300
}

fn default_max_concurrent_checks() -> usize {
    16
}

fn default_history_len() -> usize {
    100
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            agent_host: default_agent_host(),
            poll_interval_secs: default_poll_interval(),
            check_timeout_secs: default_check_timeout(),
            ready_ttl_secs: default_ready_ttl(),
            max_concurrent_checks: default_max_concurrent_checks(),
            history_len: default_history_len(),
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn ready_ttl(&self) -> Duration {
        Duration::from_secs(self.ready_ttl_secs)
    }
}

/// Circuit breaker defaults applied to every target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Failure fraction within the rate window that opens the circuit
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,

    /// Calls required in the window before the rate is evaluated
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: usize,

    /// Consecutive half-open successes that close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time the circuit stays open before a trial is allowed
    #[serde(default = "default_breaker_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_rate_window() -> u64 {
    300
}

fn default_minimum_calls() -> usize {
    10
}

fn default_success_threshold() -> u32 {
    3
}

fn default_breaker_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_rate_threshold: default_failure_rate_threshold(),
            rate_window_secs: default_rate_window(),
            minimum_calls: default_minimum_calls(),
            success_threshold: default_success_threshold(),
            timeout_secs: default_breaker_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Predictive failure analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Below this many samples the probability is always 0.0
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Samples used for mean / standard deviation
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,

    /// Samples used for the linear trend
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,

    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,

    #[serde(default = "default_analysis_interval")]
    pub analysis_interval_secs: u64,

    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
}

fn default_window_size() -> usize {
    100
}

fn default_min_samples() -> usize {
    10
}

fn default_stats_window() -> usize {
    20
}

fn default_trend_window() -> usize {
    5
}

fn default_z_threshold() -> f64 {
    2.0
}

fn default_analysis_interval() -> u64 {
    60
}

fn default_warning_threshold() -> f64 {
    0.6
}

fn default_critical_threshold() -> f64 {
    0.8
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            min_samples: default_min_samples(),
            stats_window: default_stats_window(),
            trend_window: default_trend_window(),
            z_threshold: default_z_threshold(),
            analysis_interval_secs: default_analysis_interval(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

impl PredictorConfig {
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs)
    }
}

/// Tiered recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Minimum time between two recoveries of the same agent
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Per-agent `cache/` and `tmp/` live under `<state_root>/<agent>`
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,

    /// React to health and predictive triggers; manual recovery always works
    #[serde(default = "default_auto_recover")]
    pub auto_recover: bool,

    /// Pending automatic requests
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_audit_len")]
    pub audit_len: usize,
}

fn default_cooldown() -> u64 {
    60
}

fn default_state_root() -> PathBuf {
    PathBuf::from("/var/lib/fleetwarden/agents")
}

fn default_auto_recover() -> bool {
    true
}

fn default_queue_depth() -> usize {
    64
}

fn default_audit_len() -> usize {
    1_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            state_root: default_state_root(),
            auto_recover: default_auto_recover(),
            queue_depth: default_queue_depth(),
            audit_len: default_audit_len(),
        }
    }
}

impl RecoveryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Metrics persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/fleetwarden/metrics.db")
}

fn default_retention_days() -> u64 {
    30
}

fn default_purge_interval() -> u64 {
    3_600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: default_retention_days(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

/// Location of the shared ready-signal store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyStoreConfig {
    #[serde(default = "default_ready_dir")]
    pub dir: PathBuf,
}

fn default_ready_dir() -> PathBuf {
    PathBuf::from("/run/fleetwarden/ready")
}

impl Default for ReadyStoreConfig {
    fn default() -> Self {
        Self {
            dir: default_ready_dir(),
        }
    }
}

/// One managed agent as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,

    #[serde(default = "default_group")]
    pub group: String,

    pub port: u16,

    /// Defaults to `port` when the agent serves health on its main port
    #[serde(default)]
    pub health_port: Option<u16>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Executable or script; relative paths resolve against `launcher.scripts_dir`
    #[serde(default)]
    pub script: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra directories wiped by tier-2+ recovery
    #[serde(default)]
    pub state_dirs: Vec<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_required() -> bool {
    true
}

/// Full daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub peer: PeerConfig,

    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub predictor: PredictorConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ready_store: ReadyStoreConfig,

    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node: NodeConfig::default(),
            server: ServerConfig::default(),
            peer: PeerConfig::default(),
            launcher: LauncherConfig::default(),
            health: HealthConfig::default(),
            breaker: BreakerConfig::default(),
            predictor: PredictorConfig::default(),
            recovery: RecoveryConfig::default(),
            storage: StorageConfig::default(),
            ready_store: ReadyStoreConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl WardenConfig {
    /// Load config from the default path, or return defaults
    pub fn load() -> Self {
        Self::load_from_path(Path::new(CONFIG_PATH)).unwrap_or_else(|e| {
            warn!("Config not found, using defaults: {:#}", e);
            WardenConfig::default()
        })
    }

    /// Load config from a specific path. The format follows the extension.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = Self::parse(&content, path)?;
        info!("Loaded config from {} ({} agents)", path.display(), config.agents.len());
        Ok(config)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => serde_yaml::from_str(content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
        }
    }
}

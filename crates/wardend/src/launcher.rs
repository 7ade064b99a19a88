//! Process launcher - starts, tracks and stops agent processes.
//!
//! Every agent is started with its identity in the environment
//! (`WARDEN_AGENT_NAME` and friends), stdout/stderr appended to
//! `<log_dir>/<name>.log` and a PID file under `run_dir`. Before a launch any
//! process that still carries the same identity in its environment is
//! terminated. PID files left behind by an earlier run are never trusted on
//! their own since the PID may have been reused.

use crate::config::LauncherConfig;
use crate::error::{WardenError, WardenResult};
use crate::registry::AgentDescriptor;
use crate::scheduler::Phase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const ENV_AGENT_NAME: &str = "WARDEN_AGENT_NAME";
pub const ENV_AGENT_PORT: &str = "WARDEN_AGENT_PORT";
pub const ENV_HEALTH_PORT: &str = "WARDEN_HEALTH_PORT";
pub const ENV_AGENT_GROUP: &str = "WARDEN_AGENT_GROUP";

const EXIT_POLL: Duration = Duration::from_millis(100);

/// Start/stop operations recovery relies on
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn start(&self, agent: &AgentDescriptor) -> WardenResult<()>;

    async fn stop(&self, agent: &AgentDescriptor) -> WardenResult<()>;

    async fn restart(&self, agent: &AgentDescriptor) -> WardenResult<()> {
        self.stop(agent).await?;
        self.start(agent).await
    }
}

/// Handle of a launched agent
#[derive(Debug)]
pub struct AgentProcess {
    pub name: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    child: Child,
}

pub struct ProcessLauncher {
    config: LauncherConfig,
    processes: Mutex<HashMap<String, AgentProcess>>,
    limiter: Arc<Semaphore>,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_launches.max(1)));
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
            limiter,
        }
    }

    fn pid_file(&self, name: &str) -> PathBuf {
        self.config.run_dir.join(format!("{}.pid", name))
    }

    fn log_file(&self, name: &str) -> PathBuf {
        self.config.log_dir.join(format!("{}.log", name))
    }

    /// Launch every agent of a phase concurrently, bounded by
    /// `max_concurrent_launches`. Results are in phase order.
    pub async fn launch_phase(self: &Arc<Self>, phase: &Phase) -> Vec<(String, WardenResult<u32>)> {
        info!(phase = phase.index, agents = ?phase.names(), "Launching phase");
        let mut tasks = JoinSet::new();
        for (i, agent) in phase.agents.iter().enumerate() {
            let launcher = Arc::clone(self);
            let agent = Arc::clone(agent);
            tasks.spawn(async move {
                let _permit = launcher.limiter.clone().acquire_owned().await;
                (i, launcher.launch(&agent).await)
            });
        }

        let mut results: Vec<Option<WardenResult<u32>>> = (0..phase.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, result)) => results[i] = Some(result),
                Err(e) => warn!("Launch task panicked: {}", e),
            }
        }

        phase
            .agents
            .iter()
            .zip(results)
            .map(|(agent, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(WardenError::Launch {
                        agent: agent.name.clone(),
                        reason: "launch task aborted".to_string(),
                    })
                });
                (agent.name.clone(), result)
            })
            .collect()
    }

    /// Start one agent and return its PID
    pub async fn launch(&self, agent: &AgentDescriptor) -> WardenResult<u32> {
        let launch_err = |reason: String| WardenError::Launch {
            agent: agent.name.clone(),
            reason,
        };

        let script = agent
            .script
            .clone()
            .ok_or_else(|| launch_err("no script configured".to_string()))?;

        let previous = self.processes.lock().await.remove(&agent.name);
        if let Some(previous) = previous {
            debug!(agent = %agent.name, pid = previous.pid, "Replacing tracked process");
            self.terminate_child(previous).await;
        }
        self.kill_stale(&agent.name).await;

        std::fs::create_dir_all(&self.config.log_dir)
            .map_err(|e| launch_err(format!("log dir {}: {}", self.config.log_dir.display(), e)))?;
        std::fs::create_dir_all(&self.config.run_dir)
            .map_err(|e| launch_err(format!("run dir {}: {}", self.config.run_dir.display(), e)))?;

        let log_path = self.log_file(&agent.name);
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| launch_err(format!("log file {}: {}", log_path.display(), e)))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| launch_err(format!("log file {}: {}", log_path.display(), e)))?;

        let mut command = match &self.config.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&script);
                command
            }
            None => Command::new(&script),
        };
        command
            .args(&agent.args)
            .envs(&agent.env)
            .env(ENV_AGENT_NAME, &agent.name)
            .env(ENV_AGENT_PORT, agent.port.to_string())
            .env(ENV_HEALTH_PORT, agent.health_port.to_string())
            .env(ENV_AGENT_GROUP, &agent.group)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let mut child = command
            .spawn()
            .map_err(|e| launch_err(format!("spawn {}: {}", script.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| launch_err("process exited before reporting a pid".to_string()))?;

        let pid_file = self.pid_file(&agent.name);
        if let Err(e) = std::fs::write(&pid_file, pid.to_string()) {
            warn!(agent = %agent.name, "Failed to write {}: {}", pid_file.display(), e);
        }

        tokio::time::sleep(self.config.spawn_check()).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                let _ = std::fs::remove_file(&pid_file);
                return Err(launch_err(format!("exited immediately with {}", status)));
            }
            Ok(None) => {}
            Err(e) => warn!(agent = %agent.name, "Could not poll process: {}", e),
        }

        info!(agent = %agent.name, pid, log = %log_path.display(), "Agent launched");
        self.processes.lock().await.insert(
            agent.name.clone(),
            AgentProcess {
                name: agent.name.clone(),
                pid,
                started_at: Utc::now(),
                log_path,
                child,
            },
        );
        Ok(pid)
    }

    /// Stop an agent: SIGTERM, then SIGKILL after the grace period
    pub async fn stop_agent(&self, name: &str) -> WardenResult<()> {
        let tracked = self.processes.lock().await.remove(name);
        match tracked {
            Some(process) => {
                info!(agent = %name, pid = process.pid, "Stopping agent");
                self.terminate_child(process).await;
            }
            None => {
                debug!(agent = %name, "Agent not tracked, looking for stale processes");
                self.kill_stale(name).await;
            }
        }
        let _ = std::fs::remove_file(self.pid_file(name));
        Ok(())
    }

    /// Stop agents in the given order
    pub async fn stop_all(&self, names: &[String]) {
        for name in names {
            if let Err(e) = self.stop_agent(name).await {
                warn!(agent = %name, "Failed to stop agent: {}", e);
            }
        }
    }

    async fn terminate_child(&self, mut process: AgentProcess) {
        let grace = self.config.stop_grace();
        send_signal(process.pid, Signal::SIGTERM);
        match tokio::time::timeout(grace, process.child.wait()).await {
            Ok(Ok(status)) => debug!(agent = %process.name, "Exited with {}", status),
            Ok(Err(e)) => warn!(agent = %process.name, "Wait failed: {}", e),
            Err(_) => {
                warn!(agent = %process.name, pid = process.pid, "Grace period expired, killing");
                if let Err(e) = process.child.kill().await {
                    warn!(agent = %process.name, "Kill failed: {}", e);
                }
            }
        }
    }

    /// Terminate any untracked process carrying this agent's identity. A PID
    /// file only names a candidate; its PID is killed when the process also
    /// carries the identity, otherwise the file is stale and removed.
    async fn kill_stale(&self, name: &str) {
        let mut pids = find_by_identity(name).await;
        let own = std::process::id();
        pids.retain(|&pid| pid != own);

        let pid_file = self.pid_file(name);
        if let Some(pid) = read_pid_file(&pid_file) {
            if !pids.contains(&pid) {
                debug!(agent = %name, pid, "PID file does not match a live agent, removing");
                let _ = std::fs::remove_file(&pid_file);
            }
        }

        for pid in pids {
            warn!(agent = %name, pid, "Terminating stale agent process");
            terminate_pid(pid, self.config.stop_grace()).await;
        }
    }
}

#[async_trait]
impl AgentRuntime for ProcessLauncher {
    async fn start(&self, agent: &AgentDescriptor) -> WardenResult<()> {
        self.launch(agent).await.map(|_| ())
    }

    async fn stop(&self, agent: &AgentDescriptor) -> WardenResult<()> {
        self.stop_agent(&agent.name).await
    }
}

/// PIDs whose environment holds `WARDEN_AGENT_NAME=<name>`
async fn find_by_identity(name: &str) -> Vec<u32> {
    let needle = format!("{}={}", ENV_AGENT_NAME, name);
    let scan = tokio::task::spawn_blocking(move || {
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
        );
        system
            .processes()
            .iter()
            .filter(|(_, process)| process.environ().iter().any(|entry| *entry == needle))
            .map(|(pid, _)| pid.as_u32())
            .collect::<Vec<u32>>()
    });
    match scan.await {
        Ok(pids) => pids,
        Err(e) => {
            warn!("Process scan failed: {}", e);
            Vec::new()
        }
    }
}

fn read_pid_file(path: &std::path::Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn send_signal(pid: u32, signal: Signal) -> bool {
    match i32::try_from(pid) {
        Ok(raw) => kill(Pid::from_raw(raw), signal).is_ok(),
        Err(_) => false,
    }
}

fn is_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw) => kill(Pid::from_raw(raw), None).is_ok(),
        Err(_) => false,
    }
}

async fn terminate_pid(pid: u32, grace: Duration) {
    if !send_signal(pid, Signal::SIGTERM) {
        return;
    }
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
    send_signal(pid, Signal::SIGKILL);
}

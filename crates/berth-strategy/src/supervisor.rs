//! Process supervisor client.
//!
//! The process strategy talks to an external pm2-compatible supervisor
//! through this trait. The real client shells out to the supervisor
//! CLI and parses its `jlist` JSON; tests substitute an in-memory
//! implementation.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use berth_core::epoch_secs;

use crate::error::{StrategyError, StrategyResult};
use crate::process::ProcessDescriptor;

/// Ceiling on a single supervisor CLI invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Status reported by the supervisor for one managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Online,
    Launching,
    Stopped,
    Errored,
}

impl SupervisorStatus {
    fn from_pm2(s: &str) -> Self {
        match s {
            "online" => Self::Online,
            "launching" => Self::Launching,
            "errored" => Self::Errored,
            _ => Self::Stopped,
        }
    }
}

/// Runtime state of a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub status: SupervisorStatus,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
    pub restarts: u32,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub instances: u32,
}

/// Client for an external process supervisor.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Start (or replace) a process from a descriptor.
    async fn start(&self, descriptor: &ProcessDescriptor) -> StrategyResult<()>;

    /// Remove a process. Succeeds when the process does not exist.
    async fn delete(&self, name: &str) -> StrategyResult<()>;

    /// Query the state of a process. `None` when the supervisor does
    /// not know the name.
    async fn describe(&self, name: &str) -> StrategyResult<Option<ProcessState>>;

    /// Change the instance count of a running process.
    async fn scale(&self, name: &str, instances: u32) -> StrategyResult<()>;
}

// ── pm2 client ────────────────────────────────────────────────────

/// Supervisor client driving the pm2 CLI.
pub struct Pm2Supervisor {
    bin: String,
}

impl Pm2Supervisor {
    pub fn new() -> Self {
        Self {
            bin: "pm2".to_string(),
        }
    }

    pub fn with_bin(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> StrategyResult<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                StrategyError::Runtime(format!("{} {} timed out", self.bin, args.join(" ")))
            })?
            .map_err(|e| StrategyError::Runtime(format!("failed to spawn {}: {e}", self.bin)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StrategyError::Runtime(format!(
                "{} {} failed: {}",
                self.bin,
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for Pm2Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Supervisor for Pm2Supervisor {
    async fn start(&self, descriptor: &ProcessDescriptor) -> StrategyResult<()> {
        // Render our descriptor into a pm2 ecosystem file next to it.
        let ecosystem = pm2_ecosystem(descriptor);
        let path = descriptor.cwd.join(".berth").join("pm2.config.json");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StrategyError::Runtime(e.to_string()))?;
        }
        let rendered = serde_json::to_string_pretty(&ecosystem)
            .map_err(|e| StrategyError::Runtime(e.to_string()))?;
        std::fs::write(&path, rendered).map_err(|e| StrategyError::Runtime(e.to_string()))?;

        let path_str = path.to_string_lossy().into_owned();
        self.run(&["start", &path_str, "--update-env"], Some(&descriptor.cwd))
            .await?;
        debug!(name = %descriptor.name, "supervisor process started");
        Ok(())
    }

    async fn delete(&self, name: &str) -> StrategyResult<()> {
        // pm2 exits non-zero when the process is unknown; that counts
        // as success for delete.
        if let Err(e) = self.run(&["delete", name], None).await {
            debug!(%name, error = %e, "supervisor delete ignored");
        }
        Ok(())
    }

    async fn describe(&self, name: &str) -> StrategyResult<Option<ProcessState>> {
        let raw = self.run(&["jlist"], None).await?;
        parse_jlist(&raw, name, epoch_secs())
    }

    async fn scale(&self, name: &str, instances: u32) -> StrategyResult<()> {
        let count = instances.to_string();
        self.run(&["scale", name, &count], None).await?;
        Ok(())
    }
}

// ── jlist parsing ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Pm2Process {
    name: String,
    pid: Option<u32>,
    #[serde(default)]
    pm2_env: Pm2Env,
    #[serde(default)]
    monit: Pm2Monit,
}

#[derive(Debug, Default, Deserialize)]
struct Pm2Env {
    #[serde(default)]
    status: String,
    #[serde(default)]
    restart_time: u32,
    /// Process start time, unix epoch milliseconds.
    pm_uptime: Option<u64>,
    instances: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct Pm2Monit {
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    cpu: f64,
}

/// Parse `pm2 jlist` output, aggregating all entries with the given
/// name (cluster mode lists one entry per instance).
fn parse_jlist(raw: &str, name: &str, now_secs: u64) -> StrategyResult<Option<ProcessState>> {
    let processes: Vec<Pm2Process> = serde_json::from_str(raw).map_err(|e| {
        StrategyError::Runtime(format!("failed to parse supervisor process list: {e}"))
    })?;

    let matching: Vec<&Pm2Process> = processes.iter().filter(|p| p.name == name).collect();
    let Some(first) = matching.first() else {
        return Ok(None);
    };

    let uptime_secs = first
        .pm2_env
        .pm_uptime
        .map(|started_ms| now_secs.saturating_sub(started_ms / 1000))
        .unwrap_or(0);

    // The process counts as online only when every instance is.
    let status = if matching
        .iter()
        .all(|p| p.pm2_env.status == "online")
    {
        SupervisorStatus::Online
    } else {
        let worst = matching
            .iter()
            .find(|p| p.pm2_env.status != "online")
            .map(|p| p.pm2_env.status.as_str())
            .unwrap_or("stopped");
        SupervisorStatus::from_pm2(worst)
    };

    if matching.len() > 1 {
        warn!(%name, entries = matching.len(), "aggregating cluster-mode instances");
    }

    Ok(Some(ProcessState {
        status,
        pid: first.pid,
        uptime_secs,
        restarts: matching.iter().map(|p| p.pm2_env.restart_time).max().unwrap_or(0),
        cpu_percent: matching.iter().map(|p| p.monit.cpu).sum(),
        memory_bytes: matching.iter().map(|p| p.monit.memory).sum(),
        instances: first
            .pm2_env
            .instances
            .unwrap_or(matching.len() as u32),
    }))
}

/// Render a pm2 ecosystem config from a descriptor.
fn pm2_ecosystem(descriptor: &ProcessDescriptor) -> serde_json::Value {
    let mut env: HashMap<&str, &str> = HashMap::new();
    for (k, v) in &descriptor.env {
        env.insert(k.as_str(), v.as_str());
    }
    serde_json::json!({
        "apps": [{
            "name": descriptor.name,
            "script": descriptor.command,
            "args": descriptor.args,
            "cwd": descriptor.cwd,
            "env": env,
            "instances": descriptor.instances,
            "autorestart": true,
            "watch": false,
            "max_memory_restart": format!("{}M", descriptor.max_memory_restart / (1024 * 1024)),
            "max_restarts": descriptor.max_restarts,
            "out_file": descriptor.out_file,
            "error_file": descriptor.error_file,
        }]
    })
}

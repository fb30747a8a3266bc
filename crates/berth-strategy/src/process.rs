//! Supervised-process deployment strategy.
//!
//! Installs dependencies, writes a process descriptor under
//! `.berth/process.json` in the workdir, and starts the application
//! under an external supervisor. Health is derived from supervisor
//! state: a process that is not online, over its memory-restart
//! threshold, or past the restart ceiling is unhealthy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use berth_core::{epoch_secs, Deployment, HealthState, MetricSample, Project};

use crate::error::{StrategyError, StrategyResult};
use crate::host::HostCapacity;
use crate::strategy::{merged_env, DeploymentStrategy, HealthReport, LogOptions};
use crate::supervisor::{Supervisor, SupervisorStatus};
use crate::workspace::{copy_dir_recursive, remove_workdir};

/// Restarts past this count mark the process unhealthy.
pub const MAX_RESTARTS: u32 = 10;

/// Ceiling on the dependency-install step.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

const DEFAULT_HEALTH_WAIT: Duration = Duration::from_secs(30);
const HEALTH_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Supervisor process descriptor written into the workdir.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDescriptor {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub instances: u32,
    /// Restart the process when it exceeds this many bytes.
    pub max_memory_restart: u64,
    /// Restart ceiling before the process counts as failing.
    pub max_restarts: u32,
    pub out_file: PathBuf,
    pub error_file: PathBuf,
}

/// Deploys an application as a supervised OS process.
pub struct ProcessStrategy {
    supervisor: Arc<dyn Supervisor>,
    deployment: Deployment,
    project: Project,
    work_dir: PathBuf,
    capacity: HostCapacity,
    health_wait: Duration,
}

impl ProcessStrategy {
    pub fn new(
        supervisor: Arc<dyn Supervisor>,
        deployment: Deployment,
        project: Project,
        work_dir: PathBuf,
        capacity: HostCapacity,
    ) -> Self {
        Self {
            supervisor,
            deployment,
            project,
            work_dir,
            capacity,
            health_wait: DEFAULT_HEALTH_WAIT,
        }
    }

    /// Override the health wait window (for tests).
    pub fn with_health_wait(mut self, wait: Duration) -> Self {
        self.health_wait = wait;
        self
    }

    /// Supervisor process name. Shared per (project, branch) so a
    /// re-deploy of the same branch replaces the previous process.
    pub fn process_name(&self) -> String {
        format!("berth-{}-{}", self.project.id, self.deployment.branch).to_lowercase()
    }

    /// Build the descriptor for this deployment.
    pub fn descriptor(&self) -> ProcessDescriptor {
        let (command, args) = match &self.project.process {
            Some(spec) => (spec.command.clone(), spec.args.clone()),
            None => ("npm".to_string(), vec!["start".to_string()]),
        };
        let name = self.process_name();
        let log_dir = self.work_dir.join(".berth").join("logs");
        ProcessDescriptor {
            out_file: log_dir.join(format!("{name}.out.log")),
            error_file: log_dir.join(format!("{name}.err.log")),
            name,
            command,
            args,
            cwd: self.work_dir.clone(),
            env: merged_env(&self.project, &self.deployment),
            instances: self.deployment.instances.max(1),
            max_memory_restart: self.deployment.resources.memory_bytes,
            max_restarts: MAX_RESTARTS,
        }
    }

    async fn install_dependencies(&self) -> StrategyResult<()> {
        let Some(install) = self
            .project
            .process
            .as_ref()
            .and_then(|spec| spec.install.clone())
        else {
            return Ok(());
        };

        info!(project = %self.project.name, %install, "installing dependencies");
        let output = tokio::time::timeout(
            INSTALL_TIMEOUT,
            Command::new("sh")
                .arg("-c")
                .arg(&install)
                .current_dir(&self.work_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| StrategyError::Runtime(format!("install command timed out: {install}")))?
        .map_err(|e| StrategyError::Runtime(format!("failed to run install command: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StrategyError::Runtime(format!(
                "install command failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn wait_for_online(&self) -> StrategyResult<()> {
        let name = self.process_name();
        let deadline = tokio::time::Instant::now() + self.health_wait;

        loop {
            match self.supervisor.describe(&name).await {
                Ok(Some(state)) if state.status == SupervisorStatus::Online => return Ok(()),
                Ok(Some(state)) if state.status == SupervisorStatus::Errored => {
                    return Err(StrategyError::Runtime(
                        "process errored during startup".to_string(),
                    ));
                }
                // Launching / stopped / not yet listed: keep waiting.
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(StrategyError::HealthTimeout(self.health_wait));
            }
            tokio::time::sleep(HEALTH_WAIT_INTERVAL).await;
        }
    }

    async fn try_deploy(&self) -> StrategyResult<()> {
        self.install_dependencies().await?;

        let descriptor = self.descriptor();
        let descriptor_path = self.work_dir.join(".berth").join("process.json");
        if let Some(parent) = descriptor_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StrategyError::Runtime(e.to_string()))?;
        }
        std::fs::create_dir_all(self.work_dir.join(".berth").join("logs"))
            .map_err(|e| StrategyError::Runtime(e.to_string()))?;
        let rendered = serde_json::to_string_pretty(&descriptor)
            .map_err(|e| StrategyError::Runtime(e.to_string()))?;
        std::fs::write(&descriptor_path, rendered)
            .map_err(|e| StrategyError::Runtime(e.to_string()))?;

        // Replace any process already running under this name.
        self.supervisor.delete(&descriptor.name).await?;

        info!(name = %descriptor.name, "starting supervised process");
        self.supervisor.start(&descriptor).await?;
        self.wait_for_online().await
    }
}

#[async_trait]
impl DeploymentStrategy for ProcessStrategy {
    async fn validate(&self) -> StrategyResult<()> {
        let manifest = self.work_dir.join("package.json");
        if !manifest.is_file() {
            return Err(StrategyError::Configuration(
                "package.json not found in deployment artifacts".to_string(),
            ));
        }
        self.capacity.validate(&self.deployment.resources)
    }

    async fn deploy(&self) -> StrategyResult<()> {
        match self.try_deploy().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(cleanup_err) = self.cleanup().await {
                    warn!(error = %cleanup_err, "cleanup after failed deploy also failed");
                }
                Err(e)
            }
        }
    }

    async fn stop(&self) -> StrategyResult<()> {
        self.supervisor.delete(&self.process_name()).await
    }

    async fn rollback(&self, prior: &Deployment) -> StrategyResult<()> {
        let prior_dir = self
            .work_dir
            .parent()
            .map(|project_dir| project_dir.join(&prior.id))
            .ok_or_else(|| {
                StrategyError::NotFound(format!("workspace for deployment {}", prior.id))
            })?;

        debug!(from = %prior.id, "restoring prior deployment artifacts");
        copy_dir_recursive(&prior_dir, &self.work_dir)?;
        self.deploy().await
    }

    async fn get_logs(&self, options: &LogOptions) -> StrategyResult<String> {
        let name = self.process_name();
        if self.supervisor.describe(&name).await?.is_none() {
            return Err(StrategyError::NotFound(format!(
                "no supervised process named {name}"
            )));
        }

        let descriptor = self.descriptor();
        let mut lines: Vec<String> = Vec::new();
        if !options.errors_only {
            if let Ok(out) = std::fs::read_to_string(&descriptor.out_file) {
                lines.extend(out.lines().map(str::to_string));
            }
        }
        if let Ok(err) = std::fs::read_to_string(&descriptor.error_file) {
            lines.extend(err.lines().map(str::to_string));
        }

        // Supervisor log files carry no structured timestamps; `since`
        // filtering only applies to container logs.
        let tail = options.tail_or_default() as usize;
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].join("\n"))
    }

    async fn cleanup(&self) -> StrategyResult<()> {
        self.supervisor.delete(&self.process_name()).await?;
        remove_workdir(&self.work_dir)?;
        debug!(name = %self.process_name(), "process deployment cleaned up");
        Ok(())
    }

    async fn perform_health_check(&self) -> StrategyResult<HealthReport> {
        let name = self.process_name();
        let Some(state) = self.supervisor.describe(&name).await? else {
            let mut details = HashMap::new();
            details.insert("status".to_string(), serde_json::json!("gone"));
            return Ok(HealthReport {
                state: HealthState::Unhealthy,
                running: false,
                details,
                sample: None,
            });
        };

        let memory_limit = self.deployment.resources.memory_bytes;
        let mut details = HashMap::new();
        details.insert("status".to_string(), serde_json::json!(format!("{:?}", state.status).to_lowercase()));
        details.insert("uptime_secs".to_string(), serde_json::json!(state.uptime_secs));
        details.insert("restarts".to_string(), serde_json::json!(state.restarts));
        details.insert("cpu_percent".to_string(), serde_json::json!(state.cpu_percent));
        details.insert("memory_bytes".to_string(), serde_json::json!(state.memory_bytes));
        details.insert("instances".to_string(), serde_json::json!(state.instances));
        if let Some(pid) = state.pid {
            details.insert("pid".to_string(), serde_json::json!(pid));
        }

        let health = if state.status != SupervisorStatus::Online {
            HealthState::Unhealthy
        } else if memory_limit > 0 && state.memory_bytes > memory_limit {
            details.insert(
                "reason".to_string(),
                serde_json::json!("memory over restart threshold"),
            );
            HealthState::Unhealthy
        } else if state.restarts > MAX_RESTARTS {
            details.insert("reason".to_string(), serde_json::json!("restart ceiling exceeded"));
            HealthState::Unhealthy
        } else {
            HealthState::Healthy
        };

        let running = matches!(
            state.status,
            SupervisorStatus::Online | SupervisorStatus::Launching
        );

        Ok(HealthReport {
            state: health,
            running,
            details,
            sample: Some(MetricSample {
                timestamp: epoch_secs(),
                cpu_percent: state.cpu_percent,
                memory_usage_bytes: state.memory_bytes,
                memory_limit_bytes: memory_limit,
                net_rx_bytes: 0,
                net_tx_bytes: 0,
                disk_read_bytes: 0,
                disk_write_bytes: 0,
            }),
        })
    }

    async fn scale(&self, target_instances: u32) -> StrategyResult<()> {
        let name = self.process_name();
        if self.supervisor.describe(&name).await?.is_none() {
            return Err(StrategyError::NotFound(format!(
                "no supervised process named {name}"
            )));
        }
        self.supervisor.scale(&name, target_instances).await
    }
}

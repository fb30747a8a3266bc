//! Domain types shared across Berth crates.
//!
//! A `Project` is the long-lived application; a `Deployment` is one
//! attempt to run a specific revision of it. Deployments own their
//! scaling rule, health snapshot, and latest metric sample.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::parse::epoch_secs;

/// Unique identifier for a project.
pub type ProjectId = String;

/// Unique identifier for a deployment attempt.
pub type DeploymentId = String;

// ── Project ───────────────────────────────────────────────────────

/// A deployable application registered with the platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Environment variables shared by every deployment of this project.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Port the application listens on, if it serves traffic.
    pub port: Option<u16>,
    /// Container health probe declared by the project, if any.
    pub health_probe: Option<HealthProbe>,
    /// Start configuration for supervisor-based deployments.
    pub process: Option<ProcessSpec>,
    /// Unix timestamp (seconds) when the project was registered.
    pub created_at: u64,
}

/// Health probe declared for container deployments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthProbe {
    /// Probe command in exec form, e.g. `["CMD", "curl", "-f", "http://localhost/health"]`.
    pub test: Vec<String>,
    pub interval_secs: u64,
    /// Consecutive failures before the runtime reports unhealthy.
    pub retries: u32,
}

/// How to start a supervised process for this project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSpec {
    /// Command used to start the application.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Dependency-install command run in the workdir before start.
    pub install: Option<String>,
}

// ── Deployment ────────────────────────────────────────────────────

/// One attempt to run a specific revision of a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub project_id: ProjectId,
    pub commit_hash: String,
    pub branch: String,
    pub status: DeploymentStatus,
    pub resources: ResourceLimits,
    /// Autoscaling policy bound to this deployment, if any.
    pub scaling: Option<ScalingRule>,
    /// Current instance count.
    pub instances: u32,
    pub health: HealthSnapshot,
    /// Most recent metric sample flushed by the monitor.
    pub last_sample: Option<MetricSample>,
    /// Human-readable cause when the deployment failed.
    pub error: Option<String>,
    /// Id of the completed deployment this one replays, when created
    /// by a rollback.
    pub rollback_from: Option<DeploymentId>,
    /// Per-deployment environment overrides. Win over project env.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub created_at: u64,
}

impl Deployment {
    /// Allocate a fresh `pending` deployment record.
    pub fn new(project_id: &str, commit_hash: &str, branch: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            commit_hash: commit_hash.to_string(),
            branch: branch.to_string(),
            status: DeploymentStatus::Pending,
            resources: ResourceLimits::default(),
            scaling: None,
            instances: 1,
            health: HealthSnapshot::default(),
            last_sample: None,
            error: None,
            rollback_from: None,
            env: HashMap::new(),
            started_at: None,
            completed_at: None,
            created_at: epoch_secs(),
        }
    }

    /// Whether this deployment ever reached `completed` (it may have
    /// been stopped or gone unhealthy since). Such deployments are
    /// valid rollback sources.
    pub fn ever_completed(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Completed | DeploymentStatus::Stopped | DeploymentStatus::Unhealthy
        ) && self.completed_at.is_some()
    }
}

/// Lifecycle status of a deployment.
///
/// ```text
/// pending → in_progress → {completed, failed, cancelled}
/// completed ↔ unhealthy          (monitor-driven)
/// completed | unhealthy → stopped (explicit stop)
/// ```
///
/// `failed`, `cancelled`, and `stopped` are terminal; retries and
/// rollbacks create a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Stopped,
    Unhealthy,
}

impl DeploymentStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Stopped)
    }

    /// Whether a live runtime is expected behind this status.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Completed | Self::Unhealthy)
    }

    /// Valid transitions of the deployment state machine.
    pub fn can_transition(self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Completed, Stopped)
                | (Completed, Unhealthy)
                | (Unhealthy, Completed)
                | (Unhealthy, Stopped)
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Resource limits requested for one deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    /// CPU share in cores (1.0 = one full core).
    pub cpu_shares: f64,
    /// Storage quota in bytes for the project volume.
    pub storage_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            cpu_shares: 1.0,
            storage_bytes: 1024 * 1024 * 1024,
        }
    }
}

// ── Scaling rules ─────────────────────────────────────────────────

/// Metric a scaling rule evaluates.
///
/// `External` names an opaque numeric signal supplied by a
/// collaborator (e.g. repository traffic load on a 0–100 scale);
/// the engine never computes these itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Network,
    External(String),
}

/// Comparison operator between a metric value and a rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl Operator {
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Ge => value >= threshold,
            Self::Le => value <= threshold,
            Self::Eq => value == threshold,
        }
    }
}

/// Direction a triggered rule moves the instance count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
}

/// Floor on rule cooldowns, to prevent oscillation.
pub const MIN_COOLDOWN_SECS: u64 = 60;

/// Default cooldown between scaling actions (5 minutes).
pub const DEFAULT_COOLDOWN_SECS: u64 = 300;

fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

/// One autoscaling policy bound to a deployment or project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingRule {
    pub metric: MetricKind,
    pub operator: Operator,
    pub threshold: f64,
    pub action: ScaleAction,
    pub min_instances: u32,
    pub max_instances: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Unix timestamp of the last scaling action this rule triggered.
    pub last_action: Option<u64>,
}

/// Validation failures for a scaling rule.
#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("instance bounds must satisfy max >= min >= 1 (got min={min}, max={max})")]
    Bounds { min: u32, max: u32 },

    #[error("cooldown must be at least {MIN_COOLDOWN_SECS}s (got {0}s)")]
    Cooldown(u64),

    #[error("threshold must be a finite number (got {0})")]
    Threshold(f64),
}

impl ScalingRule {
    /// Check the rule invariants: max ≥ min ≥ 1, cooldown ≥ 60s,
    /// finite threshold.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.min_instances < 1 || self.max_instances < self.min_instances {
            return Err(RuleError::Bounds {
                min: self.min_instances,
                max: self.max_instances,
            });
        }
        if self.cooldown_secs < MIN_COOLDOWN_SECS {
            return Err(RuleError::Cooldown(self.cooldown_secs));
        }
        if !self.threshold.is_finite() {
            return Err(RuleError::Threshold(self.threshold));
        }
        Ok(())
    }

    /// Target instance count after applying this rule's action once,
    /// clamped to the rule's bounds. Never moves by more than one step.
    pub fn step(&self, current: u32) -> u32 {
        match self.action {
            ScaleAction::ScaleUp => current.saturating_add(1).min(self.max_instances),
            ScaleAction::ScaleDown => current.saturating_sub(1).max(self.min_instances),
        }
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// A timestamped resource observation for one deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    /// Unix timestamp (seconds) when the sample was taken.
    pub timestamp: u64,
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

impl MetricSample {
    /// Memory usage as a percentage of the limit. Zero when no limit
    /// is known.
    pub fn memory_percent(&self) -> f64 {
        if self.memory_limit_bytes == 0 {
            0.0
        } else {
            self.memory_usage_bytes as f64 / self.memory_limit_bytes as f64 * 100.0
        }
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Health as determined by strategy health checks.
///
/// `Unknown` covers deployments with no declared probe and
/// deployments that have never been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Latest health observation persisted on a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSnapshot {
    pub state: HealthState,
    /// Unix timestamp of the last health check, if any.
    pub last_check: Option<u64>,
    /// Strategy-specific diagnostics: process uptime and restart
    /// count, or container exit code and stats. An open map, not a
    /// fixed schema.
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            last_check: None,
            details: HashMap::new(),
        }
    }
}

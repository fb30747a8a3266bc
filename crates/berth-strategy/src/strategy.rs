//! The deployment strategy capability set.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use berth_core::{Deployment, HealthState, MetricSample};

use crate::error::StrategyResult;

/// Options for log retrieval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    /// Number of trailing lines to return. Defaults to 100.
    pub tail: Option<u32>,
    /// Only lines at or after this unix timestamp (seconds).
    pub since: Option<u64>,
    /// Only error output.
    #[serde(default)]
    pub errors_only: bool,
}

impl LogOptions {
    pub fn tail_or_default(&self) -> u32 {
        self.tail.unwrap_or(100)
    }
}

/// Result of a single strategy health check.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub state: HealthState,
    /// Whether the underlying container/process is running at all.
    pub running: bool,
    /// Strategy-specific diagnostics (uptime, restarts, exit code, ...).
    pub details: HashMap<String, serde_json::Value>,
    /// Resource sample taken during the check, when the runtime was
    /// reachable.
    pub sample: Option<MetricSample>,
}

impl HealthReport {
    /// Report for a runtime that could not be reached at all. Used by
    /// the monitor when the health query itself errors.
    pub fn unreachable(reason: impl Into<String>) -> Self {
        let mut details = HashMap::new();
        details.insert(
            "error".to_string(),
            serde_json::Value::String(reason.into()),
        );
        Self {
            state: HealthState::Unhealthy,
            running: false,
            details,
            sample: None,
        }
    }
}

/// Environment seen by a deployed workload: platform defaults ∪
/// project vars ∪ per-deployment overrides, later layers winning.
pub fn merged_env(
    project: &berth_core::Project,
    deployment: &Deployment,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("BERTH_PROJECT".to_string(), project.name.clone());
    env.insert("BERTH_DEPLOYMENT".to_string(), deployment.id.clone());
    if let Some(port) = project.port {
        env.insert("PORT".to_string(), port.to_string());
    }
    env.extend(project.env.clone());
    env.extend(deployment.env.clone());
    env
}

/// Capability set every deployment strategy implements.
///
/// Strategy operations are blocking I/O against an external runtime
/// and must run off any request-handling task.
#[async_trait]
pub trait DeploymentStrategy: Send + Sync {
    /// Check artifacts and resource limits before deploying. Fails
    /// with `Configuration` when the build descriptor is missing or
    /// the requested resources exceed host capacity.
    async fn validate(&self) -> StrategyResult<()>;

    /// Realize the deployment and wait for it to become healthy.
    ///
    /// Idempotent with respect to naming: re-deploying the same name
    /// replaces the previous runtime instead of duplicating it. On any
    /// failure, performs a best-effort `cleanup()` before re-raising.
    async fn deploy(&self) -> StrategyResult<()>;

    /// Stop the running workload. Succeeds even when the target no
    /// longer exists.
    async fn stop(&self) -> StrategyResult<()>;

    /// Replay a prior completed deployment: restore its artifacts into
    /// this deployment's workspace, then deploy.
    async fn rollback(&self, prior: &Deployment) -> StrategyResult<()>;

    /// Retrieve runtime logs. Fails with `NotFound` when the
    /// deployment has no live runtime handle.
    async fn get_logs(&self, options: &LogOptions) -> StrategyResult<String>;

    /// Release the workspace and runtime-level resources. Safe to call
    /// multiple times. Project-shared resources (network, volume) are
    /// only destroyed when no sibling deployment still references them.
    async fn cleanup(&self) -> StrategyResult<()>;

    /// Query runtime state and resource usage.
    async fn perform_health_check(&self) -> StrategyResult<HealthReport>;

    /// Change the number of running instances.
    async fn scale(&self, target_instances: u32) -> StrategyResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::Project;

    #[test]
    fn merged_env_later_layers_win() {
        let mut project = Project {
            id: "p1".to_string(),
            name: "api".to_string(),
            env: HashMap::from([
                ("NODE_ENV".to_string(), "production".to_string()),
                ("PORT".to_string(), "8080".to_string()),
            ]),
            port: Some(3000),
            health_probe: None,
            process: None,
            created_at: 1000,
        };
        let mut deployment = Deployment::new("p1", "abc", "main");
        deployment
            .env
            .insert("NODE_ENV".to_string(), "staging".to_string());

        let env = merged_env(&project, &deployment);
        // Project env overrides the platform-default PORT; deployment
        // env overrides project env.
        assert_eq!(env.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(env.get("NODE_ENV").map(String::as_str), Some("staging"));
        assert_eq!(env.get("BERTH_PROJECT").map(String::as_str), Some("api"));

        project.env.remove("PORT");
        let env = merged_env(&project, &deployment);
        assert_eq!(env.get("PORT").map(String::as_str), Some("3000"));
    }

    #[test]
    fn unreachable_report_is_unhealthy_and_not_running() {
        let report = HealthReport::unreachable("connection refused");
        assert_eq!(report.state, HealthState::Unhealthy);
        assert!(!report.running);
        assert_eq!(
            report.details.get("error").and_then(|v| v.as_str()),
            Some("connection refused")
        );
        assert!(report.sample.is_none());
    }

    #[test]
    fn log_options_default_tail() {
        let opts = LogOptions::default();
        assert_eq!(opts.tail_or_default(), 100);
        assert!(!opts.errors_only);

        let opts = LogOptions {
            tail: Some(20),
            ..Default::default()
        };
        assert_eq!(opts.tail_or_default(), 20);
    }
}

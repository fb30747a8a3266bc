//! Container deployment strategy backed by the Docker API.
//!
//! Builds an image from the deployment's artifacts (the build itself
//! is an opaque `docker build` step), creates a project-scoped network
//! and volume if absent, and starts containers bound to them with the
//! configured memory/CPU caps and the declared health probe.
//!
//! Replicas beyond the first are named `{name}-{index}`. The network
//! and volume are shared across a project's deployments and only
//! removed when no sibling container still exists.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use bollard::models::{
    ContainerCreateBody, ContainerStatsResponse, Health, HealthConfig, HealthStatusEnum,
    HostConfig, NetworkCreateRequest, PortBinding, RestartPolicy, RestartPolicyNameEnum,
    VolumeCreateRequest,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, RemoveImageOptions, RemoveVolumeOptions,
    StartContainerOptions, StatsOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::Docker;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use berth_core::{epoch_secs, Deployment, HealthState, MetricSample, Project};

use crate::error::{StrategyError, StrategyResult};
use crate::host::HostCapacity;
use crate::strategy::{merged_env, DeploymentStrategy, HealthReport, LogOptions};
use crate::workspace::{copy_dir_recursive, remove_workdir};

/// Ceiling on the opaque image-build step.
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

const DEFAULT_HEALTH_WAIT: Duration = Duration::from_secs(30);
const HEALTH_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Deploys an application as Docker containers.
pub struct DockerStrategy {
    docker: Docker,
    deployment: Deployment,
    project: Project,
    work_dir: PathBuf,
    capacity: HostCapacity,
    health_wait: Duration,
}

impl DockerStrategy {
    pub fn connect(
        deployment: Deployment,
        project: Project,
        work_dir: PathBuf,
        capacity: HostCapacity,
    ) -> StrategyResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| StrategyError::Runtime(format!("docker is not available: {e}")))?;
        Ok(Self {
            docker,
            deployment,
            project,
            work_dir,
            capacity,
            health_wait: DEFAULT_HEALTH_WAIT,
        })
    }

    /// Override the health wait window (for tests).
    pub fn with_health_wait(mut self, wait: Duration) -> Self {
        self.health_wait = wait;
        self
    }

    /// Container (and image) name. Shared per (project, branch) so a
    /// re-deploy of the same branch replaces the previous containers.
    pub fn container_name(&self) -> String {
        format!("berth-{}-{}", self.project.id, self.deployment.branch).to_lowercase()
    }

    pub fn network_name(&self) -> String {
        format!("berth-net-{}", self.project.id).to_lowercase()
    }

    pub fn volume_name(&self) -> String {
        format!("berth-vol-{}", self.project.id).to_lowercase()
    }

    fn replica_name(&self, index: u32) -> String {
        let base = self.container_name();
        if index == 0 {
            base
        } else {
            format!("{base}-{index}")
        }
    }

    /// Inverse of `replica_name`, for container names listed by label.
    fn replica_index(&self, name: &str) -> Option<u32> {
        let base = self.container_name();
        let name = name.strip_prefix('/').unwrap_or(name);
        if name == base {
            return Some(0);
        }
        name.strip_prefix(&format!("{base}-"))
            .and_then(|suffix| suffix.parse().ok())
    }

    fn labels(&self) -> HashMap<String, String> {
        HashMap::from([
            ("berth.managed".to_string(), "true".to_string()),
            ("berth.project".to_string(), self.project.id.clone()),
            ("berth.deployment".to_string(), self.deployment.id.clone()),
            ("berth.name".to_string(), self.container_name()),
        ])
    }

    /// Container configuration shared by all replicas.
    fn container_body(&self) -> ContainerCreateBody {
        let mut env: Vec<String> = merged_env(&self.project, &self.deployment)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.sort();

        let healthcheck = self.project.health_probe.as_ref().map(|probe| HealthConfig {
            test: Some(probe.test.clone()),
            interval: Some(probe.interval_secs as i64 * 1_000_000_000),
            retries: Some(probe.retries as i64),
            ..Default::default()
        });

        let (exposed_ports, port_bindings) = match self.project.port {
            Some(port) => {
                let key = format!("{port}/tcp");
                let exposed = vec![key.clone()];
                let bindings = HashMap::from([(
                    key,
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(port.to_string()),
                    }]),
                )]);
                (Some(exposed), Some(bindings))
            }
            None => (None, None),
        };

        ContainerCreateBody {
            image: Some(self.container_name()),
            env: Some(env),
            labels: Some(self.labels()),
            healthcheck,
            exposed_ports,
            host_config: Some(HostConfig {
                memory: Some(self.deployment.resources.memory_bytes as i64),
                nano_cpus: Some((self.deployment.resources.cpu_shares * 1e9) as i64),
                network_mode: Some(self.network_name()),
                binds: Some(vec![format!("{}:/data", self.volume_name())]),
                port_bindings,
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn build_image(&self) -> StrategyResult<()> {
        let tag = self.container_name();
        info!(%tag, "building image");

        let output = tokio::time::timeout(
            BUILD_TIMEOUT,
            Command::new("docker")
                .args(["build", "-t", &tag, "."])
                .current_dir(&self.work_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| StrategyError::Runtime(format!("image build for {tag} timed out")))?
        .map_err(|e| StrategyError::Runtime(format!("failed to run docker build: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StrategyError::Runtime(format!(
                "image build failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn ensure_network(&self) -> StrategyResult<()> {
        let result = self
            .docker
            .create_network(NetworkCreateRequest {
                name: self.network_name(),
                ..Default::default()
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(StrategyError::Runtime(format!(
                "failed to create network: {e}"
            ))),
        }
    }

    async fn ensure_volume(&self) -> StrategyResult<()> {
        // Volume creation is idempotent by name on the Docker side.
        self.docker
            .create_volume(VolumeCreateRequest {
                name: Some(self.volume_name()),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| StrategyError::Runtime(format!("failed to create volume: {e}")))
    }

    /// Containers of this deployment name, as (name, index) pairs.
    async fn list_replicas(&self) -> StrategyResult<Vec<(String, u32)>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("berth.name={}", self.container_name())],
        )]);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| StrategyError::Runtime(format!("failed to list containers: {e}")))?;

        let mut replicas = Vec::new();
        for container in containers {
            for name in container.names.unwrap_or_default() {
                if let Some(index) = self.replica_index(&name) {
                    replicas.push((name.trim_start_matches('/').to_string(), index));
                    break;
                }
            }
        }
        Ok(replicas)
    }

    async fn remove_container(&self, name: &str) -> StrategyResult<()> {
        let stop_options = StopContainerOptionsBuilder::default().t(10).build();
        if let Err(e) = self.docker.stop_container(name, Some(stop_options)).await {
            if !is_not_found(&e) {
                debug!(%name, error = %e, "container stop ignored");
            }
        }
        let remove_options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self.docker.remove_container(name, Some(remove_options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(StrategyError::Runtime(format!(
                "failed to remove container {name}: {e}"
            ))),
        }
    }

    async fn start_replica(&self, index: u32) -> StrategyResult<()> {
        let name = self.replica_name(index);
        let options = CreateContainerOptionsBuilder::default().name(&name).build();
        self.docker
            .create_container(Some(options), self.container_body())
            .await
            .map_err(|e| StrategyError::Runtime(format!("failed to create container {name}: {e}")))?;
        self.docker
            .start_container(&name, None::<StartContainerOptions>)
            .await
            .map_err(|e| StrategyError::Runtime(format!("failed to start container {name}: {e}")))?;
        Ok(())
    }

    async fn wait_for_healthy(&self) -> StrategyResult<()> {
        let name = self.container_name();
        let has_probe = self.project.health_probe.is_some();
        let deadline = tokio::time::Instant::now() + self.health_wait;

        loop {
            if let Ok(inspect) = self
                .docker
                .inspect_container(&name, None::<InspectContainerOptions>)
                .await
            {
                let state = inspect.state.unwrap_or_default();
                let running = state.running.unwrap_or(false);
                if !running {
                    if let Some(code) = state.exit_code {
                        return Err(StrategyError::Runtime(format!(
                            "container exited with code {code} during startup"
                        )));
                    }
                } else {
                    let probe_status = state.health.as_ref().and_then(|h| h.status);
                    match (has_probe, probe_status) {
                        (false, _) => return Ok(()),
                        (true, Some(HealthStatusEnum::HEALTHY)) => return Ok(()),
                        _ => {}
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(StrategyError::HealthTimeout(self.health_wait));
            }
            tokio::time::sleep(HEALTH_WAIT_INTERVAL).await;
        }
    }

    async fn try_deploy(&self) -> StrategyResult<()> {
        self.build_image().await?;
        self.ensure_network().await?;
        self.ensure_volume().await?;

        // Replace any containers already running under this name.
        for (name, _) in self.list_replicas().await? {
            self.remove_container(&name).await?;
        }

        info!(name = %self.container_name(), "starting container");
        self.start_replica(0).await?;
        self.wait_for_healthy().await
    }
}

#[async_trait]
impl DeploymentStrategy for DockerStrategy {
    async fn validate(&self) -> StrategyResult<()> {
        if !self.work_dir.join("Dockerfile").is_file() {
            return Err(StrategyError::Configuration(
                "Dockerfile not found in deployment artifacts".to_string(),
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
        for (name, _) in self.list_replicas().await? {
            self.remove_container(&name).await?;
        }
        Ok(())
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
        let name = self.container_name();
        let mut builder = LogsOptionsBuilder::default()
            .stdout(!options.errors_only)
            .stderr(true)
            .timestamps(true)
            .tail(&options.tail_or_default().to_string());
        if let Some(since) = options.since {
            builder = builder.since(since as i32);
        }

        let mut stream = self.docker.logs(&name, Some(builder.build()));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(e) if is_not_found(&e) => {
                    return Err(StrategyError::NotFound(format!("no container named {name}")));
                }
                Err(e) => {
                    return Err(StrategyError::Runtime(format!("failed to read logs: {e}")));
                }
            }
        }
        Ok(out)
    }

    async fn cleanup(&self) -> StrategyResult<()> {
        self.stop().await?;

        let image = self.container_name();
        if let Err(e) = self
            .docker
            .remove_image(&image, None::<RemoveImageOptions>, None)
            .await
        {
            if !is_not_found(&e) {
                debug!(%image, error = %e, "image removal ignored");
            }
        }

        // Only tear down the project network/volume when no sibling
        // deployment still has containers on them.
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("berth.project={}", self.project.id)],
        )]);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();
        let siblings = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| StrategyError::Runtime(format!("failed to list containers: {e}")))?;

        if siblings.is_empty() {
            if let Err(e) = self.docker.remove_network(&self.network_name()).await {
                if !is_not_found(&e) {
                    debug!(error = %e, "network removal ignored");
                }
            }
            if let Err(e) = self
                .docker
                .remove_volume(&self.volume_name(), None::<RemoveVolumeOptions>)
                .await
            {
                if !is_not_found(&e) {
                    debug!(error = %e, "volume removal ignored");
                }
            }
        }

        remove_workdir(&self.work_dir)?;
        debug!(name = %self.container_name(), "container deployment cleaned up");
        Ok(())
    }

    async fn perform_health_check(&self) -> StrategyResult<HealthReport> {
        let name = self.container_name();
        let inspect = match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => {
                let mut details = HashMap::new();
                details.insert("status".to_string(), serde_json::json!("gone"));
                return Ok(HealthReport {
                    state: HealthState::Unhealthy,
                    running: false,
                    details,
                    sample: None,
                });
            }
            Err(e) => {
                return Err(StrategyError::Runtime(format!(
                    "failed to inspect container {name}: {e}"
                )));
            }
        };

        let state = inspect.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);

        let mut details = HashMap::new();
        if let Some(status) = state.status {
            details.insert("status".to_string(), serde_json::json!(status.to_string()));
        }
        if let Some(restarts) = inspect.restart_count {
            details.insert("restarts".to_string(), serde_json::json!(restarts));
        }

        if !running {
            details.insert(
                "exit_code".to_string(),
                serde_json::json!(state.exit_code.unwrap_or_default()),
            );
            return Ok(HealthReport {
                state: HealthState::Unhealthy,
                running: false,
                details,
                sample: None,
            });
        }

        if let Some(started_at) = state.started_at.as_deref() {
            details.insert("started_at".to_string(), serde_json::json!(started_at));
            if let Ok(started) = chrono::DateTime::parse_from_rfc3339(started_at) {
                let uptime = (chrono::Utc::now() - started.with_timezone(&chrono::Utc))
                    .num_seconds()
                    .max(0);
                details.insert("uptime_secs".to_string(), serde_json::json!(uptime));
            }
        }

        let health = health_from_probe(state.health.as_ref());
        if let Some(probe_status) = state.health.as_ref().and_then(|h| h.status) {
            details.insert(
                "probe".to_string(),
                serde_json::json!(probe_status.to_string()),
            );
        }

        let stats_options = StatsOptionsBuilder::default()
            .stream(false)
            .one_shot(true)
            .build();
        let mut stats_stream = self.docker.stats(&name, Some(stats_options));
        let stats = stats_stream
            .next()
            .await
            .transpose()
            .map_err(|e| StrategyError::Runtime(format!("failed to read stats: {e}")))?;

        let sample = stats.map(|s| sample_from_stats(&s, epoch_secs()));
        if let Some(sample) = &sample {
            details.insert(
                "cpu_percent".to_string(),
                serde_json::json!(sample.cpu_percent),
            );
            details.insert(
                "memory_percent".to_string(),
                serde_json::json!(sample.memory_percent()),
            );
        }

        Ok(HealthReport {
            state: health,
            running: true,
            details,
            sample,
        })
    }

    async fn scale(&self, target_instances: u32) -> StrategyResult<()> {
        let replicas = self.list_replicas().await?;
        let existing: std::collections::HashSet<u32> =
            replicas.iter().map(|(_, index)| *index).collect();

        for index in 0..target_instances {
            if !existing.contains(&index) {
                self.start_replica(index).await?;
            }
        }
        for (name, index) in &replicas {
            if *index >= target_instances {
                self.remove_container(name).await?;
            }
        }
        info!(
            name = %self.container_name(),
            from = replicas.len(),
            to = target_instances,
            "containers scaled"
        );
        Ok(())
    }
}

/// Health state from a container's declared probe. Containers without
/// a probe report `Unknown`.
fn health_from_probe(health: Option<&Health>) -> HealthState {
    match health.and_then(|h| h.status) {
        Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
        _ => HealthState::Unknown,
    }
}

/// CPU usage as a percentage, derived from the delta of cumulative
/// container CPU counters over the delta of system CPU counters,
/// scaled by the online core count.
fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u32) -> f64 {
    if system_delta == 0 {
        return 0.0;
    }
    cpu_delta as f64 / system_delta as f64 * online_cpus as f64 * 100.0
}

/// Project a Docker stats response into a metric sample.
fn sample_from_stats(stats: &ContainerStatsResponse, timestamp: u64) -> MetricSample {
    let total_usage = |cpu: Option<&bollard::models::ContainerCpuStats>| {
        cpu.and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0)
    };
    let system_usage = |cpu: Option<&bollard::models::ContainerCpuStats>| {
        cpu.and_then(|c| c.system_cpu_usage).unwrap_or(0)
    };

    let cpu_delta = total_usage(stats.cpu_stats.as_ref())
        .saturating_sub(total_usage(stats.precpu_stats.as_ref()));
    let system_delta = system_usage(stats.cpu_stats.as_ref())
        .saturating_sub(system_usage(stats.precpu_stats.as_ref()));
    let online_cpus = stats
        .cpu_stats
        .as_ref()
        .and_then(|c| c.online_cpus)
        .unwrap_or(1);

    let (mut net_rx, mut net_tx) = (0u64, 0u64);
    if let Some(networks) = &stats.networks {
        for net in networks.values() {
            net_rx += net.rx_bytes.unwrap_or(0);
            net_tx += net.tx_bytes.unwrap_or(0);
        }
    }

    let (mut disk_read, mut disk_write) = (0u64, 0u64);
    if let Some(entries) = stats
        .blkio_stats
        .as_ref()
        .and_then(|b| b.io_service_bytes_recursive.as_ref())
    {
        for entry in entries {
            match entry.op.as_deref() {
                Some("Read") | Some("read") => disk_read += entry.value.unwrap_or(0),
                Some("Write") | Some("write") => disk_write += entry.value.unwrap_or(0),
                _ => {}
            }
        }
    }

    MetricSample {
        timestamp,
        cpu_percent: cpu_percent(cpu_delta, system_delta, online_cpus),
        memory_usage_bytes: stats
            .memory_stats
            .as_ref()
            .and_then(|m| m.usage)
            .unwrap_or(0),
        memory_limit_bytes: stats
            .memory_stats
            .as_ref()
            .and_then(|m| m.limit)
            .unwrap_or(0),
        net_rx_bytes: net_rx,
        net_tx_bytes: net_tx,
        disk_read_bytes: disk_read,
        disk_write_bytes: disk_write,
    }
}

/// Whether a Docker API error is a 404 for a missing object.
fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Whether a Docker API error is a 409 conflict (already exists).
fn is_conflict(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

//! The orchestrator — create/cancel/stop/rollback/scale over the
//! deployment state machine.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use berth_core::{epoch_secs, Deployment, DeploymentStatus, Project, ResourceLimits, ScalingRule};
use berth_monitor::Monitor;
use berth_state::StateStore;
use berth_strategy::{DeploymentStrategy, LogOptions, StrategyFactory};

use crate::commands::{Command, CommandEnvelope, CommandReport};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Inputs for creating a deployment.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Pre-allocated id, when the collaborator has already populated
    /// the workspace for it. Generated when absent.
    pub deployment_id: Option<String>,
    pub project_id: String,
    pub commit_hash: String,
    pub branch: String,
    pub env: HashMap<String, String>,
    pub resources: Option<ResourceLimits>,
    pub scaling: Option<ScalingRule>,
}

enum DeployOutcome {
    Success,
    Cancelled,
    Failed(OrchestratorError),
}

/// Owns the deployment state machine.
///
/// Lifecycle operations on a single deployment id are serialized by a
/// per-id lock; `cancel` reaches an in-flight `deploy` through a
/// per-id watch channel instead.
pub struct Orchestrator {
    state: StateStore,
    factory: Arc<dyn StrategyFactory>,
    monitor: Arc<Monitor>,
    /// Per-deployment lifecycle locks.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Cancellation signals for in-flight lifecycle operations.
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl Orchestrator {
    pub fn new(state: StateStore, factory: Arc<dyn StrategyFactory>, monitor: Arc<Monitor>) -> Self {
        Self {
            state,
            factory,
            monitor,
            locks: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Create and run a deployment. The returned record carries the
    /// terminal outcome: `completed` on success, `failed` with the
    /// causing error after best-effort cleanup, or `cancelled` when a
    /// cancel arrived mid-deploy.
    pub async fn create(&self, request: CreateRequest) -> OrchestratorResult<Deployment> {
        let project = self.require_project(&request.project_id)?;

        if let Some(rule) = &request.scaling {
            rule.validate()
                .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        }

        let mut deployment =
            Deployment::new(&request.project_id, &request.commit_hash, &request.branch);
        if let Some(id) = request.deployment_id {
            if self.state.get_deployment(&id)?.is_some() {
                return Err(OrchestratorError::Configuration(format!(
                    "deployment id {id} already exists"
                )));
            }
            deployment.id = id;
        }
        deployment.env = request.env;
        if let Some(resources) = request.resources {
            deployment.resources = resources;
        }
        deployment.scaling = request.scaling;
        self.state.put_deployment(&deployment)?;
        info!(
            deployment_id = %deployment.id,
            project_id = %deployment.project_id,
            branch = %deployment.branch,
            "deployment created"
        );

        self.run_lifecycle(deployment, project).await
    }

    /// Cancel a pending or in-progress deployment. An in-flight deploy
    /// is signalled and its task performs stop/cleanup; otherwise the
    /// cancel does both itself.
    pub async fn cancel(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        let signalled = {
            let cancels = self.cancels.lock().await;
            match cancels.get(deployment_id) {
                Some(tx) => {
                    let _ = tx.send(true);
                    true
                }
                None => false,
            }
        };

        // Wait for any in-flight lifecycle operation to settle.
        let lock = self.lock_for(deployment_id).await;
        let _guard = lock.lock().await;
        let mut deployment = self.require_deployment(deployment_id)?;

        if signalled {
            // The in-flight operation handled stop/cleanup. If the
            // deploy finished before the signal landed, the cancel was
            // simply too late.
            return if deployment.status == DeploymentStatus::Cancelled {
                Ok(deployment)
            } else {
                Err(OrchestratorError::invalid_state(deployment.status, "cancel"))
            };
        }

        match deployment.status {
            DeploymentStatus::Pending | DeploymentStatus::InProgress => {
                let project = self.require_project(&deployment.project_id)?;
                if let Ok(strategy) = self.factory.create(&deployment, &project).await {
                    if let Err(e) = strategy.stop().await {
                        warn!(%deployment_id, error = %e, "stop during cancel failed");
                    }
                    if let Err(e) = strategy.cleanup().await {
                        warn!(%deployment_id, error = %e, "cleanup during cancel failed");
                    }
                }
                self.transition(&mut deployment, DeploymentStatus::Cancelled, "cancel")?;
                info!(%deployment_id, "deployment cancelled");
                Ok(deployment)
            }
            status => Err(OrchestratorError::invalid_state(status, "cancel")),
        }
    }

    /// Explicitly stop a completed (or unhealthy) deployment. The
    /// workspace is kept: a stopped deployment remains a rollback
    /// source.
    pub async fn stop(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        let lock = self.lock_for(deployment_id).await;
        let _guard = lock.lock().await;

        let mut deployment = self.require_deployment(deployment_id)?;
        if !deployment.status.can_transition(DeploymentStatus::Stopped) {
            return Err(OrchestratorError::invalid_state(deployment.status, "stop"));
        }

        self.monitor.stop(deployment_id).await;

        let project = self.require_project(&deployment.project_id)?;
        let strategy = self.factory.create(&deployment, &project).await?;
        strategy.stop().await?;

        self.transition(&mut deployment, DeploymentStatus::Stopped, "stop")?;
        info!(%deployment_id, "deployment stopped");
        Ok(deployment)
    }

    /// Roll back a completed deployment by replaying the most recent
    /// prior completed deployment of the same project: full config
    /// (resources, env, scaling, revision), not just the commit hash.
    pub async fn rollback(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        let target = self.require_deployment(deployment_id)?;
        if target.status != DeploymentStatus::Completed {
            return Err(OrchestratorError::invalid_state(target.status, "rollback"));
        }

        let prior = self
            .state
            .previous_completed(&target.project_id, &target.id, target.created_at)?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "no previous successful deployment for project {}",
                    target.project_id
                ))
            })?;

        let project = self.require_project(&target.project_id)?;

        let mut replay = Deployment::new(&prior.project_id, &prior.commit_hash, &prior.branch);
        replay.resources = prior.resources;
        replay.env = prior.env.clone();
        replay.scaling = prior.scaling.clone().map(|mut rule| {
            rule.last_action = None;
            rule
        });
        replay.instances = prior.instances;
        replay.rollback_from = Some(prior.id.clone());
        self.state.put_deployment(&replay)?;
        info!(
            deployment_id = %replay.id,
            rollback_from = %prior.id,
            superseding = %target.id,
            "rollback deployment created"
        );

        let result = self.run_lifecycle(replay, project).await?;

        // A successful replay supersedes the rolled-back deployment.
        if result.status == DeploymentStatus::Completed {
            if let Err(e) = self.supersede(&target, &result).await {
                warn!(target_id = %target.id, error = %e, "failed to retire rolled-back deployment");
            }
        }
        Ok(result)
    }

    /// Change the instance count of a completed deployment, rejecting
    /// targets outside the bounds of its scaling rule.
    pub async fn scale(&self, deployment_id: &str, target: u32) -> OrchestratorResult<Deployment> {
        let lock = self.lock_for(deployment_id).await;
        let _guard = lock.lock().await;

        let mut deployment = self.require_deployment(deployment_id)?;
        if deployment.status != DeploymentStatus::Completed {
            return Err(OrchestratorError::invalid_state(deployment.status, "scale"));
        }

        match &deployment.scaling {
            Some(rule) => {
                if target < rule.min_instances || target > rule.max_instances {
                    return Err(OrchestratorError::Configuration(format!(
                        "target {target} outside instance bounds {}..={}",
                        rule.min_instances, rule.max_instances
                    )));
                }
            }
            None if target < 1 => {
                return Err(OrchestratorError::Configuration(
                    "target instance count must be at least 1".to_string(),
                ));
            }
            None => {}
        }

        let project = self.require_project(&deployment.project_id)?;
        let strategy = self.factory.create(&deployment, &project).await?;
        strategy.scale(target).await?;

        let previous = deployment.instances;
        deployment.instances = target;
        self.state.put_deployment(&deployment)?;
        info!(%deployment_id, from = previous, to = target, "deployment scaled");
        Ok(deployment)
    }

    /// Retrieve runtime logs for a deployment.
    pub async fn get_logs(
        &self,
        deployment_id: &str,
        options: &LogOptions,
    ) -> OrchestratorResult<String> {
        let deployment = self.require_deployment(deployment_id)?;
        let project = self.require_project(&deployment.project_id)?;
        let strategy = self.factory.create(&deployment, &project).await?;
        Ok(strategy.get_logs(options).await?)
    }

    /// Mark a completed deployment unhealthy (alert consumer). A
    /// deployment already marked unhealthy is left as-is.
    pub async fn mark_unhealthy(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        let lock = self.lock_for(deployment_id).await;
        let _guard = lock.lock().await;

        let mut deployment = self.require_deployment(deployment_id)?;
        if deployment.status == DeploymentStatus::Unhealthy {
            return Ok(deployment);
        }
        self.transition(&mut deployment, DeploymentStatus::Unhealthy, "mark_unhealthy")?;
        warn!(%deployment_id, "deployment marked unhealthy");
        Ok(deployment)
    }

    /// Move a recovered deployment back to completed. A deployment
    /// already completed is left as-is.
    pub async fn mark_recovered(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        let lock = self.lock_for(deployment_id).await;
        let _guard = lock.lock().await;

        let mut deployment = self.require_deployment(deployment_id)?;
        if deployment.status == DeploymentStatus::Completed {
            return Ok(deployment);
        }
        self.transition(&mut deployment, DeploymentStatus::Completed, "mark_recovered")?;
        info!(%deployment_id, "deployment recovered");
        Ok(deployment)
    }

    // ── Command channel ────────────────────────────────────────────

    /// Execute one command and build the report for its sender.
    pub async fn execute(&self, command: Command) -> CommandReport {
        let result = match command {
            Command::Create {
                deployment_id,
                project_id,
                commit_hash,
                branch,
                env_vars,
                memory,
            } => {
                let resources = match memory.as_deref() {
                    Some(raw) => match berth_core::parse_memory(raw) {
                        Some(memory_bytes) => Some(ResourceLimits {
                            memory_bytes,
                            ..ResourceLimits::default()
                        }),
                        None => {
                            return CommandReport {
                                deployment_id: None,
                                status: None,
                                error: Some(format!("invalid memory limit: {raw}")),
                            };
                        }
                    },
                    None => None,
                };
                self.create(CreateRequest {
                    deployment_id,
                    project_id,
                    commit_hash,
                    branch,
                    env: env_vars,
                    resources,
                    scaling: None,
                })
                .await
            }
            Command::Cancel { deployment_id } => self.cancel(&deployment_id).await,
            Command::Rollback { deployment_id } => self.rollback(&deployment_id).await,
        };

        match result {
            Ok(deployment) => CommandReport {
                deployment_id: Some(deployment.id.clone()),
                status: Some(deployment.status),
                error: deployment.error,
            },
            Err(e) => CommandReport {
                deployment_id: None,
                status: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Consume commands until the channel closes. A failed command
    /// never stops the loop.
    pub async fn serve(&self, mut commands: mpsc::Receiver<CommandEnvelope>) {
        info!("command channel open");
        while let Some(envelope) = commands.recv().await {
            let report = self.execute(envelope.command).await;
            if let Some(reply) = envelope.reply {
                let _ = reply.send(report);
            }
        }
        info!("command channel closed");
    }

    // ── Lifecycle internals ────────────────────────────────────────

    /// Drive a pending deployment to a terminal status under the
    /// per-deployment lock.
    async fn run_lifecycle(
        &self,
        mut deployment: Deployment,
        project: Project,
    ) -> OrchestratorResult<Deployment> {
        let lock = self.lock_for(&deployment.id).await;
        let _guard = lock.lock().await;

        let mut cancel_rx = self.register_cancel(&deployment.id).await;
        let outcome = self.drive(&mut deployment, &project, &mut cancel_rx).await;
        self.clear_cancel(&deployment.id).await;
        outcome
    }

    async fn drive(
        &self,
        deployment: &mut Deployment,
        project: &Project,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> OrchestratorResult<Deployment> {
        self.transition(deployment, DeploymentStatus::InProgress, "create")?;

        let strategy = match self.factory.create(deployment, project).await {
            Ok(strategy) => strategy,
            Err(e) => {
                // No strategy, nothing to clean up at the runtime level.
                return self.finish_failed(deployment, e.to_string()).await;
            }
        };

        let prior = match &deployment.rollback_from {
            Some(source_id) => match self.state.get_deployment(source_id)? {
                Some(prior) => Some(prior),
                None => {
                    return self
                        .finish_failed(
                            deployment,
                            format!("rollback source {source_id} not found"),
                        )
                        .await;
                }
            },
            None => None,
        };

        let op_strategy = strategy.clone();
        let operation = async move {
            op_strategy.validate().await?;
            match &prior {
                Some(prior) => op_strategy.rollback(prior).await,
                None => op_strategy.deploy().await,
            }
        };
        tokio::pin!(operation);

        let outcome = tokio::select! {
            result = &mut operation => match result {
                Ok(()) => DeployOutcome::Success,
                Err(e) => DeployOutcome::Failed(e.into()),
            },
            changed = cancel_rx.wait_for(|cancelled| *cancelled) => match changed {
                Ok(_) => DeployOutcome::Cancelled,
                // The sender never drops while the op is in flight,
                // but a closed channel must not wedge the deploy.
                Err(_) => DeployOutcome::Failed(OrchestratorError::Configuration(
                    "cancellation channel closed".to_string(),
                )),
            },
        };

        match outcome {
            DeployOutcome::Success => {
                deployment.error = None;
                self.transition(deployment, DeploymentStatus::Completed, "create")?;
                self.monitor.start(&deployment.id, strategy).await;
                info!(deployment_id = %deployment.id, "deployment completed");
                Ok(deployment.clone())
            }
            DeployOutcome::Cancelled => {
                if let Err(e) = strategy.stop().await {
                    warn!(deployment_id = %deployment.id, error = %e, "stop after cancel failed");
                }
                if let Err(e) = strategy.cleanup().await {
                    warn!(deployment_id = %deployment.id, error = %e, "cleanup after cancel failed");
                }
                self.transition(deployment, DeploymentStatus::Cancelled, "cancel")?;
                info!(deployment_id = %deployment.id, "deployment cancelled mid-deploy");
                Ok(deployment.clone())
            }
            DeployOutcome::Failed(e) => {
                // The strategy already attempted its own cleanup on
                // deploy failures; repeating it covers validate-stage
                // failures and is idempotent.
                if let Err(cleanup_err) = strategy.cleanup().await {
                    warn!(
                        deployment_id = %deployment.id,
                        error = %cleanup_err,
                        "cleanup after failed deploy also failed"
                    );
                }
                self.finish_failed(deployment, e.to_string()).await
            }
        }
    }

    async fn finish_failed(
        &self,
        deployment: &mut Deployment,
        cause: String,
    ) -> OrchestratorResult<Deployment> {
        error!(deployment_id = %deployment.id, error = %cause, "deployment failed");
        deployment.error = Some(cause);
        self.transition(deployment, DeploymentStatus::Failed, "create")?;
        Ok(deployment.clone())
    }

    /// Retire a deployment superseded by a successful rollback. Its
    /// runtime was replaced under the shared name when the branches
    /// match; otherwise it is stopped explicitly.
    async fn supersede(&self, target: &Deployment, replay: &Deployment) -> OrchestratorResult<()> {
        let lock = self.lock_for(&target.id).await;
        let _guard = lock.lock().await;

        let mut target = self.require_deployment(&target.id)?;
        if !target.status.can_transition(DeploymentStatus::Stopped) {
            return Ok(());
        }

        self.monitor.stop(&target.id).await;
        if target.branch != replay.branch {
            let project = self.require_project(&target.project_id)?;
            if let Ok(strategy) = self.factory.create(&target, &project).await {
                if let Err(e) = strategy.stop().await {
                    warn!(target_id = %target.id, error = %e, "stop of superseded deployment failed");
                }
            }
        }
        self.transition(&mut target, DeploymentStatus::Stopped, "rollback")?;
        Ok(())
    }

    /// Apply a status transition, stamp timestamps, and persist.
    fn transition(
        &self,
        deployment: &mut Deployment,
        to: DeploymentStatus,
        operation: &str,
    ) -> OrchestratorResult<()> {
        if !deployment.status.can_transition(to) {
            return Err(OrchestratorError::invalid_state(deployment.status, operation));
        }
        deployment.status = to;
        let now = epoch_secs();
        match to {
            DeploymentStatus::InProgress => deployment.started_at = Some(now),
            DeploymentStatus::Completed
            | DeploymentStatus::Failed
            | DeploymentStatus::Cancelled => {
                if deployment.completed_at.is_none() {
                    deployment.completed_at = Some(now);
                }
            }
            _ => {}
        }
        self.state.put_deployment(deployment)?;
        Ok(())
    }

    // ── Arenas ─────────────────────────────────────────────────────

    async fn lock_for(&self, deployment_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(deployment_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn register_cancel(&self, deployment_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.cancels
            .lock()
            .await
            .insert(deployment_id.to_string(), tx);
        rx
    }

    async fn clear_cancel(&self, deployment_id: &str) {
        self.cancels.lock().await.remove(deployment_id);
    }

    fn require_deployment(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        self.state
            .get_deployment(deployment_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("deployment {deployment_id}")))
    }

    fn require_project(&self, project_id: &str) -> OrchestratorResult<Project> {
        self.state
            .get_project(project_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("project {project_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use berth_core::{HealthState, MetricKind, Operator, ScaleAction};
    use berth_strategy::{HealthReport, StrategyError, StrategyResult};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Scriptable strategy that records its calls.
    struct MockStrategy {
        validate_error: Option<String>,
        deploy_error: Option<String>,
        deploy_delay: Duration,
        stops: AtomicU32,
        cleanups: AtomicU32,
        scales: Mutex<Vec<u32>>,
    }

    impl MockStrategy {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                validate_error: None,
                deploy_error: None,
                deploy_delay: Duration::ZERO,
                stops: AtomicU32::new(0),
                cleanups: AtomicU32::new(0),
                scales: Mutex::new(Vec::new()),
            })
        }

        fn failing_deploy(message: &str) -> Arc<Self> {
            Arc::new(Self {
                deploy_error: Some(message.to_string()),
                ..Self::unwrapped_ok()
            })
        }

        fn failing_validate(message: &str) -> Arc<Self> {
            Arc::new(Self {
                validate_error: Some(message.to_string()),
                ..Self::unwrapped_ok()
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                deploy_delay: delay,
                ..Self::unwrapped_ok()
            })
        }

        fn unwrapped_ok() -> Self {
            Self {
                validate_error: None,
                deploy_error: None,
                deploy_delay: Duration::ZERO,
                stops: AtomicU32::new(0),
                cleanups: AtomicU32::new(0),
                scales: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DeploymentStrategy for MockStrategy {
        async fn validate(&self) -> StrategyResult<()> {
            match &self.validate_error {
                Some(message) => Err(StrategyError::Configuration(message.clone())),
                None => Ok(()),
            }
        }

        async fn deploy(&self) -> StrategyResult<()> {
            if !self.deploy_delay.is_zero() {
                tokio::time::sleep(self.deploy_delay).await;
            }
            match &self.deploy_error {
                Some(message) => {
                    // Strategies clean up after their own failures.
                    self.cleanups.fetch_add(1, Ordering::SeqCst);
                    Err(StrategyError::Runtime(message.clone()))
                }
                None => Ok(()),
            }
        }

        async fn stop(&self) -> StrategyResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _prior: &Deployment) -> StrategyResult<()> {
            self.deploy().await
        }

        async fn get_logs(&self, _options: &LogOptions) -> StrategyResult<String> {
            Ok("log line\n".to_string())
        }

        async fn cleanup(&self) -> StrategyResult<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn perform_health_check(&self) -> StrategyResult<HealthReport> {
            Ok(HealthReport {
                state: HealthState::Healthy,
                running: true,
                details: HashMap::new(),
                sample: None,
            })
        }

        async fn scale(&self, target: u32) -> StrategyResult<()> {
            self.scales.lock().await.push(target);
            Ok(())
        }
    }

    struct MockFactory {
        strategy: Arc<MockStrategy>,
    }

    #[async_trait]
    impl StrategyFactory for MockFactory {
        async fn create(
            &self,
            _deployment: &Deployment,
            _project: &Project,
        ) -> StrategyResult<Arc<dyn DeploymentStrategy>> {
            Ok(self.strategy.clone())
        }
    }

    fn project(id: &str) -> Project {
        Project {
            id: id.to_string(),
            name: format!("proj-{id}"),
            env: HashMap::new(),
            port: None,
            health_probe: None,
            process: None,
            created_at: 1000,
        }
    }

    fn rule(min: u32, max: u32) -> ScalingRule {
        ScalingRule {
            metric: MetricKind::Cpu,
            operator: Operator::Gt,
            threshold: 80.0,
            action: ScaleAction::ScaleUp,
            min_instances: min,
            max_instances: max,
            cooldown_secs: 300,
            last_action: None,
        }
    }

    fn harness(strategy: Arc<MockStrategy>) -> (Arc<Orchestrator>, StateStore, Arc<Monitor>) {
        let store = StateStore::open_in_memory().unwrap();
        store.put_project(&project("p1")).unwrap();
        let (monitor, _events) = Monitor::new(store.clone(), Duration::from_secs(60));
        let monitor = Arc::new(monitor);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(MockFactory { strategy }),
            monitor.clone(),
        ));
        (orchestrator, store, monitor)
    }

    fn create_request() -> CreateRequest {
        CreateRequest {
            deployment_id: None,
            project_id: "p1".to_string(),
            commit_hash: "abc123".to_string(),
            branch: "main".to_string(),
            env: HashMap::new(),
            resources: None,
            scaling: None,
        }
    }

    /// Insert a completed deployment directly (as if from a previous run).
    fn seed_completed(store: &StateStore, id: &str, created_at: u64) -> Deployment {
        let mut d = Deployment::new("p1", &format!("commit-{id}"), "main");
        d.id = id.to_string();
        d.created_at = created_at;
        d.status = DeploymentStatus::Completed;
        d.completed_at = Some(created_at + 10);
        d.resources.memory_bytes = 128 * 1024 * 1024;
        d.env.insert("VERSION".to_string(), id.to_string());
        store.put_deployment(&d).unwrap();
        d
    }

    #[tokio::test]
    async fn create_success_reaches_completed_and_starts_monitor() {
        let strategy = MockStrategy::ok();
        let (orchestrator, store, monitor) = harness(strategy);

        let deployment = orchestrator.create(create_request()).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Completed);
        assert!(deployment.started_at.is_some());
        assert!(deployment.completed_at.is_some());
        assert!(deployment.error.is_none());

        let persisted = store.get_deployment(&deployment.id).unwrap().unwrap();
        assert_eq!(persisted.status, DeploymentStatus::Completed);
        assert!(monitor.is_monitoring(&deployment.id).await);
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn create_failure_sets_failed_with_error_and_cleans_up() {
        let strategy = MockStrategy::failing_deploy("build exploded");
        let (orchestrator, store, monitor) = harness(strategy.clone());

        let deployment = orchestrator.create(create_request()).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.error.as_deref().unwrap().contains("build exploded"));
        assert!(strategy.cleanups.load(Ordering::SeqCst) >= 1);

        let persisted = store.get_deployment(&deployment.id).unwrap().unwrap();
        assert_eq!(persisted.status, DeploymentStatus::Failed);
        assert!(!monitor.is_monitoring(&deployment.id).await);
    }

    #[tokio::test]
    async fn validate_failure_also_fails_the_deployment() {
        let strategy = MockStrategy::failing_validate("no artifacts");
        let (orchestrator, _store, _monitor) = harness(strategy);

        let deployment = orchestrator.create(create_request()).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.error.as_deref().unwrap().contains("no artifacts"));
    }

    #[tokio::test]
    async fn create_rejects_unknown_project() {
        let (orchestrator, _store, _monitor) = harness(MockStrategy::ok());
        let request = CreateRequest {
            project_id: "nope".to_string(),
            ..create_request()
        };
        assert!(matches!(
            orchestrator.create(request).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_invalid_scaling_rule() {
        let (orchestrator, _store, _monitor) = harness(MockStrategy::ok());
        let request = CreateRequest {
            scaling: Some(ScalingRule {
                min_instances: 0,
                ..rule(1, 5)
            }),
            ..create_request()
        };
        assert!(matches!(
            orchestrator.create(request).await,
            Err(OrchestratorError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_deployment_id() {
        let (orchestrator, store, monitor) = harness(MockStrategy::ok());
        seed_completed(&store, "taken", 1000);
        let request = CreateRequest {
            deployment_id: Some("taken".to_string()),
            ..create_request()
        };
        assert!(matches!(
            orchestrator.create(request).await,
            Err(OrchestratorError::Configuration(_))
        ));
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn cancel_reaches_in_flight_deploy() {
        let strategy = MockStrategy::slow(Duration::from_secs(5));
        let (orchestrator, store, _monitor) = harness(strategy.clone());

        let request = CreateRequest {
            deployment_id: Some("d-slow".to_string()),
            ..create_request()
        };
        let create_task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.create(request).await })
        };

        // Let the deploy get in flight, then cancel.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled = orchestrator.cancel("d-slow").await.unwrap();
        assert_eq!(cancelled.status, DeploymentStatus::Cancelled);

        let created = create_task.await.unwrap().unwrap();
        assert_eq!(created.status, DeploymentStatus::Cancelled);

        // Cancellation performed stop + cleanup exactly once.
        assert_eq!(strategy.stops.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.cleanups.load(Ordering::SeqCst), 1);

        let persisted = store.get_deployment("d-slow").unwrap().unwrap();
        assert_eq!(persisted.status, DeploymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_of_completed_is_invalid_state() {
        let (orchestrator, store, _monitor) = harness(MockStrategy::ok());
        seed_completed(&store, "d1", 1000);
        assert!(matches!(
            orchestrator.cancel("d1").await,
            Err(OrchestratorError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_of_unknown_deployment_is_not_found() {
        let (orchestrator, _store, _monitor) = harness(MockStrategy::ok());
        assert!(matches!(
            orchestrator.cancel("ghost").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_of_stale_pending_record_stops_and_cleans() {
        let strategy = MockStrategy::ok();
        let (orchestrator, store, _monitor) = harness(strategy.clone());

        // A pending record with no in-flight operation (e.g. left over
        // from a crash).
        let mut d = Deployment::new("p1", "abc", "main");
        d.id = "stale".to_string();
        store.put_deployment(&d).unwrap();

        let cancelled = orchestrator.cancel("stale").await.unwrap();
        assert_eq!(cancelled.status, DeploymentStatus::Cancelled);
        assert_eq!(strategy.stops.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_retires_completed_deployment() {
        let strategy = MockStrategy::ok();
        let (orchestrator, store, monitor) = harness(strategy.clone());

        let deployment = orchestrator.create(create_request()).await.unwrap();
        assert!(monitor.is_monitoring(&deployment.id).await);

        let stopped = orchestrator.stop(&deployment.id).await.unwrap();
        assert_eq!(stopped.status, DeploymentStatus::Stopped);
        assert!(!monitor.is_monitoring(&deployment.id).await);
        assert_eq!(strategy.stops.load(Ordering::SeqCst), 1);

        // A stopped deployment is terminal.
        assert!(matches!(
            orchestrator.stop(&deployment.id).await,
            Err(OrchestratorError::InvalidState { .. })
        ));
        let persisted = store.get_deployment(&deployment.id).unwrap().unwrap();
        assert_eq!(persisted.status, DeploymentStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_of_pending_is_invalid_state() {
        let (orchestrator, store, _monitor) = harness(MockStrategy::ok());
        let mut d = Deployment::new("p1", "abc", "main");
        d.id = "pend".to_string();
        store.put_deployment(&d).unwrap();
        assert!(matches!(
            orchestrator.stop("pend").await,
            Err(OrchestratorError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn rollback_replays_previous_completed_config() {
        let (orchestrator, store, monitor) = harness(MockStrategy::ok());
        let d1 = seed_completed(&store, "d1", 1000);
        let _d2 = seed_completed(&store, "d2", 2000);

        let d3 = orchestrator.rollback("d2").await.unwrap();
        assert_eq!(d3.rollback_from.as_deref(), Some("d1"));
        assert_eq!(d3.status, DeploymentStatus::Completed);
        // Full config replay: resources, env, and revision of D1.
        assert_eq!(d3.resources, d1.resources);
        assert_eq!(d3.env, d1.env);
        assert_eq!(d3.commit_hash, d1.commit_hash);

        // The rolled-back deployment is retired.
        let d2 = store.get_deployment("d2").unwrap().unwrap();
        assert_eq!(d2.status, DeploymentStatus::Stopped);
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn rollback_without_prior_completed_is_not_found() {
        let (orchestrator, store, _monitor) = harness(MockStrategy::ok());
        seed_completed(&store, "only", 1000);
        assert!(matches!(
            orchestrator.rollback("only").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rollback_of_pending_is_invalid_state() {
        let (orchestrator, store, _monitor) = harness(MockStrategy::ok());
        let mut d = Deployment::new("p1", "abc", "main");
        d.id = "pend".to_string();
        store.put_deployment(&d).unwrap();
        assert!(matches!(
            orchestrator.rollback("pend").await,
            Err(OrchestratorError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn scale_respects_rule_bounds() {
        let strategy = MockStrategy::ok();
        let (orchestrator, store, _monitor) = harness(strategy.clone());
        let mut d = seed_completed(&store, "d1", 1000);
        d.scaling = Some(rule(1, 5));
        d.instances = 3;
        store.put_deployment(&d).unwrap();

        let scaled = orchestrator.scale("d1", 4).await.unwrap();
        assert_eq!(scaled.instances, 4);
        assert_eq!(strategy.scales.lock().await.as_slice(), &[4]);

        assert!(matches!(
            orchestrator.scale("d1", 6).await,
            Err(OrchestratorError::Configuration(_))
        ));
        assert!(matches!(
            orchestrator.scale("d1", 0).await,
            Err(OrchestratorError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn scale_requires_completed_status() {
        let (orchestrator, store, _monitor) = harness(MockStrategy::ok());
        let mut d = seed_completed(&store, "d1", 1000);
        d.status = DeploymentStatus::Failed;
        store.put_deployment(&d).unwrap();
        assert!(matches!(
            orchestrator.scale("d1", 2).await,
            Err(OrchestratorError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_states_reject_every_operation() {
        let (orchestrator, store, _monitor) = harness(MockStrategy::ok());
        let mut d = seed_completed(&store, "dead", 1000);
        d.status = DeploymentStatus::Failed;
        store.put_deployment(&d).unwrap();

        assert!(matches!(
            orchestrator.cancel("dead").await,
            Err(OrchestratorError::InvalidState { .. })
        ));
        assert!(matches!(
            orchestrator.stop("dead").await,
            Err(OrchestratorError::InvalidState { .. })
        ));
        assert!(matches!(
            orchestrator.rollback("dead").await,
            Err(OrchestratorError::InvalidState { .. })
        ));
        assert!(matches!(
            orchestrator.scale("dead", 2).await,
            Err(OrchestratorError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn unhealthy_marking_and_recovery() {
        let (orchestrator, store, _monitor) = harness(MockStrategy::ok());
        seed_completed(&store, "d1", 1000);

        let unhealthy = orchestrator.mark_unhealthy("d1").await.unwrap();
        assert_eq!(unhealthy.status, DeploymentStatus::Unhealthy);
        // Idempotent.
        let again = orchestrator.mark_unhealthy("d1").await.unwrap();
        assert_eq!(again.status, DeploymentStatus::Unhealthy);

        let recovered = orchestrator.mark_recovered("d1").await.unwrap();
        assert_eq!(recovered.status, DeploymentStatus::Completed);

        // Marking a failed deployment unhealthy is invalid.
        let mut d = seed_completed(&store, "d2", 1000);
        d.status = DeploymentStatus::Failed;
        store.put_deployment(&d).unwrap();
        assert!(matches!(
            orchestrator.mark_unhealthy("d2").await,
            Err(OrchestratorError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn get_logs_delegates_to_strategy() {
        let (orchestrator, store, _monitor) = harness(MockStrategy::ok());
        seed_completed(&store, "d1", 1000);
        let logs = orchestrator
            .get_logs("d1", &LogOptions::default())
            .await
            .unwrap();
        assert_eq!(logs, "log line\n");
    }

    #[tokio::test]
    async fn command_channel_round_trip() {
        let (orchestrator, store, monitor) = harness(MockStrategy::ok());
        let (tx, rx) = mpsc::channel(4);
        let serve_task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.serve(rx).await })
        };

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        tx.send(CommandEnvelope {
            command: Command::Create {
                deployment_id: None,
                project_id: "p1".to_string(),
                commit_hash: "abc123".to_string(),
                branch: "main".to_string(),
                env_vars: HashMap::new(),
                memory: Some("512M".to_string()),
            },
            reply: Some(reply_tx),
        })
        .await
        .unwrap();

        let report = reply_rx.await.unwrap();
        assert_eq!(report.status, Some(DeploymentStatus::Completed));
        assert!(report.error.is_none());

        let created = store
            .get_deployment(report.deployment_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(created.resources.memory_bytes, 512 * 1024 * 1024);

        // A failing command reports the error and keeps the loop alive.
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        tx.send(CommandEnvelope {
            command: Command::Cancel {
                deployment_id: "ghost".to_string(),
            },
            reply: Some(reply_tx),
        })
        .await
        .unwrap();
        let report = reply_rx.await.unwrap();
        assert!(report.error.as_deref().unwrap().contains("not found"));

        drop(tx);
        serve_task.await.unwrap();
        monitor.stop_all().await;
    }
}

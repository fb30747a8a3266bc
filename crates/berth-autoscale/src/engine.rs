//! The auto-scaling engine.
//!
//! Holds the rule arena keyed by deployment or project, resolves
//! metric kinds to current values, and applies at most one ±1 step per
//! evaluation tick through a scale callback.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use berth_core::{
    epoch_secs, Deployment, DeploymentStatus, MetricKind, RuleError, ScalingRule,
};
use berth_state::{StateError, StateStore};

type BoxFuture = Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

/// Callback performing a scaling action: (deployment_id, target).
pub type ScaleFn = Arc<dyn Fn(String, u32) -> BoxFuture + Send + Sync>;

/// What a scaling rule is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleScope {
    Deployment(String),
    Project(String),
}

impl RuleScope {
    /// Persistence key for the rules table.
    pub fn table_key(&self) -> String {
        match self {
            Self::Deployment(id) => format!("deployment:{id}"),
            Self::Project(id) => format!("project:{id}"),
        }
    }

    /// Parse a persistence key back into a scope.
    pub fn from_table_key(key: &str) -> Option<Self> {
        key.split_once(':').and_then(|(kind, id)| match kind {
            "deployment" => Some(Self::Deployment(id.to_string())),
            "project" => Some(Self::Project(id.to_string())),
            _ => None,
        })
    }
}

/// Outcome of evaluating one deployment's rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale from `previous` to `target`, because of `reason`.
    Step {
        previous: u32,
        target: u32,
        reason: String,
    },
    /// No rule produced a change.
    NoChange,
    /// Evaluation was skipped (stale metrics, cooldown, missing data).
    Skipped { reason: String },
}

/// Event emitted after a scaling action was performed.
#[derive(Debug, Clone)]
pub struct ScaleEvent {
    pub deployment_id: String,
    pub previous: u32,
    pub new: u32,
    pub reason: String,
    pub timestamp: u64,
}

/// Engine errors surfaced to callers of the admin API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid scaling rule: {0}")]
    InvalidRule(#[from] RuleError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// The auto-scaling engine.
pub struct Engine {
    state: StateStore,
    /// Rule arena: scope → ordered rules.
    rules: RwLock<HashMap<RuleScope, Vec<ScalingRule>>>,
    /// Last scaling action per scope (cooldown tracking).
    cooldowns: RwLock<HashMap<RuleScope, u64>>,
    /// Externally supplied signals: deployment_id → name → value.
    externals: RwLock<HashMap<String, HashMap<String, f64>>>,
    scale_fn: ScaleFn,
    events: mpsc::Sender<ScaleEvent>,
    /// The monitor's polling interval, for staleness checks.
    poll_interval: Duration,
}

impl Engine {
    /// Create an engine and the receiving end of its event channel.
    pub fn new(
        state: StateStore,
        poll_interval: Duration,
        scale_fn: ScaleFn,
    ) -> (Self, mpsc::Receiver<ScaleEvent>) {
        let (events, rx) = mpsc::channel(64);
        (
            Self {
                state,
                rules: RwLock::new(HashMap::new()),
                cooldowns: RwLock::new(HashMap::new()),
                externals: RwLock::new(HashMap::new()),
                scale_fn,
                events,
                poll_interval,
            },
            rx,
        )
    }

    // ── Rule administration ────────────────────────────────────────

    /// Install (replacing) the ordered rule set for a scope. Rules are
    /// validated and persisted.
    pub async fn set_rules(
        &self,
        scope: RuleScope,
        rules: Vec<ScalingRule>,
    ) -> Result<(), EngineError> {
        for rule in &rules {
            rule.validate()?;
        }
        self.state.put_rules(&scope.table_key(), &rules)?;
        info!(scope = %scope.table_key(), count = rules.len(), "scaling rules installed");
        self.rules.write().await.insert(scope, rules);
        Ok(())
    }

    /// The rule set for a scope, if any.
    pub async fn get_rules(&self, scope: &RuleScope) -> Option<Vec<ScalingRule>> {
        self.rules.read().await.get(scope).cloned()
    }

    /// Remove the rule set for a scope.
    pub async fn remove_rules(&self, scope: &RuleScope) -> Result<bool, EngineError> {
        let existed = self.state.delete_rules(&scope.table_key())?;
        self.rules.write().await.remove(scope);
        self.cooldowns.write().await.remove(scope);
        Ok(existed)
    }

    /// Reload persisted rule sets into the arena (daemon startup).
    pub async fn load_persisted(&self) -> Result<usize, EngineError> {
        let stored = self.state.list_rules()?;
        let mut rules = self.rules.write().await;
        let mut loaded = 0;
        for (key, rule_set) in stored {
            if let Some(scope) = RuleScope::from_table_key(&key) {
                rules.insert(scope, rule_set);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Inject an externally computed activity signal for a deployment.
    /// The engine treats the value as an opaque number.
    pub async fn set_external_metric(&self, deployment_id: &str, name: &str, value: f64) {
        let mut externals = self.externals.write().await;
        externals
            .entry(deployment_id.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    // ── Evaluation ─────────────────────────────────────────────────

    /// Rules applying to a deployment: deployment-scoped first, else
    /// project-scoped.
    async fn rules_for(&self, deployment: &Deployment) -> Option<(RuleScope, Vec<ScalingRule>)> {
        let rules = self.rules.read().await;
        let deployment_scope = RuleScope::Deployment(deployment.id.clone());
        if let Some(set) = rules.get(&deployment_scope) {
            return Some((deployment_scope, set.clone()));
        }
        let project_scope = RuleScope::Project(deployment.project_id.clone());
        rules
            .get(&project_scope)
            .map(|set| (project_scope, set.clone()))
    }

    /// Resolve a rule's metric kind to a current value for the
    /// deployment. `None` when the value is unavailable.
    async fn resolve_metric(&self, deployment: &Deployment, kind: &MetricKind) -> Option<f64> {
        if let MetricKind::External(name) = kind {
            let externals = self.externals.read().await;
            return externals.get(&deployment.id)?.get(name).copied();
        }

        let sample = deployment.last_sample.as_ref()?;
        Some(match kind {
            MetricKind::Cpu => sample.cpu_percent,
            MetricKind::Memory => sample.memory_percent(),
            MetricKind::Network => (sample.net_rx_bytes + sample.net_tx_bytes) as f64,
            MetricKind::Disk => (sample.disk_read_bytes + sample.disk_write_bytes) as f64,
            MetricKind::External(_) => return None,
        })
    }

    /// Evaluate one deployment's rules without applying the decision.
    pub async fn evaluate(&self, deployment: &Deployment) -> ScaleDecision {
        let now = epoch_secs();
        let Some((scope, rules)) = self.rules_for(deployment).await else {
            return ScaleDecision::Skipped {
                reason: "no scaling rules".to_string(),
            };
        };

        // System metrics must be fresh: older than twice the polling
        // interval means the monitor has stopped reporting.
        let system_rules = rules
            .iter()
            .any(|r| !matches!(r.metric, MetricKind::External(_)));
        if system_rules {
            let stale_after = self.poll_interval.as_secs().max(1) * 2;
            match &deployment.last_sample {
                None => {
                    return ScaleDecision::Skipped {
                        reason: "no metrics yet".to_string(),
                    };
                }
                Some(sample) if now.saturating_sub(sample.timestamp) > stale_after => {
                    return ScaleDecision::Skipped {
                        reason: "metrics are stale".to_string(),
                    };
                }
                Some(_) => {}
            }
        }

        // Cooldown applies to the whole scope, not just one rule.
        if let Some(last) = self.cooldowns.read().await.get(&scope) {
            let cooldown = rules
                .iter()
                .map(|r| r.cooldown_secs)
                .min()
                .unwrap_or(berth_core::DEFAULT_COOLDOWN_SECS);
            if now.saturating_sub(*last) < cooldown {
                return ScaleDecision::Skipped {
                    reason: "within cooldown".to_string(),
                };
            }
        }

        // First configured rule that yields a non-no-op change wins.
        for rule in &rules {
            let Some(value) = self.resolve_metric(deployment, &rule.metric).await else {
                continue;
            };
            if !rule.operator.compare(value, rule.threshold) {
                continue;
            }
            let target = rule.step(deployment.instances);
            if target == deployment.instances {
                debug!(
                    deployment_id = %deployment.id,
                    metric = ?rule.metric,
                    value,
                    "rule fired but instance count already at bound"
                );
                continue;
            }
            return ScaleDecision::Step {
                previous: deployment.instances,
                target,
                reason: format!(
                    "{:?} {} {} (current {value:.1})",
                    rule.metric,
                    operator_symbol(rule.operator),
                    rule.threshold
                ),
            };
        }

        ScaleDecision::NoChange
    }

    /// Evaluate a deployment and apply the decision: call the scale
    /// callback, stamp the cooldown, and emit a `Scaled` event.
    pub async fn evaluate_now(&self, deployment_id: &str) -> Result<ScaleDecision, EngineError> {
        let deployment = self.state.require_deployment(deployment_id)?;
        let decision = self.evaluate(&deployment).await;

        if let ScaleDecision::Step {
            previous,
            target,
            reason,
        } = &decision
        {
            if let Err(e) = (self.scale_fn)(deployment.id.clone(), *target).await {
                warn!(
                    deployment_id = %deployment.id,
                    target,
                    error = %e,
                    "scaling action failed"
                );
                return Ok(decision);
            }

            let now = epoch_secs();
            if let Some((scope, mut rules)) = self.rules_for(&deployment).await {
                self.cooldowns.write().await.insert(scope.clone(), now);
                // Stamp last_action on the persisted rule set.
                for rule in &mut rules {
                    rule.last_action = Some(now);
                }
                if let Err(e) = self.state.put_rules(&scope.table_key(), &rules) {
                    warn!(error = %e, "failed to persist rule timestamps");
                }
                self.rules.write().await.insert(scope, rules);
            }

            info!(
                deployment_id = %deployment.id,
                from = previous,
                to = target,
                %reason,
                "deployment scaled"
            );
            let _ = self
                .events
                .send(ScaleEvent {
                    deployment_id: deployment.id.clone(),
                    previous: *previous,
                    new: *target,
                    reason: reason.clone(),
                    timestamp: now,
                })
                .await;
        }

        Ok(decision)
    }

    /// Evaluate every active deployment. One deployment's failure
    /// never blocks the rest of the tick.
    pub async fn evaluate_all(&self) -> Vec<(String, ScaleDecision)> {
        let deployments = match self.state.list_deployments() {
            Ok(deployments) => deployments,
            Err(e) => {
                warn!(error = %e, "failed to list deployments for scaling tick");
                return Vec::new();
            }
        };

        let mut decisions = Vec::new();
        for deployment in deployments {
            if deployment.status != DeploymentStatus::Completed {
                continue;
            }
            match self.evaluate_now(&deployment.id).await {
                Ok(decision) => decisions.push((deployment.id, decision)),
                Err(e) => {
                    warn!(deployment_id = %deployment.id, error = %e, "scaling evaluation failed");
                }
            }
        }
        decisions
    }

    /// Run the evaluation loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "auto-scaling engine started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.evaluate_all().await;
                }
                _ = shutdown.changed() => {
                    info!("auto-scaling engine shutting down");
                    break;
                }
            }
        }
    }
}

fn operator_symbol(op: berth_core::Operator) -> &'static str {
    use berth_core::Operator::*;
    match op {
        Gt => ">",
        Lt => "<",
        Ge => ">=",
        Le => "<=",
        Eq => "==",
    }
}

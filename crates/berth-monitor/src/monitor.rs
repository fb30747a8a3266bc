//! Monitor — background health/metrics loops per deployment.
//!
//! The `Monitor` spawns one task per monitored deployment that
//! periodically calls the strategy's health check, maintains the
//! bounded metric ring, persists the latest observation, and emits
//! alert events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use berth_core::{
    epoch_secs, DeploymentStatus, HealthSnapshot, HealthState, MetricRing, MetricSample,
};
use berth_state::{StateError, StateStore};
use berth_strategy::{DeploymentStrategy, HealthReport};

use crate::metrics::DeploymentMetrics;

/// Default polling interval between health checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Events raised by monitor loops.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// The deployment is unhealthy or its runtime is not running.
    HealthAlert {
        deployment_id: String,
        state: HealthState,
        /// Whether the underlying runtime still exists at all.
        running: bool,
        details: HashMap<String, serde_json::Value>,
        timestamp: u64,
    },
    /// The deployment recovered from unhealthy to healthy.
    Recovered {
        deployment_id: String,
        timestamp: u64,
    },
}

/// Result type alias for monitor queries.
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Errors from monitor queries.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("deployment is not monitored: {0}")]
    NotMonitored(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Runtime status summary for one deployment.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: DeploymentStatus,
    pub health: HealthSnapshot,
    pub uptime_secs: u64,
    pub restarts: u32,
    pub current_stats: Option<MetricSample>,
}

/// Per-deployment monitor state.
struct MonitorSlot {
    /// Handle to the background check task.
    handle: JoinHandle<()>,
    /// Shutdown signal for this loop.
    shutdown_tx: watch::Sender<bool>,
}

/// Manages health/metrics loops for all active deployments.
pub struct Monitor {
    state: StateStore,
    /// Active loops: deployment_id → slot.
    slots: RwLock<HashMap<String, MonitorSlot>>,
    /// In-memory metric history: deployment_id → ring.
    rings: Arc<RwLock<HashMap<String, MetricRing>>>,
    events: mpsc::Sender<MonitorEvent>,
    interval: Duration,
    ring_capacity: usize,
}

impl Monitor {
    /// Create a monitor and the receiving end of its event channel.
    pub fn new(state: StateStore, interval: Duration) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (events, rx) = mpsc::channel(64);
        (
            Self {
                state,
                slots: RwLock::new(HashMap::new()),
                rings: Arc::new(RwLock::new(HashMap::new())),
                events,
                interval,
                ring_capacity: berth_core::DEFAULT_RING_CAPACITY,
            },
            rx,
        )
    }

    /// Override the ring capacity (for tests).
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    /// The polling interval loops run at.
    pub fn poll_interval(&self) -> Duration {
        self.interval
    }

    /// Start monitoring a deployment. Restarting an already-monitored
    /// id replaces the previous loop.
    pub async fn start(&self, deployment_id: &str, strategy: Arc<dyn DeploymentStrategy>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        {
            let mut rings = self.rings.write().await;
            rings
                .entry(deployment_id.to_string())
                .or_insert_with(|| MetricRing::new(self.ring_capacity));
        }

        let id = deployment_id.to_string();
        let state = self.state.clone();
        let rings = self.rings.clone();
        let events = self.events.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            run_monitor_loop(&id, strategy, state, rings, events, interval, shutdown_rx).await;
        });

        let mut slots = self.slots.write().await;
        if let Some(old) = slots.insert(
            deployment_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            // Stop the old loop if one was running.
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%deployment_id, "monitor started");
    }

    /// Stop monitoring a deployment. The metric ring is dropped too.
    pub async fn stop(&self, deployment_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.remove(deployment_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%deployment_id, "monitor stopped");
        }
        drop(slots);
        self.rings.write().await.remove(deployment_id);
    }

    /// Stop all loops (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        for (id, slot) in slots.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(deployment_id = %id, "monitor stopped");
        }
        info!("all monitors stopped");
    }

    /// Deployment ids with active loops.
    pub async fn active(&self) -> Vec<String> {
        let slots = self.slots.read().await;
        slots.keys().cloned().collect()
    }

    /// Whether a deployment has an active loop.
    pub async fn is_monitoring(&self, deployment_id: &str) -> bool {
        let slots = self.slots.read().await;
        slots.contains_key(deployment_id)
    }

    /// Metric series for a monitored deployment.
    pub async fn get_metrics(&self, deployment_id: &str) -> MonitorResult<DeploymentMetrics> {
        let rings = self.rings.read().await;
        let ring = rings
            .get(deployment_id)
            .ok_or_else(|| MonitorError::NotMonitored(deployment_id.to_string()))?;
        Ok(DeploymentMetrics::from_ring(ring))
    }

    /// Status summary for a deployment, assembled from the persisted
    /// record and its latest health details.
    pub async fn get_status(&self, deployment_id: &str) -> MonitorResult<StatusReport> {
        let deployment = self
            .state
            .get_deployment(deployment_id)?
            .ok_or_else(|| MonitorError::NotFound(format!("deployment {deployment_id}")))?;

        let detail_u64 = |key: &str| {
            deployment
                .health
                .details
                .get(key)
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };

        Ok(StatusReport {
            status: deployment.status,
            uptime_secs: detail_u64("uptime_secs"),
            restarts: detail_u64("restarts") as u32,
            current_stats: deployment.last_sample,
            health: deployment.health,
        })
    }
}

/// The health/metrics loop for a single deployment.
#[allow(clippy::too_many_arguments)]
async fn run_monitor_loop(
    deployment_id: &str,
    strategy: Arc<dyn DeploymentStrategy>,
    state: StateStore,
    rings: Arc<RwLock<HashMap<String, MetricRing>>>,
    events: mpsc::Sender<MonitorEvent>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%deployment_id, "monitor loop starting");
    let mut previous_state = HealthState::Unknown;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                // A hung runtime call must not block the loop forever:
                // past a generous ceiling it counts as a failed check.
                let report = match tokio::time::timeout(
                    interval * 3,
                    strategy.perform_health_check(),
                )
                .await
                {
                    Ok(Ok(report)) => report,
                    Ok(Err(e)) => {
                        warn!(%deployment_id, error = %e, "health check failed");
                        HealthReport::unreachable(e.to_string())
                    }
                    Err(_) => {
                        warn!(%deployment_id, "health check timed out");
                        HealthReport::unreachable("health check timed out")
                    }
                };

                let now = epoch_secs();

                if let Some(sample) = report.sample {
                    let mut rings = rings.write().await;
                    if let Some(ring) = rings.get_mut(deployment_id) {
                        ring.push(sample);
                    }
                }

                if let Err(e) = persist_observation(&state, deployment_id, &report, now) {
                    error!(%deployment_id, error = %e, "failed to persist health observation");
                }

                if report.state == HealthState::Unhealthy || !report.running {
                    let _ = events
                        .send(MonitorEvent::HealthAlert {
                            deployment_id: deployment_id.to_string(),
                            state: report.state,
                            running: report.running,
                            details: report.details.clone(),
                            timestamp: now,
                        })
                        .await;
                } else if previous_state == HealthState::Unhealthy
                    && report.state == HealthState::Healthy
                {
                    let _ = events
                        .send(MonitorEvent::Recovered {
                            deployment_id: deployment_id.to_string(),
                            timestamp: now,
                        })
                        .await;
                }
                previous_state = report.state;
            }
            _ = shutdown.changed() => {
                debug!(%deployment_id, "monitor loop shutting down");
                break;
            }
        }
    }
}

/// Flush the latest health snapshot and sample onto the deployment
/// record. The monitor only writes health/metrics fields; lifecycle
/// fields belong to the orchestrator.
fn persist_observation(
    state: &StateStore,
    deployment_id: &str,
    report: &HealthReport,
    now: u64,
) -> Result<(), StateError> {
    let Some(mut deployment) = state.get_deployment(deployment_id)? else {
        return Ok(());
    };
    deployment.health = HealthSnapshot {
        state: report.state,
        last_check: Some(now),
        details: report.details.clone(),
    };
    if let Some(sample) = report.sample {
        deployment.last_sample = Some(sample);
    }
    state.put_deployment(&deployment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use berth_core::Deployment;
    use berth_strategy::{LogOptions, StrategyResult};
    use std::sync::Mutex;

    /// Strategy returning a scripted sequence of health reports.
    struct ScriptedStrategy {
        reports: Mutex<Vec<HealthReport>>,
    }

    impl ScriptedStrategy {
        fn new(reports: Vec<HealthReport>) -> Self {
            Self {
                reports: Mutex::new(reports),
            }
        }

        fn healthy(memory: u64) -> HealthReport {
            HealthReport {
                state: HealthState::Healthy,
                running: true,
                details: HashMap::new(),
                sample: Some(MetricSample {
                    timestamp: epoch_secs(),
                    cpu_percent: 10.0,
                    memory_usage_bytes: memory,
                    memory_limit_bytes: 256,
                    net_rx_bytes: 0,
                    net_tx_bytes: 0,
                    disk_read_bytes: 0,
                    disk_write_bytes: 0,
                }),
            }
        }

        fn unhealthy() -> HealthReport {
            HealthReport {
                state: HealthState::Unhealthy,
                running: true,
                details: HashMap::new(),
                sample: None,
            }
        }
    }

    #[async_trait]
    impl DeploymentStrategy for ScriptedStrategy {
        async fn validate(&self) -> StrategyResult<()> {
            Ok(())
        }
        async fn deploy(&self) -> StrategyResult<()> {
            Ok(())
        }
        async fn stop(&self) -> StrategyResult<()> {
            Ok(())
        }
        async fn rollback(&self, _prior: &Deployment) -> StrategyResult<()> {
            Ok(())
        }
        async fn get_logs(&self, _options: &LogOptions) -> StrategyResult<String> {
            Ok(String::new())
        }
        async fn cleanup(&self) -> StrategyResult<()> {
            Ok(())
        }
        async fn perform_health_check(&self) -> StrategyResult<HealthReport> {
            let mut reports = self.reports.lock().unwrap();
            if reports.len() > 1 {
                Ok(reports.remove(0))
            } else {
                Ok(reports[0].clone())
            }
        }
        async fn scale(&self, _target: u32) -> StrategyResult<()> {
            Ok(())
        }
    }

    fn store_with_deployment(id: &str) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        let mut d = Deployment::new("p1", "abc", "main");
        d.id = id.to_string();
        d.status = DeploymentStatus::Completed;
        d.completed_at = Some(1000);
        store.put_deployment(&d).unwrap();
        store
    }

    fn fast_monitor(store: StateStore) -> (Monitor, mpsc::Receiver<MonitorEvent>) {
        let (monitor, rx) = Monitor::new(store, Duration::from_millis(20));
        (monitor, rx)
    }

    #[tokio::test]
    async fn monitor_starts_and_stops() {
        let (monitor, _rx) = fast_monitor(store_with_deployment("d1"));
        assert!(monitor.active().await.is_empty());

        monitor
            .start("d1", Arc::new(ScriptedStrategy::new(vec![
                ScriptedStrategy::healthy(100),
            ])))
            .await;
        assert!(monitor.is_monitoring("d1").await);

        monitor.stop("d1").await;
        assert!(!monitor.is_monitoring("d1").await);
        assert!(monitor.get_metrics("d1").await.is_err());
    }

    #[tokio::test]
    async fn monitor_replaces_existing_loop() {
        let (monitor, _rx) = fast_monitor(store_with_deployment("d1"));
        let strategy = Arc::new(ScriptedStrategy::new(vec![ScriptedStrategy::healthy(1)]));
        monitor.start("d1", strategy.clone()).await;
        monitor.start("d1", strategy).await;
        assert_eq!(monitor.active().await.len(), 1);
        monitor.stop_all().await;
        assert!(monitor.active().await.is_empty());
    }

    #[tokio::test]
    async fn collects_samples_and_persists_health() {
        let store = store_with_deployment("d1");
        let (monitor, _rx) = fast_monitor(store.clone());

        monitor
            .start("d1", Arc::new(ScriptedStrategy::new(vec![
                ScriptedStrategy::healthy(100),
            ])))
            .await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        let metrics = monitor.get_metrics("d1").await.unwrap();
        let cpu = metrics.cpu.expect("samples collected");
        assert!(!cpu.history.is_empty());

        let persisted = store.get_deployment("d1").unwrap().unwrap();
        assert_eq!(persisted.health.state, HealthState::Healthy);
        assert!(persisted.health.last_check.is_some());
        assert_eq!(
            persisted.last_sample.unwrap().memory_usage_bytes,
            100
        );
        // Health observation leaves lifecycle status untouched.
        assert_eq!(persisted.status, DeploymentStatus::Completed);

        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn unhealthy_report_raises_alert_without_status_change() {
        let store = store_with_deployment("d1");
        let (monitor, mut rx) = fast_monitor(store.clone());

        monitor
            .start("d1", Arc::new(ScriptedStrategy::new(vec![
                ScriptedStrategy::unhealthy(),
            ])))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("alert within deadline")
            .expect("channel open");
        match event {
            MonitorEvent::HealthAlert {
                deployment_id,
                state,
                running,
                ..
            } => {
                assert_eq!(deployment_id, "d1");
                assert_eq!(state, HealthState::Unhealthy);
                assert!(running);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let persisted = store.get_deployment("d1").unwrap().unwrap();
        assert_eq!(persisted.status, DeploymentStatus::Completed);
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn failing_health_query_is_recorded_not_fatal() {
        struct FailingStrategy;
        #[async_trait]
        impl DeploymentStrategy for FailingStrategy {
            async fn validate(&self) -> StrategyResult<()> {
                Ok(())
            }
            async fn deploy(&self) -> StrategyResult<()> {
                Ok(())
            }
            async fn stop(&self) -> StrategyResult<()> {
                Ok(())
            }
            async fn rollback(&self, _prior: &Deployment) -> StrategyResult<()> {
                Ok(())
            }
            async fn get_logs(&self, _options: &LogOptions) -> StrategyResult<String> {
                Ok(String::new())
            }
            async fn cleanup(&self) -> StrategyResult<()> {
                Ok(())
            }
            async fn perform_health_check(&self) -> StrategyResult<HealthReport> {
                Err(berth_strategy::StrategyError::Runtime(
                    "daemon unreachable".to_string(),
                ))
            }
            async fn scale(&self, _target: u32) -> StrategyResult<()> {
                Ok(())
            }
        }

        let store = store_with_deployment("d1");
        let (monitor, mut rx) = fast_monitor(store.clone());
        monitor.start("d1", Arc::new(FailingStrategy)).await;

        // The loop keeps running and keeps alerting.
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("alert within deadline")
                .expect("channel open");
            assert!(matches!(event, MonitorEvent::HealthAlert { .. }));
        }
        assert!(monitor.is_monitoring("d1").await);

        let persisted = store.get_deployment("d1").unwrap().unwrap();
        assert_eq!(persisted.health.state, HealthState::Unhealthy);
        let recorded = persisted
            .health
            .details
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap();
        assert!(recorded.contains("daemon unreachable"));
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn recovery_emits_recovered_event() {
        let store = store_with_deployment("d1");
        let (monitor, mut rx) = fast_monitor(store.clone());

        monitor
            .start("d1", Arc::new(ScriptedStrategy::new(vec![
                ScriptedStrategy::unhealthy(),
                ScriptedStrategy::healthy(10),
            ])))
            .await;

        let mut saw_recovery = false;
        for _ in 0..4 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(MonitorEvent::Recovered { deployment_id, .. })) => {
                    assert_eq!(deployment_id, "d1");
                    saw_recovery = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_recovery, "expected a Recovered event");
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn ring_respects_capacity() {
        let store = store_with_deployment("d1");
        let (monitor, _rx) = Monitor::new(store, Duration::from_millis(5));
        let monitor = monitor.with_ring_capacity(3);

        monitor
            .start("d1", Arc::new(ScriptedStrategy::new(vec![
                ScriptedStrategy::healthy(100),
            ])))
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let metrics = monitor.get_metrics("d1").await.unwrap();
        assert!(metrics.cpu.unwrap().history.len() <= 3);
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn get_status_reads_persisted_record() {
        let store = store_with_deployment("d1");
        {
            let mut d = store.get_deployment("d1").unwrap().unwrap();
            d.health.state = HealthState::Healthy;
            d.health.details.insert(
                "uptime_secs".to_string(),
                serde_json::json!(120),
            );
            d.health
                .details
                .insert("restarts".to_string(), serde_json::json!(2));
            store.put_deployment(&d).unwrap();
        }
        let (monitor, _rx) = fast_monitor(store);

        let status = monitor.get_status("d1").await.unwrap();
        assert_eq!(status.status, DeploymentStatus::Completed);
        assert_eq!(status.uptime_secs, 120);
        assert_eq!(status.restarts, 2);

        assert!(matches!(
            monitor.get_status("missing").await,
            Err(MonitorError::NotFound(_))
        ));
    }
}

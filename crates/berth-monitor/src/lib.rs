//! berth-monitor — health checking and metrics collection for Berth.
//!
//! Runs one background polling loop per active deployment. Each tick
//! queries the deployment's strategy for health and resource usage,
//! appends the sample to a bounded in-memory ring, persists the latest
//! observation onto the deployment record, and raises alert events
//! over a channel.
//!
//! # Architecture
//!
//! ```text
//! Monitor
//!   ├── Per-deployment background task
//!   │   ├── strategy.perform_health_check() → HealthReport
//!   │   ├── MetricRing (bounded history, ~1h)
//!   │   └── Persist health + latest sample into StateStore
//!   └── mpsc<MonitorEvent> for health alerts / recoveries
//! ```
//!
//! A health check that errors is recorded as `unhealthy` with the
//! error in the details; it never kills the loop.

pub mod metrics;
pub mod monitor;

pub use metrics::{CpuPoint, DeploymentMetrics, DiskPoint, MemoryPoint, NetworkPoint, Series};
pub use monitor::{Monitor, MonitorError, MonitorEvent, MonitorResult, StatusReport};

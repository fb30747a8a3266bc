//! Metric series projections served to collaborators.
//!
//! The monitor keeps full samples in a ring; queries project them into
//! one series per resource family, each shaped
//! `{current, time_range, history}`.

use serde::Serialize;

use berth_core::MetricRing;

/// One resource family's view over the retained history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Series<T> {
    /// Most recent point.
    pub current: T,
    /// (oldest, newest) timestamps of the retained history.
    pub time_range: (u64, u64),
    /// All retained points, oldest first.
    pub history: Vec<T>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct CpuPoint {
    pub timestamp: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct MemoryPoint {
    pub timestamp: u64,
    pub usage_bytes: u64,
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct NetworkPoint {
    pub timestamp: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct DiskPoint {
    pub timestamp: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// All resource families for one deployment. Families are `None` when
/// no sample has been collected yet.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeploymentMetrics {
    pub cpu: Option<Series<CpuPoint>>,
    pub memory: Option<Series<MemoryPoint>>,
    pub network: Option<Series<NetworkPoint>>,
    pub disk: Option<Series<DiskPoint>>,
}

impl DeploymentMetrics {
    /// Project a sample ring into per-family series.
    pub fn from_ring(ring: &MetricRing) -> Self {
        let Some(time_range) = ring.time_range() else {
            return Self {
                cpu: None,
                memory: None,
                network: None,
                disk: None,
            };
        };

        fn series<T: Copy>(
            ring: &MetricRing,
            time_range: (u64, u64),
            project: impl Fn(&berth_core::MetricSample) -> T,
        ) -> Option<Series<T>> {
            let current = ring.current().map(&project)?;
            Some(Series {
                current,
                time_range,
                history: ring.iter().map(&project).collect(),
            })
        }

        Self {
            cpu: series(ring, time_range, |s| CpuPoint {
                timestamp: s.timestamp,
                percent: s.cpu_percent,
            }),
            memory: series(ring, time_range, |s| MemoryPoint {
                timestamp: s.timestamp,
                usage_bytes: s.memory_usage_bytes,
                limit_bytes: s.memory_limit_bytes,
            }),
            network: series(ring, time_range, |s| NetworkPoint {
                timestamp: s.timestamp,
                rx_bytes: s.net_rx_bytes,
                tx_bytes: s.net_tx_bytes,
            }),
            disk: series(ring, time_range, |s| DiskPoint {
                timestamp: s.timestamp,
                read_bytes: s.disk_read_bytes,
                write_bytes: s.disk_write_bytes,
            }),
        }
    }
}

//! Host resource snapshot
//!
//! Queues one `system` entry per run:
//! - CPU usage, load averages, core count
//! - Memory usage
//! - Disk usage per mounted filesystem
//!
//! Options: `sample_ms` (CPU sampling window, default 200).

use super::{Collector, CollectorContext};
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::time::Duration;
use sysinfo::{Disks, System};
use tracing::debug;

#[derive(Debug, Serialize)]
pub struct SystemSnapshot {
    pub uptime_seconds: u64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disks: Vec<DiskMetrics>,
}

#[derive(Debug, Serialize)]
pub struct CpuMetrics {
    pub percent: f32,
    pub load_avg: [f64; 3], // [1min, 5min, 15min]
    pub core_count: usize,
}

#[derive(Debug, Serialize)]
pub struct MemoryMetrics {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub percent_used: f32,
}

#[derive(Debug, Serialize)]
pub struct DiskMetrics {
    pub path: String,
    pub total_gb: f64,
    pub free_gb: f64,
    pub percent_used: f32,
}

const MB: u64 = 1024 * 1024;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;

impl SystemSnapshot {
    pub async fn collect(sample: Duration) -> Self {
        debug!("Collecting system snapshot...");

        let mut sys = System::new_all();
        sys.refresh_all();

        // CPU usage needs two refreshes separated by a sampling window
        tokio::time::sleep(sample).await;
        sys.refresh_cpu_usage();

        Self {
            uptime_seconds: System::uptime(),
            cpu: CpuMetrics::collect(&sys),
            memory: MemoryMetrics::collect(&sys),
            disks: DiskMetrics::collect(),
        }
    }
}

impl CpuMetrics {
    fn collect(sys: &System) -> Self {
        let load_avg = if cfg!(unix) {
            let load = System::load_average();
            [load.one, load.five, load.fifteen]
        } else {
            [0.0, 0.0, 0.0]
        };

        Self {
            percent: sys.global_cpu_info().cpu_usage(),
            load_avg,
            core_count: sys.cpus().len(),
        }
    }
}

impl MemoryMetrics {
    fn collect(sys: &System) -> Self {
        let total = sys.total_memory();
        let available = sys.available_memory();
        let used = total.saturating_sub(available);

        Self {
            total_mb: total / MB,
            used_mb: used / MB,
            available_mb: available / MB,
            percent_used: percent(used, total),
        }
    }
}

impl DiskMetrics {
    fn collect() -> Vec<Self> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let total = d.total_space();
                let free = d.available_space();
                Self {
                    path: d.mount_point().to_string_lossy().to_string(),
                    total_gb: total as f64 / GB,
                    free_gb: free as f64 / GB,
                    percent_used: percent(total.saturating_sub(free), total),
                }
            })
            .collect()
    }
}

fn percent(part: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 100.0) as f32
}

pub struct SystemCollector;

impl SystemCollector {
    async fn collect(&self, ctx: &CollectorContext) -> Result<()> {
        let sample = Duration::from_millis(
            ctx.options
                .get("sample_ms")
                .and_then(|v| v.as_integer())
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(200),
        );
        let snapshot = SystemSnapshot::collect(sample).await;
        ctx.put("system", serde_json::to_value(&snapshot)?)?;
        Ok(())
    }
}

impl Collector for SystemCollector {
    fn kind(&self) -> &'static str {
        "system"
    }

    fn run<'a>(&'a self, ctx: &'a CollectorContext) -> BoxFuture<'a, Result<()>> {
        self.collect(ctx).boxed()
    }
}

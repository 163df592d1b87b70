//! Liveness unit
//!
//! Queues a `ping` entry every `ping.wait` seconds so the collector can tell a
//! silent agent from a dead one.

use crate::collectors::now_millis;
use crate::queue::QueueStore;
use crate::supervisor::{StopSignal, Unit};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct PingUnit {
    store: Arc<QueueStore>,
    hostname: String,
    wait: Duration,
    started_at: Instant,
}

impl PingUnit {
    pub fn new(store: Arc<QueueStore>, hostname: impl Into<String>, wait: Duration) -> Self {
        Self {
            store,
            hostname: hostname.into(),
            wait,
            started_at: Instant::now(),
        }
    }

    fn ping(&self) -> anyhow::Result<()> {
        let payload = json!({
            "hostname": self.hostname,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.started_at.elapsed().as_secs(),
        });
        let id = self.store.put("ping", &payload, now_millis())?;
        debug!("ping queued ({})", id);
        Ok(())
    }
}

impl Unit for PingUnit {
    fn name(&self) -> &str {
        "ping"
    }

    fn run(self: Arc<Self>, stop: StopSignal) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            loop {
                self.ping()?;
                if !stop.sleep(self.wait).await {
                    return Ok(());
                }
            }
        }
        .boxed()
    }
}

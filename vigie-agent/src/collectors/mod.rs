//! Built-in collectors
//!
//! A collector is one short-lived capture job. It runs inside its own process
//! (`vigie-agent collect <job>`) and talks to the rest of the agent only through
//! the queue store handed over in its [`CollectorContext`].
//!
//! Job names may carry an instance suffix (`neighbors.lan`); the part before
//! the first `.` picks the implementation.

pub mod interfaces;
pub mod neighbors;
pub mod system;

use crate::queue::{HostRecord, HostUpdate, QueueStore, StoreError};
use anyhow::Context;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("unknown collector {kind:?} for job {job:?}")]
    UnknownCollector { job: String, kind: String },
}

/// Collector kind of a job name (`neighbors.lan` → `neighbors`)
pub fn collector_kind(job: &str) -> &str {
    job.split('.').next().unwrap_or(job)
}

/// Milliseconds since the Unix epoch, the timestamp unit of queue entries
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Everything a collector may touch
pub struct CollectorContext {
    pub job: String,
    pub options: toml::Table,
    store: Arc<QueueStore>,
}

impl CollectorContext {
    pub fn new(job: impl Into<String>, options: toml::Table, store: Arc<QueueStore>) -> Self {
        Self {
            job: job.into(),
            options,
            store,
        }
    }

    /// Queues an observation stamped with the capture time
    pub fn put(&self, entry_type: &str, payload: Value) -> Result<i64, StoreError> {
        self.store.put(entry_type, &payload, now_millis())
    }

    pub fn find_host(&self, ip: &str) -> Result<Option<HostRecord>, StoreError> {
        self.store.find_host(ip)
    }

    pub fn put_host(&self, ip: &str, mac: &str) -> Result<bool, StoreError> {
        self.store.put_host(ip, mac)
    }

    pub fn update_host(&self, ip: &str, update: &HostUpdate) -> Result<bool, StoreError> {
        self.store.update_host(ip, update)
    }

    pub fn option_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.options.get(key).and_then(|v| v.as_str()).unwrap_or(default)
    }

    pub fn option_bool(&self, key: &str, default: bool) -> bool {
        self.options.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn option_secs(&self, key: &str, default: u64) -> Duration {
        let secs = self
            .options
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default);
        Duration::from_secs(secs)
    }
}

pub trait Collector: Send + Sync {
    fn kind(&self) -> &'static str;
    fn run<'a>(&'a self, ctx: &'a CollectorContext) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Kind → implementation, filled once at startup
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: BTreeMap<&'static str, Box<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(neighbors::NeighborsCollector));
        registry.register(Box::new(interfaces::InterfacesCollector));
        registry.register(Box::new(system::SystemCollector));
        registry
    }

    pub fn register(&mut self, collector: Box<dyn Collector>) {
        self.collectors.insert(collector.kind(), collector);
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.collectors.keys().copied().collect()
    }

    /// Implementation for a job name
    pub fn get(&self, job: &str) -> Result<&dyn Collector, CollectorError> {
        let kind = collector_kind(job);
        self.collectors
            .get(kind)
            .map(|c| c.as_ref())
            .ok_or_else(|| CollectorError::UnknownCollector {
                job: job.to_string(),
                kind: kind.to_string(),
            })
    }
}

/// Runs one job. A failure is queued as an `error` entry before being returned,
/// so the caller only has to exit non-zero.
pub async fn run_job(registry: &CollectorRegistry, ctx: &CollectorContext) -> anyhow::Result<()> {
    let result = match registry.get(&ctx.job) {
        Ok(collector) => collector.run(ctx).await,
        Err(e) => Err(e.into()),
    };

    match &result {
        Ok(()) => info!("collector job {} done", ctx.job),
        Err(e) => {
            let message = format!("{e:#}");
            error!("collector job {} failed: {}", ctx.job, message);
            ctx.put("error", json!({ "error": message, "process": ctx.job }))
                .context("Failed to queue collector error")?;
        }
    }
    result
}

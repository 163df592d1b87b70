//! Configuration management
//!
//! Handles:
//! - Collector API endpoint and bearer token
//! - Queue location and batching
//! - Uploader, supervisor and scheduler timings
//! - Per-collector schedules and options
//!
//! Lookup order: `--config <path>`, `VIGIE_CONFIG`, then the OS config dir.
//! `VIGIE_API_URL` / `VIGIE_API_TOKEN` override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub api: ApiConfig,
    pub queue: QueueConfig,
    pub uploader: UploaderConfig,
    pub supervisor: SupervisorConfig,
    pub scheduler: SchedulerConfig,
    pub ping: PingConfig,
    pub collectors: BTreeMap<String, CollectorConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Identity sent as `source`; the primary MAC is used when absent
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub token: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub path: PathBuf,
    pub batch_limit: usize,
    /// Archive acknowledged entries instead of deleting them
    pub keep_delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub idle_secs: u64,
    pub backoff_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub check_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub degraded_restart_secs: u64,
    pub open_circuit_secs: u64,
    pub stable_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    pub retry_gap_secs: u64,
    pub reload_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub wait: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub enabled: bool,
    /// `<dow> <days> <hours> <minutes> <seconds>`
    pub schedule: String,
    pub options: toml::Table,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let mut path = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        path.push("vigie");
        path.push("queue.db");
        Self {
            path,
            batch_limit: 50,
            keep_delivered: false,
        }
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            idle_secs: 5,
            backoff_secs: 30,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            shutdown_timeout_secs: 10,
            degraded_restart_secs: 30,
            open_circuit_secs: 300,
            stable_after_secs: 60,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            retry_gap_secs: 10,
            reload_secs: 10,
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self { wait: 30 }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "* * * * *".to_string(),
            options: toml::Table::new(),
        }
    }
}

impl UploaderConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl AgentConfig {
    /// Resolves the config location: explicit path, `VIGIE_CONFIG`, OS config dir
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Ok(path) = std::env::var("VIGIE_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        Self::config_file_path()
    }

    /// Load config from `path`, falling back to defaults when the file is absent
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Invalid config {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("VIGIE_API_URL") {
            self.api.url = url;
        }
        if let Ok(token) = std::env::var("VIGIE_API_TOKEN") {
            self.api.token = token;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.queue.batch_limit == 0 {
            anyhow::bail!("queue.batch_limit must be at least 1");
        }
        if self.supervisor.check_interval_ms == 0 || self.scheduler.tick_ms == 0 {
            anyhow::bail!("supervisor.check_interval_ms and scheduler.tick_ms must be positive");
        }
        Ok(())
    }

    /// The uploader cannot run without a collector endpoint
    pub fn require_api(&self) -> Result<()> {
        if self.api.url.trim().is_empty() {
            anyhow::bail!("api.url is not configured (set it in the config file or VIGIE_API_URL)");
        }
        Ok(())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("vigie");
        path.push("config.toml");
        Ok(path)
    }
}

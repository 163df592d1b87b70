//! Vigie Agent - Host-resident telemetry agent
//!
//! - Durable SQLite queue shared by every agent process
//! - Batching uploader with per-item acknowledgement and rate-limit handling
//! - Supervisor running the uploader, the collector scheduler and the ping unit
//! - Collectors isolated in their own processes (`vigie-agent collect <job>`)

mod collectors;
mod config;
mod discovery;
mod execution;
mod ping;
mod queue;
mod state;
mod supervisor;
mod uploader;

use anyhow::{anyhow, bail, Context, Result};
use collectors::{run_job, CollectorContext, CollectorRegistry};
use config::AgentConfig;
use discovery::AgentIdentity;
use ping::PingUnit;
use queue::QueueStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use supervisor::schedule::Schedule;
use supervisor::scheduler::SelfExec;
use supervisor::{CollectorScheduler, Supervisor, SupervisorHandle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uploader::{IngestClient, Uploader, UploaderUnit};

/// Period of the status summary logged while the agent runs
const STATUS_EVERY: Duration = Duration::from_secs(600);

const USAGE: &str = "\
usage: vigie-agent [--config <path>] [command]

commands:
  run                 run the agent (default)
  collect <job>       run one collector job and exit
  status              print queue statistics and collector jobs
  reset [--archive]   drop every queued entry (or archive them with --archive)
  forget-host <ip>    drop one address from the host inventory";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run,
    Collect(String),
    Status,
    Reset { archive: bool },
    ForgetHost(String),
    Help,
    Version,
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args<I>(args: I) -> Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut config = None;
    let mut archive = false;
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            "--archive" => archive = true,
            "-h" | "--help" => positional = vec!["help".to_string()],
            "-V" | "--version" => positional = vec!["version".to_string()],
            flag if flag.starts_with('-') => bail!("unknown option {flag}\n\n{USAGE}"),
            _ => positional.push(arg),
        }
    }

    let command = match positional.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["run"] => Command::Run,
        ["collect", job] => Command::Collect(job.to_string()),
        ["status"] => Command::Status,
        ["reset"] => Command::Reset { archive },
        ["forget-host", ip] => Command::ForgetHost(ip.to_string()),
        ["help"] => Command::Help,
        ["version"] => Command::Version,
        other => bail!("unexpected arguments {:?}\n\n{USAGE}", other),
    };

    if archive && !matches!(command, Command::Reset { .. }) {
        bail!("--archive only applies to reset");
    }

    Ok(Cli { config, command })
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigie_agent=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(config: &AgentConfig) -> Result<QueueStore> {
    QueueStore::open(&config.queue.path)
        .with_context(|| format!("Failed to open queue store {}", config.queue.path.display()))
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => info!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    Ok(())
}

async fn run(config: AgentConfig, config_path: PathBuf) -> Result<()> {
    info!("Vigie agent {} starting...", env!("CARGO_PKG_VERSION"));
    config.require_api()?;

    let store = Arc::new(open_store(&config)?);
    let identity = AgentIdentity::resolve(config.agent.source.as_deref())
        .context("Failed to resolve agent identity")?;

    let client = IngestClient::new(
        &config.api.url,
        &config.api.token,
        Duration::from_secs(config.api.timeout_secs),
    )
    .context("Failed to build HTTP client")?;
    let uploader = Uploader::new(
        store.clone(),
        client,
        identity.source.clone(),
        &config.queue,
        &config.uploader,
    );

    let registry = CollectorRegistry::builtin();
    let launcher = Arc::new(SelfExec::new(config_path.clone()));
    let scheduler = Arc::new(
        CollectorScheduler::new(&config, Some(config_path), launcher)
            .with_known_kinds(registry.kinds()),
    );

    let ping = PingUnit::new(
        store.clone(),
        identity.hostname.clone(),
        Duration::from_secs(config.ping.wait),
    );

    let mut supervisor = Supervisor::new(config.supervisor.clone());
    supervisor
        .add(Arc::new(UploaderUnit::new(uploader)))
        .add(scheduler.clone())
        .add(Arc::new(ping));
    let handle = supervisor.start();

    let mut status_tick = tokio::time::interval(STATUS_EVERY);
    status_tick.tick().await;
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = status_tick.tick() => log_status(&handle, &scheduler, &store),
        }
    }
    info!("shutdown requested");

    for unit in handle.shutdown().await {
        info!("unit {} {:?} (restarts: {})", unit.name, unit.state, unit.restart_count);
    }

    let stats = store.stats()?;
    info!(
        "Vigie agent stopped ({} pending, {} failed entries left)",
        stats.pending, stats.failed
    );
    Ok(())
}

fn log_status(handle: &SupervisorHandle, scheduler: &CollectorScheduler, store: &QueueStore) {
    for unit in handle.snapshot() {
        info!(
            "unit {}: {:?}, circuit {:?}, {} restarts, up {:?}s",
            unit.name, unit.state, unit.circuit_state, unit.restart_count, unit.uptime_seconds
        );
    }
    for job in scheduler.jobs() {
        info!(
            "collector {} ({}): {} runs, {} failures, running: {}, next: {:?}, last exit: {}",
            job.name,
            job.schedule,
            job.runs,
            job.failures,
            job.running,
            job.next_run,
            job.last_exit.as_deref().unwrap_or("-")
        );
    }
    match store.stats() {
        Ok(stats) => info!("queue: {} pending, {} failed", stats.pending, stats.failed),
        Err(e) => warn!("queue statistics unavailable: {}", e),
    }
}

async fn collect(config: AgentConfig, job: &str) -> Result<()> {
    let store = Arc::new(open_store(&config)?);
    let options = match config.collectors.get(job) {
        Some(job_config) => job_config.options.clone(),
        None => {
            warn!("collector job {} is not configured, running with default options", job);
            toml::Table::new()
        }
    };

    let ctx = CollectorContext::new(job, options, store);
    run_job(&CollectorRegistry::builtin(), &ctx).await
}

fn status(config: &AgentConfig) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.stats()?;

    let location = store.path().unwrap_or(config.queue.path.as_path());
    println!("queue: {}", location.display());
    println!("  pending:  {}", stats.pending);
    println!("  failed:   {}", stats.failed);
    println!("  uploaded: {}", stats.uploaded);

    if !config.collectors.is_empty() {
        println!("collectors:");
    }
    for (name, job) in &config.collectors {
        let schedule = match job.schedule.parse::<Schedule>() {
            Ok(schedule) => schedule.to_string(),
            Err(e) => format!("invalid schedule: {e}"),
        };
        let state = if job.enabled { "" } else { " (disabled)" };
        println!("  {name}: {schedule}{state}");
    }
    Ok(())
}

fn reset(config: &AgentConfig, archive: bool) -> Result<()> {
    let store = open_store(config)?;
    if archive {
        let count = store.mark_all_uploaded()?;
        println!("archived {count} entries");
    } else {
        let count = store.remove_all()?;
        println!("removed {count} entries");
    }
    Ok(())
}

fn forget_host(config: &AgentConfig, ip: &str) -> Result<()> {
    let store = open_store(config)?;
    if store.remove_host(ip)? {
        println!("removed {ip} from the host inventory");
    } else {
        println!("{ip} is not in the host inventory");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = parse_args(std::env::args().skip(1))?;
    match cli.command {
        Command::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        Command::Version => {
            println!("vigie-agent {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let config_path = AgentConfig::resolve_path(cli.config.as_deref())?;
    let config = AgentConfig::load(&config_path)
        .await
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Run => run(config, config_path).await,
        Command::Collect(job) => collect(config, &job).await,
        Command::Status => status(&config),
        Command::Reset { archive } => reset(&config, archive),
        Command::ForgetHost(ip) => forget_host(&config, &ip),
        Command::Help | Command::Version => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_default_command_is_run() {
        assert_eq!(parse(&[]).unwrap(), Cli { config: None, command: Command::Run });
    }

    #[test]
    fn test_parse_commands() {
        let cli = parse(&["--config", "/etc/vigie.toml", "collect", "neighbors.lan"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/vigie.toml")));
        assert_eq!(cli.command, Command::Collect("neighbors.lan".to_string()));

        assert_eq!(parse(&["status"]).unwrap().command, Command::Status);
        assert_eq!(parse(&["reset"]).unwrap().command, Command::Reset { archive: false });
        assert_eq!(
            parse(&["reset", "--archive"]).unwrap().command,
            Command::Reset { archive: true }
        );
        assert_eq!(
            parse(&["forget-host", "10.0.0.5"]).unwrap().command,
            Command::ForgetHost("10.0.0.5".to_string())
        );
        assert_eq!(parse(&["--help"]).unwrap().command, Command::Help);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["collect"]).is_err());
        assert!(parse(&["status", "--archive"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
        assert!(parse(&["launch"]).is_err());
        assert!(parse(&["forget-host"]).is_err());
    }

    #[tokio::test]
    async fn test_collect_command_queues_error_for_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.queue.path = dir.path().join("queue.db");

        assert!(collect(config.clone(), "nmap").await.is_err());

        let store = QueueStore::open(&config.queue.path).unwrap();
        let entries = store.peek(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, "error");
        assert_eq!(entries[0].payload["process"], "nmap");
    }

    #[tokio::test]
    async fn test_collector_error_reaches_the_api() {
        let harness = vigie_devkit::TestHarness::start().await.unwrap();
        harness.api.accept_all().await;
        let path = harness.write_config("[agent]\nsource = \"test-source\"\n").unwrap();
        let config = AgentConfig::parse(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(config.queue.path, harness.db_path());

        assert!(collect(config.clone(), "nmap.lan").await.is_err());

        let store = Arc::new(open_store(&config).unwrap());
        let client = IngestClient::new(&config.api.url, &config.api.token, Duration::from_secs(5))
            .unwrap();
        let uploader = Uploader::new(
            store.clone(),
            client,
            "test-source".to_string(),
            &config.queue,
            &config.uploader,
        );
        let report = uploader.run_cycle().await.unwrap();
        assert_eq!((report.batch, report.removed), (1, 1));
        assert!(store.peek(10).unwrap().is_empty());

        let batches = harness.api.received_batches().await;
        let record = &batches[0][0];
        vigie_devkit::contract_helpers::assert_upload_record(record).unwrap();
        assert_eq!(record["source"], "test-source");
        assert_eq!(record["type"], "error");
        assert_eq!(
            vigie_devkit::contract_helpers::field(record, "payload.process"),
            Some(&serde_json::json!("nmap.lan"))
        );
    }

    #[test]
    fn test_reset_archive_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.queue.path = dir.path().join("queue.db");

        {
            let store = open_store(&config).unwrap();
            store.put("ping", &serde_json::json!({}), 1).unwrap();
            store.put("ping", &serde_json::json!({}), 2).unwrap();
        }
        reset(&config, true).unwrap();
        assert_eq!(open_store(&config).unwrap().stats().unwrap().uploaded, 2);

        reset(&config, false).unwrap();
        assert_eq!(open_store(&config).unwrap().stats().unwrap(), queue::QueueStats::default());
    }

    #[test]
    fn test_forget_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.queue.path = dir.path().join("queue.db");

        open_store(&config).unwrap().put_host("10.0.0.5", "aa:bb").unwrap();
        forget_host(&config, "10.0.0.5").unwrap();
        assert!(open_store(&config).unwrap().find_host("10.0.0.5").unwrap().is_none());

        // unknown address is reported, not an error
        forget_host(&config, "10.0.0.5").unwrap();
    }
}

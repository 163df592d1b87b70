/**
 * COLLECTOR SCHEDULER - Planification des collecteurs en processus isolés
 *
 * RÔLE :
 * Unité supervisée qui lance chaque job `[collectors.*]` dans son propre
 * processus OS selon sa planification, récolte les sorties et relance.
 *
 * FONCTIONNEMENT :
 * - Un tick toutes les `tick_ms` : récolte des sorties, puis lancement des jobs dus
 * - Job périodique encore actif à l'échéance → échéance sautée, pas de doublon
 * - Job continu : un seul lancement, relancé uniquement après un échec
 *   (au plus une fois par `retry_gap_secs`)
 * - Rechargement de la config toutes les `reload_secs` (ajout, retrait, replanification)
 * - Arrêt : SIGTERM à chaque enfant, attente bornée, puis kill
 *
 * Un crash de collecteur reste local à son processus : il est journalisé
 * et n'affecte ni l'uploader ni les autres jobs.
 */

use super::schedule::Schedule;
use super::{StopSignal, Unit};
use crate::collectors::collector_kind;
use crate::config::{AgentConfig, CollectorConfig, SchedulerConfig};
use crate::state::{new_state, Shared};
use chrono::{Local, NaiveDateTime};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Construit la commande qui exécute un job dans un processus séparé
pub trait Launcher: Send + Sync + 'static {
    fn command(&self, job: &str) -> std::io::Result<Command>;
}

/// Relance le binaire courant : `vigie-agent --config <path> collect <job>`
#[derive(Debug, Clone)]
pub struct SelfExec {
    config_path: PathBuf,
}

impl SelfExec {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }
}

impl Launcher for SelfExec {
    fn command(&self, job: &str) -> std::io::Result<Command> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        cmd.arg("--config")
            .arg(&self.config_path)
            .arg("collect")
            .arg(job)
            .env("VIGIE_JOB", job);
        Ok(cmd)
    }
}

/// Sortie observée d'un processus collecteur
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failed(String),
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            ExitOutcome::Success
        } else {
            ExitOutcome::Failed(status.to_string())
        }
    }
}

/// Processus enfant d'un job en cours d'exécution
#[derive(Debug)]
pub struct CollectorProcess {
    job: String,
    child: Child,
    started_at: Instant,
}

impl CollectorProcess {
    /// Démarre le processus; il est tué si la poignée est abandonnée
    pub fn start(launcher: &dyn Launcher, job: &str) -> std::io::Result<Self> {
        let mut cmd = launcher.command(job)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        debug!("collector job {} started (pid {:?})", job, child.id());

        Ok(Self {
            job: job.to_string(),
            child,
            started_at: Instant::now(),
        })
    }

    /// Non bloquant : None tant que le processus tourne
    pub fn try_exit(&mut self) -> Option<ExitOutcome> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.into()),
            Ok(None) => None,
            Err(e) => Some(ExitOutcome::Failed(format!("wait error: {e}"))),
        }
    }

    /// SIGTERM, attente bornée, puis arrêt forcé
    pub async fn stop(mut self, timeout: Duration) {
        if !matches!(self.child.try_wait(), Ok(None)) {
            return;
        }

        self.terminate();

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("collector job {} stopped ({}) after {:?}", self.job, status, self.started_at.elapsed())
            }
            Ok(Err(e)) => warn!("error waiting for collector job {}: {}", self.job, e),
            Err(_) => {
                warn!("collector job {} did not stop within {:?}, killing", self.job, timeout);
                if let Err(e) = self.child.kill().await {
                    error!("failed to kill collector job {}: {}", self.job, e);
                }
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("failed to send SIGTERM to collector job {}: {}", self.job, e);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("failed to stop collector job {}: {}", self.job, e);
        }
    }
}

/// État public d'un job (commande `status`, tests)
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub schedule: String,
    pub running: bool,
    pub runs: u32,
    pub failures: u32,
    pub next_run: Option<NaiveDateTime>,
    pub last_exit: Option<String>,
}

struct Job {
    name: String,
    expr: String,
    schedule: Schedule,
    next_run: Option<NaiveDateTime>,
    process: Option<CollectorProcess>,
    last_launch: Option<Instant>,
    last_failed: bool,
    runs: u32,
    failures: u32,
    last_exit: Option<String>,
}

impl Job {
    fn new(name: &str, expr: &str, schedule: Schedule, now: NaiveDateTime) -> Self {
        Self {
            name: name.to_string(),
            expr: expr.to_string(),
            schedule,
            next_run: schedule.next_after(now),
            process: None,
            last_launch: None,
            last_failed: false,
            runs: 0,
            failures: 0,
            last_exit: None,
        }
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            name: self.name.clone(),
            schedule: self.expr.clone(),
            running: self.process.is_some(),
            runs: self.runs,
            failures: self.failures,
            next_run: self.next_run,
            last_exit: self.last_exit.clone(),
        }
    }

    fn record_failure(&mut self, reason: String) {
        self.failures += 1;
        self.last_failed = true;
        self.last_exit = Some(reason);
    }
}

/// Jobs actifs + jobs refusés (pour ne pas répéter l'avertissement à chaque reload)
#[derive(Default)]
struct JobTable {
    jobs: BTreeMap<String, Job>,
    rejected: BTreeMap<String, String>,
}

pub struct CollectorScheduler {
    config: SchedulerConfig,
    shutdown_timeout: Duration,
    collectors: BTreeMap<String, CollectorConfig>,
    config_path: Option<PathBuf>,
    launcher: Arc<dyn Launcher>,
    known_kinds: Option<BTreeSet<String>>,
    published: Shared<Vec<JobInfo>>,
}

impl CollectorScheduler {
    /// `config_path` active le rechargement périodique; sans chemin, les jobs
    /// de `config` sont figés
    pub fn new(config: &AgentConfig, config_path: Option<PathBuf>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config: config.scheduler.clone(),
            shutdown_timeout: Duration::from_secs(config.supervisor.shutdown_timeout_secs),
            collectors: config.collectors.clone(),
            config_path,
            launcher,
            known_kinds: None,
            published: new_state(Vec::new()),
        }
    }

    /// Refuse les jobs dont le type de collecteur n'est pas dans `kinds`
    pub fn with_known_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_kinds = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.published.lock().clone()
    }

    async fn desired(&self, startup: bool) -> Option<BTreeMap<String, CollectorConfig>> {
        match &self.config_path {
            Some(path) => match AgentConfig::load(path).await {
                Ok(config) => Some(config.collectors),
                Err(e) => {
                    warn!("collector config reload failed, keeping current jobs: {:#}", e);
                    None
                }
            },
            None if startup => Some(self.collectors.clone()),
            None => None,
        }
    }

    async fn reconcile(&self, table: &mut JobTable, desired: &BTreeMap<String, CollectorConfig>) {
        let now = Local::now().naive_local();

        let gone: Vec<String> = table
            .jobs
            .keys()
            .filter(|name| !desired.get(*name).map(|c| c.enabled).unwrap_or(false))
            .cloned()
            .collect();
        for name in gone {
            if let Some(mut job) = table.jobs.remove(&name) {
                info!("collector job {} removed", name);
                if let Some(process) = job.process.take() {
                    process.stop(self.shutdown_timeout).await;
                }
            }
        }
        table.rejected.retain(|name, _| desired.contains_key(name));

        for (name, cfg) in desired.iter().filter(|(_, c)| c.enabled) {
            if let Some(reason) = self.reject_reason(name, cfg) {
                if table.rejected.get(name) != Some(&cfg.schedule) {
                    warn!("collector job {} ignored: {}", name, reason);
                    table.rejected.insert(name.clone(), cfg.schedule.clone());
                }
                continue;
            }
            table.rejected.remove(name);

            let Ok(schedule) = cfg.schedule.parse::<Schedule>() else {
                continue;
            };

            match table.jobs.get_mut(name) {
                Some(job) if job.expr != cfg.schedule => {
                    info!("collector job {} rescheduled: {}", name, schedule);
                    job.expr = cfg.schedule.clone();
                    job.schedule = schedule;
                    job.next_run = schedule.next_after(now);
                    job.last_launch = None;
                    job.last_failed = false;
                }
                Some(_) => {}
                None => {
                    info!("collector job {} scheduled: {}", name, schedule);
                    table.jobs.insert(name.clone(), Job::new(name, &cfg.schedule, schedule, now));
                }
            }
        }
    }

    fn reject_reason(&self, name: &str, cfg: &CollectorConfig) -> Option<String> {
        if let Some(kinds) = &self.known_kinds {
            let kind = collector_kind(name);
            if !kinds.contains(kind) {
                return Some(format!("unknown collector {kind:?}"));
            }
        }
        match cfg.schedule.parse::<Schedule>() {
            Ok(_) => None,
            Err(e) => Some(format!("invalid schedule {:?}: {}", cfg.schedule, e)),
        }
    }

    fn reap(&self, table: &mut JobTable) {
        for job in table.jobs.values_mut() {
            let Some(outcome) = job.process.as_mut().and_then(|p| p.try_exit()) else {
                continue;
            };
            job.process = None;

            match outcome {
                ExitOutcome::Success => {
                    debug!("collector job {} finished", job.name);
                    job.last_failed = false;
                    job.last_exit = Some("success".to_string());
                }
                ExitOutcome::Failed(reason) => {
                    warn!("collector job {} failed: {}", job.name, reason);
                    job.record_failure(reason);
                }
            }
        }
    }

    fn launch_due(&self, table: &mut JobTable) {
        let now = Local::now().naive_local();
        let retry_gap = Duration::from_secs(self.config.retry_gap_secs);

        for job in table.jobs.values_mut() {
            if job.schedule.is_continuous() {
                if job.process.is_some() {
                    continue;
                }
                let first = job.last_launch.is_none();
                let retry = job.last_failed
                    && job.last_launch.map(|t| t.elapsed() >= retry_gap).unwrap_or(true);
                if first || retry {
                    self.launch(job);
                }
                continue;
            }

            let Some(due) = job.next_run else {
                continue;
            };
            if now < due {
                continue;
            }
            job.next_run = job.schedule.next_after(now);

            if job.process.is_some() {
                warn!("collector job {} still running, skipping this run", job.name);
                continue;
            }
            self.launch(job);
        }
    }

    fn launch(&self, job: &mut Job) {
        job.last_launch = Some(Instant::now());
        match CollectorProcess::start(self.launcher.as_ref(), &job.name) {
            Ok(process) => {
                job.process = Some(process);
                job.runs += 1;
            }
            Err(e) => {
                warn!("collector job {} could not be started: {}", job.name, e);
                job.record_failure(format!("spawn failed: {e}"));
            }
        }
    }

    fn publish(&self, table: &JobTable) {
        let infos = table.jobs.values().map(Job::info).collect();
        *self.published.lock() = infos;
    }

    async fn run_loop(&self, stop: StopSignal) -> anyhow::Result<()> {
        let mut table = JobTable::default();
        if let Some(desired) = self.desired(true).await {
            self.reconcile(&mut table, &desired).await;
        }
        self.publish(&table);

        let reload_every = Duration::from_secs(self.config.reload_secs);
        let mut last_reload = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_ms));

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = stop.stopped() => break,
            }

            if last_reload.elapsed() >= reload_every {
                last_reload = Instant::now();
                if let Some(desired) = self.desired(false).await {
                    self.reconcile(&mut table, &desired).await;
                }
            }

            self.reap(&mut table);
            self.launch_due(&mut table);
            self.publish(&table);
        }

        info!("scheduler stopping {} collector jobs", table.jobs.len());
        for job in table.jobs.values_mut() {
            if let Some(process) = job.process.take() {
                process.stop(self.shutdown_timeout).await;
            }
        }
        self.publish(&table);
        Ok(())
    }
}

impl Unit for CollectorScheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn run(self: Arc<Self>, stop: StopSignal) -> BoxFuture<'static, anyhow::Result<()>> {
        async move { self.run_loop(stop).await }.boxed()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::stop_channel;

    /// Job name → script `sh -c`
    struct ShellLauncher(BTreeMap<String, String>);

    impl ShellLauncher {
        fn new(scripts: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self(
                scripts
                    .iter()
                    .map(|(job, script)| (job.to_string(), script.to_string()))
                    .collect(),
            ))
        }
    }

    impl Launcher for ShellLauncher {
        fn command(&self, job: &str) -> std::io::Result<Command> {
            let script = self.0.get(job).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("no script for {job}"))
            })?;
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            Ok(cmd)
        }
    }

    fn agent_config(jobs: &[(&str, &str)], retry_gap_secs: u64) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.scheduler = SchedulerConfig {
            tick_ms: 20,
            retry_gap_secs,
            reload_secs: 3600,
        };
        config.supervisor.shutdown_timeout_secs = 2;
        for (name, schedule) in jobs {
            config.collectors.insert(
                name.to_string(),
                CollectorConfig {
                    schedule: schedule.to_string(),
                    ..CollectorConfig::default()
                },
            );
        }
        config
    }

    fn job<'a>(jobs: &'a [JobInfo], name: &str) -> &'a JobInfo {
        jobs.iter().find(|j| j.name == name).unwrap()
    }

    async fn run_for(
        scheduler: CollectorScheduler,
        duration: Duration,
    ) -> (Vec<JobInfo>, Vec<JobInfo>) {
        let scheduler = Arc::new(scheduler);
        let (tx, stop) = stop_channel();
        let task = tokio::spawn(scheduler.clone().run(stop));

        tokio::time::sleep(duration).await;
        let during = scheduler.jobs();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        (during, scheduler.jobs())
    }

    #[tokio::test]
    async fn test_continuous_job_relaunched_only_after_failure() {
        let config = agent_config(&[("ok", "* * * * *"), ("bad", "* * * * *")], 0);
        let launcher = ShellLauncher::new(&[("ok", "exit 0"), ("bad", "exit 3")]);
        let scheduler = CollectorScheduler::new(&config, None, launcher);

        let (during, _) = run_for(scheduler, Duration::from_millis(600)).await;

        let ok = job(&during, "ok");
        assert_eq!(ok.runs, 1);
        assert_eq!(ok.failures, 0);
        assert!(!ok.running);

        let bad = job(&during, "bad");
        assert!(bad.runs >= 3, "bad ran {} times", bad.runs);
        assert!(bad.failures >= 2);
        assert!(bad.last_exit.as_deref().unwrap_or("").contains('3'));
    }

    #[tokio::test]
    async fn test_continuous_retry_gap_respected() {
        let config = agent_config(&[("bad", "* * * * *")], 60);
        let launcher = ShellLauncher::new(&[("bad", "exit 1")]);
        let scheduler = CollectorScheduler::new(&config, None, launcher);

        let (during, _) = run_for(scheduler, Duration::from_millis(400)).await;
        let bad = job(&during, "bad");
        assert_eq!(bad.runs, 1);
        assert_eq!(bad.failures, 1);
    }

    #[tokio::test]
    async fn test_failing_periodic_job_does_not_affect_others() {
        let config = agent_config(&[("flaky", "* * * * 1"), ("steady", "* * * * *")], 10);
        let launcher = ShellLauncher::new(&[("flaky", "exit 1"), ("steady", "exec sleep 30")]);
        let scheduler = CollectorScheduler::new(&config, None, launcher);

        let (during, after) = run_for(scheduler, Duration::from_millis(2600)).await;

        let flaky = job(&during, "flaky");
        assert!(flaky.runs >= 2, "flaky ran {} times", flaky.runs);
        assert!(flaky.failures >= 1);
        assert!(flaky.next_run.is_some());

        let steady = job(&during, "steady");
        assert!(steady.running);
        assert_eq!(steady.runs, 1);

        assert!(after.iter().all(|j| !j.running));
    }

    #[tokio::test]
    async fn test_running_job_not_launched_twice() {
        let config = agent_config(&[("slow", "* * * * 1")], 10);
        let launcher = ShellLauncher::new(&[("slow", "exec sleep 30")]);
        let scheduler = CollectorScheduler::new(&config, None, launcher);

        let (during, after) = run_for(scheduler, Duration::from_millis(2600)).await;

        let slow = job(&during, "slow");
        assert_eq!(slow.runs, 1);
        assert!(slow.running);
        assert!(!job(&after, "slow").running);
    }

    #[tokio::test]
    async fn test_unknown_kind_and_bad_schedule_ignored() {
        let config = agent_config(
            &[("neighbors.lan", "* * * * *"), ("bogus", "* * * * *"), ("neighbors.wan", "nope")],
            10,
        );
        let launcher = ShellLauncher::new(&[("neighbors.lan", "exit 0")]);
        let scheduler =
            CollectorScheduler::new(&config, None, launcher).with_known_kinds(["neighbors"]);

        let (during, _) = run_for(scheduler, Duration::from_millis(200)).await;
        assert_eq!(during.len(), 1);
        assert_eq!(during[0].name, "neighbors.lan");
    }

    #[tokio::test]
    async fn test_huge_interval_job_does_not_stop_siblings() {
        let config = agent_config(
            &[("huge", "* 100000000 * * *"), ("huger", "* * 3000000000 * *"), ("ok", "* * * * *")],
            10,
        );
        let launcher = ShellLauncher::new(&[("ok", "exec sleep 30")]);
        let scheduler = CollectorScheduler::new(&config, None, launcher);

        let (during, after) = run_for(scheduler, Duration::from_millis(300)).await;
        assert_eq!(during.len(), 1);
        let ok = job(&during, "ok");
        assert_eq!(ok.runs, 1);
        assert!(ok.running);
        assert!(!job(&after, "ok").running);
    }

    #[tokio::test]
    async fn test_reload_adds_and_removes_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[collectors.alpha]\nschedule = \"* * * * *\"\n")
            .await
            .unwrap();

        let mut config = agent_config(&[], 10);
        config.scheduler.reload_secs = 1;
        let launcher = ShellLauncher::new(&[("alpha", "exec sleep 30"), ("beta", "exec sleep 30")]);
        let scheduler = Arc::new(CollectorScheduler::new(&config, Some(path.clone()), launcher));

        let (tx, stop) = stop_channel();
        let task = tokio::spawn(scheduler.clone().run(stop));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert!(job(&jobs, "alpha").running);

        tokio::fs::write(&path, "[collectors.beta]\nschedule = \"* * * * *\"\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert!(job(&jobs, "beta").running);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(scheduler.jobs().iter().all(|j| !j.running));
    }

    #[tokio::test]
    async fn test_stop_terminates_child() {
        let launcher = ShellLauncher::new(&[("slow", "exec sleep 30")]);
        let mut process = CollectorProcess::start(launcher.as_ref(), "slow").unwrap();
        assert_eq!(process.try_exit(), None);

        let started = Instant::now();
        process.stop(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

/**
 * SUPERVISOR - Superviseur des unités longues de l'agent Vigie
 *
 * RÔLE :
 * Fait tourner un ensemble fixe d'unités nommées (uploader, scheduler, ping),
 * chacune dans sa propre tâche tokio, et redémarre toute unité dont la tâche
 * se termine sans demande d'arrêt.
 *
 * FONCTIONNEMENT :
 * - Une unité = un `Unit::run` qui tourne jusqu'à ce que son `StopSignal` passe
 * - Panic, `Err` ou `Ok` prématuré → Crashed puis Starting
 * - Circuit breaker sur les crashs consécutifs (Normal → Degraded → CircuitOpen)
 * - Arrêt coopératif : signal, attente bornée, abort en dernier recours
 *
 * CYCLE DE VIE :
 * Starting → Running → (Crashed → Starting) | Stopped
 */

pub mod schedule;
pub mod scheduler;

use crate::config::SupervisorConfig;
use crate::state::{new_state, Shared};
use futures::future::BoxFuture;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

pub use scheduler::CollectorScheduler;

/// Une unité supervisée. `run` ne doit rendre la main qu'après un arrêt demandé.
pub trait Unit: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn run(self: Arc<Self>, stop: StopSignal) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Côté réception de la demande d'arrêt, clonable dans chaque unité
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Crée un couple émetteur/signal (utilisé par le superviseur et les tests)
pub fn stop_channel() -> (watch::Sender<bool>, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (tx, StopSignal { rx })
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Se résout quand l'arrêt est demandé (ou que l'émetteur a disparu)
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Dort `duration`; retourne false si l'arrêt a interrompu l'attente
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stopped() => false,
        }
    }
}

/// État d'une unité à un instant donné
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UnitState {
    Starting,
    Running,
    Crashed(String),
    Stopped,
}

/// État du circuit breaker pour éviter les redémarrages en boucle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Normal,
    Degraded,
    CircuitOpen,
}

impl CircuitState {
    /// 1-3 crashs consécutifs : normal, 4-6 : dégradé, au-delà : ouvert
    pub fn for_crash_count(crashes: u32) -> Self {
        match crashes {
            0..=3 => CircuitState::Normal,
            4..=6 => CircuitState::Degraded,
            _ => CircuitState::CircuitOpen,
        }
    }

    pub fn restart_delay(&self, config: &SupervisorConfig) -> Duration {
        match self {
            CircuitState::Normal => Duration::ZERO,
            CircuitState::Degraded => Duration::from_secs(config.degraded_restart_secs),
            CircuitState::CircuitOpen => Duration::from_secs(config.open_circuit_secs),
        }
    }
}

/// Informations publiques d'une unité (commande `status`, tests)
#[derive(Debug, Clone, Serialize)]
pub struct UnitInfo {
    pub name: String,
    pub state: UnitState,
    pub circuit_state: CircuitState,
    pub restart_count: u32,
    pub uptime_seconds: Option<u64>,
}

/// Emplacement d'une unité dans la table du moniteur
struct UnitSlot {
    unit: Arc<dyn Unit>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
    state: UnitState,
    circuit_state: CircuitState,
    /// Crashs consécutifs, remis à zéro après `stable_after_secs` de marche
    crash_count: u32,
    /// Total des redémarrages depuis le lancement de l'agent
    restart_count: u32,
    started_at: Option<Instant>,
    restart_not_before: Option<Instant>,
}

impl UnitSlot {
    fn new(unit: Arc<dyn Unit>) -> Self {
        Self {
            unit,
            task: None,
            state: UnitState::Stopped,
            circuit_state: CircuitState::Normal,
            crash_count: 0,
            restart_count: 0,
            started_at: None,
            restart_not_before: None,
        }
    }

    fn name(&self) -> &str {
        self.unit.name()
    }

    fn spawn(&mut self, stop: &StopSignal) {
        let future = self.unit.clone().run(stop.clone());
        self.task = Some(tokio::spawn(future));
        self.state = UnitState::Starting;
        self.started_at = Some(Instant::now());
        self.restart_not_before = None;
        debug!("unit {} starting", self.name());
    }

    fn info(&self) -> UnitInfo {
        UnitInfo {
            name: self.name().to_string(),
            state: self.state.clone(),
            circuit_state: self.circuit_state,
            restart_count: self.restart_count,
            uptime_seconds: match self.state {
                UnitState::Starting | UnitState::Running => {
                    self.started_at.map(|t| t.elapsed().as_secs())
                }
                _ => None,
            },
        }
    }

    fn record_crash(&mut self, reason: String, config: &SupervisorConfig) {
        self.crash_count += 1;
        self.circuit_state = CircuitState::for_crash_count(self.crash_count);
        let delay = self.circuit_state.restart_delay(config);
        self.restart_not_before = Some(Instant::now() + delay);
        self.started_at = None;

        match self.circuit_state {
            CircuitState::Normal => {
                warn!("unit {} crashed: {}", self.name(), reason);
            }
            CircuitState::Degraded => {
                warn!(
                    "unit {} crashed ({} in a row), degraded mode, next restart in {:?}: {}",
                    self.name(),
                    self.crash_count,
                    delay,
                    reason
                );
            }
            CircuitState::CircuitOpen => {
                error!(
                    "unit {} crashed ({} in a row), circuit open, next restart in {:?}: {}",
                    self.name(),
                    self.crash_count,
                    delay,
                    reason
                );
            }
        }
        self.state = UnitState::Crashed(reason);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn exit_reason(result: Result<anyhow::Result<()>, JoinError>) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(e) if e.is_panic() => Some(format!("panicked: {}", panic_message(e.into_panic()))),
        Err(e) => Some(format!("task aborted: {e}")),
    }
}

/// Constructeur : on enregistre les unités puis on démarre
pub struct Supervisor {
    config: SupervisorConfig,
    units: Vec<Arc<dyn Unit>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            units: Vec::new(),
        }
    }

    pub fn add(&mut self, unit: Arc<dyn Unit>) -> &mut Self {
        self.units.push(unit);
        self
    }

    /// Démarre toutes les unités et le moniteur
    pub fn start(self) -> SupervisorHandle {
        let (stop_tx, stop) = stop_channel();
        let table = new_state(Vec::new());

        let mut slots: Vec<UnitSlot> = self.units.into_iter().map(UnitSlot::new).collect();
        for slot in &mut slots {
            slot.spawn(&stop);
        }
        *table.lock() = slots.iter().map(UnitSlot::info).collect();

        info!(
            "supervisor started {} units: [{}]",
            slots.len(),
            slots.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );

        let monitor = Monitor {
            config: self.config,
            slots,
            table: table.clone(),
            stop,
        };
        let monitor = tokio::spawn(monitor.run());

        SupervisorHandle {
            stop_tx,
            table,
            monitor,
        }
    }
}

/// Tâche unique propriétaire des JoinHandle; publie l'état dans `table`
struct Monitor {
    config: SupervisorConfig,
    slots: Vec<UnitSlot>,
    table: Shared<Vec<UnitInfo>>,
    stop: StopSignal,
}

impl Monitor {
    async fn run(mut self) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.check_interval_ms));
        let stop = self.stop.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_all().await;
                    self.publish();
                }
                _ = stop.stopped() => break,
            }
        }

        self.shutdown_all().await;
        self.publish();
    }

    async fn check_all(&mut self) {
        let stable_after = Duration::from_secs(self.config.stable_after_secs);

        for slot in &mut self.slots {
            let finished = slot.task.as_ref().map(|t| t.is_finished()).unwrap_or(false);

            if finished {
                if let Some(task) = slot.task.take() {
                    let reason = exit_reason(task.await)
                        .unwrap_or_else(|| "returned without a stop request".to_string());
                    slot.record_crash(reason, &self.config);
                }
            } else if slot.task.is_some() {
                if slot.state == UnitState::Starting {
                    slot.state = UnitState::Running;
                    debug!("unit {} running", slot.name());
                }
                let stable = slot.started_at.map(|t| t.elapsed() >= stable_after).unwrap_or(false);
                if stable && slot.crash_count > 0 {
                    info!("unit {} stable again, crash count reset", slot.name());
                    slot.crash_count = 0;
                    slot.circuit_state = CircuitState::Normal;
                }
            }

            if matches!(slot.state, UnitState::Crashed(_)) {
                let due = slot
                    .restart_not_before
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(true);
                if due && !self.stop.is_stopped() {
                    slot.restart_count += 1;
                    info!("restarting unit {} (restart #{})", slot.name(), slot.restart_count);
                    slot.spawn(&self.stop);
                }
            }
        }
    }

    async fn shutdown_all(&mut self) {
        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        info!("supervisor shutting down {} units", self.slots.len());

        for slot in &mut self.slots {
            if let Some(mut task) = slot.task.take() {
                match tokio::time::timeout(timeout, &mut task).await {
                    Ok(result) => {
                        if let Some(reason) = exit_reason(result) {
                            warn!("unit {} stopped with error: {}", slot.name(), reason);
                        } else {
                            debug!("unit {} stopped cleanly", slot.name());
                        }
                    }
                    Err(_) => {
                        warn!("unit {} did not stop within {:?}, aborting", slot.name(), timeout);
                        task.abort();
                        let _ = task.await;
                    }
                }
            }
            slot.state = UnitState::Stopped;
            slot.started_at = None;
        }

        info!("supervisor shutdown complete");
    }

    fn publish(&self) {
        let infos: Vec<UnitInfo> = self.slots.iter().map(UnitSlot::info).collect();
        *self.table.lock() = infos;
    }
}

/// Poignée rendue par `Supervisor::start`
pub struct SupervisorHandle {
    stop_tx: watch::Sender<bool>,
    table: Shared<Vec<UnitInfo>>,
    monitor: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn snapshot(&self) -> Vec<UnitInfo> {
        self.table.lock().clone()
    }

    /// Arrêt en cascade; retourne l'état final des unités
    pub async fn shutdown(self) -> Vec<UnitInfo> {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.monitor.await {
            error!("supervisor monitor failed: {}", e);
        }
        self.table.lock().clone()
    }
}

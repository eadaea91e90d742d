//! Instance actor - supervises the connection of a single instance.
//!
//! The actor owns everything that belongs to one instance: its config, the
//! live session handle, retry bookkeeping, timers and the activity monitor.
//! Messages are processed one at a time, so a reconnect can never race a
//! teardown.
//!
//! ## State Machine
//!
//! ```text
//! disconnected -> connecting -> connected
//!       ^             |            |
//!       |             v            v
//!       +-------- repairing <------+
//!                     |
//!                     v
//!                  failed   (bounded policies only, until restart)
//! ```
//!
//! Every teardown bumps the generation counter. Timers, event pumps and
//! in-flight opens tag what they post with the generation they were started
//! under, and anything carrying an older generation is dropped on arrival.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::{
    ConnectionState, InstanceKind, LogLevel, ModeName, ModeSet, Position, RestartScheduleView,
    StatusSnapshot, Telemetry,
};
use fleet_id::InstanceId;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::framework::{spawn_actor, Actor, ActorContext, ActorError, ActorHandle, ActorRef};
use super::restore::restore_modes;
use super::timers::{TimerKind, Timers};
use crate::activity::ActivityMonitor;
use crate::broadcast::StatusBroadcaster;
use crate::config::SupervisorTimings;
use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionHandle, Connector, EventSubscription,
    OpenedConnection, ProbeOutcome, Prober,
};
use crate::error::SupervisorError;
use crate::logs::{LogRing, INSTANCE_LOG_CAPACITY};
use crate::modes::{EffectorContext, ModeEffector};
use crate::reconnect::{ReconnectPolicy, RetryState};
use crate::remote::{PowerSignal, RemoteManagement};
use crate::roster::{AutoChatConfig, ConfigPatch, InstanceConfig, RosterError, RosterStore};

/// Mailbox depth per instance.
pub const INSTANCE_MAILBOX_CAPACITY: usize = 64;

/// Command sent by the restart schedule.
const RESTART_COMMAND: &str = "restart";

type Reply<T> = oneshot::Sender<Result<T, SupervisorError>>;

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by [`InstanceActor`].
#[derive(Debug)]
pub enum InstanceMessage {
    /// Connect if not connected. The reply resolves once the connection is
    /// ready, or with the error that ended the attempt.
    Connect { reply: Option<Reply<()>> },

    /// Final teardown. The actor stops after handling it.
    Disconnect { reply: Option<oneshot::Sender<()>> },

    /// Tear down and reconnect, clearing retry exhaustion.
    Restart { reply: Option<Reply<()>> },

    /// Treat the current connection as broken.
    Repair { reason: String },

    SetMode {
        mode: ModeName,
        enabled: bool,
        reply: Reply<ModeSet>,
    },

    StopAllModes { reply: Reply<ModeSet> },

    SendCommand { text: String, reply: Reply<()> },

    SetAutoChat {
        config: AutoChatConfig,
        reply: Reply<()>,
    },

    /// `None` or zero clears the schedule.
    SetRestartSchedule {
        minutes: Option<u32>,
        reply: Reply<()>,
    },

    GrantOperator { reply: Reply<()> },

    PowerSignal {
        signal: PowerSignal,
        reply: Reply<()>,
    },

    /// Applies a patch that does not touch how the instance connects.
    /// Already persisted by the sender.
    Reconfigure { patch: ConfigPatch },

    // ---- internal, generation-tagged ----
    GraceElapsed { generation: u64 },
    Opened {
        generation: u64,
        result: Result<OpenedConnection, ConnectionError>,
    },
    Event {
        generation: u64,
        event: ConnectionEvent,
    },
    EventsEnded { generation: u64 },
    ConnectTimeout { generation: u64 },
    ReconnectDue { generation: u64 },
    SettleElapsed { generation: u64 },
    ActivityCheck { generation: u64 },
    AutoChatTick { generation: u64 },
    RestartTick { generation: u64 },
    ProbeDue { generation: u64 },
    ProbeFinished {
        generation: u64,
        result: Result<ProbeOutcome, ConnectionError>,
    },
}

// =============================================================================
// Collaborators
// =============================================================================

/// How an instance talks to its server.
#[derive(Clone)]
pub enum InstanceDriver {
    /// Persistent session with mode support.
    Session {
        connector: Arc<dyn Connector>,
        effector: Arc<dyn ModeEffector>,
    },
    /// Periodic reachability probes, no session.
    Probe { prober: Arc<dyn Prober> },
}

/// Shared services every instance actor uses.
#[derive(Clone)]
pub struct InstanceDeps {
    pub remote: Arc<dyn RemoteManagement>,
    pub roster: Arc<dyn RosterStore>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub timings: SupervisorTimings,
}

/// A running instance actor and the read side of its state.
pub struct SpawnedInstance {
    pub handle: ActorHandle<InstanceMessage>,
    pub actor: ActorRef,
    pub status: watch::Receiver<StatusSnapshot>,
    pub logs: Arc<Mutex<LogRing>>,
}

/// Spawns an actor for `config`.
pub fn spawn_instance(
    config: InstanceConfig,
    driver: InstanceDriver,
    policy: ReconnectPolicy,
    deps: InstanceDeps,
) -> SpawnedInstance {
    let (handle, mailbox) = ActorHandle::channel("instance", INSTANCE_MAILBOX_CAPACITY);
    let logs = Arc::new(Mutex::new(LogRing::new(INSTANCE_LOG_CAPACITY)));
    let actor = InstanceActor::new(config, driver, policy, deps, handle.clone(), logs.clone());
    let status = actor.status_tx.subscribe();
    let actor = spawn_actor(actor, mailbox);
    SpawnedInstance {
        handle,
        actor,
        status,
        logs,
    }
}

/// Locks a log ring, recovering from a poisoned lock.
pub fn lock_logs(logs: &Mutex<LogRing>) -> MutexGuard<'_, LogRing> {
    logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Actor State
// =============================================================================

#[derive(Debug)]
struct Session {
    handle: Arc<dyn ConnectionHandle>,
    pump: JoinHandle<()>,
}

/// Connection supervisor for one instance.
pub struct InstanceActor {
    config: InstanceConfig,
    driver: InstanceDriver,
    policy: ReconnectPolicy,
    deps: InstanceDeps,
    mailbox: ActorHandle<InstanceMessage>,

    state: ConnectionState,
    generation: u64,
    /// Set by disconnect. Never cleared.
    destroyed: bool,
    session: Option<Session>,
    /// Cancels the in-flight open when dropped.
    opening: Option<oneshot::Sender<()>>,
    /// Modes whose effectors are running on the current session.
    active_modes: BTreeSet<ModeName>,
    waiters: Vec<Reply<()>>,

    timers: Timers,
    activity: ActivityMonitor,
    retry: RetryState,

    telemetry: Telemetry,
    baseline: Option<Position>,
    connected_at: Option<DateTime<Utc>>,
    next_restart_at: Option<DateTime<Utc>>,

    logs: Arc<Mutex<LogRing>>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl InstanceActor {
    pub fn new(
        config: InstanceConfig,
        driver: InstanceDriver,
        policy: ReconnectPolicy,
        deps: InstanceDeps,
        mailbox: ActorHandle<InstanceMessage>,
        logs: Arc<Mutex<LogRing>>,
    ) -> Self {
        let activity = ActivityMonitor::new(
            deps.timings.activity_threshold,
            deps.timings.activity_check_interval,
        );
        let initial = StatusSnapshot::initial(
            config.id.clone(),
            config.display_name(),
            config.kind,
            config.address(),
        );
        let (status_tx, _) = watch::channel(initial);
        let mut actor = Self {
            config,
            driver,
            policy,
            deps,
            mailbox,
            state: ConnectionState::Disconnected,
            generation: 0,
            destroyed: false,
            session: None,
            opening: None,
            active_modes: BTreeSet::new(),
            waiters: Vec::new(),
            timers: Timers::new(),
            activity,
            retry: RetryState::default(),
            telemetry: Telemetry::default(),
            baseline: None,
            connected_at: None,
            next_restart_at: None,
            logs,
            status_tx,
        };
        let snapshot = actor.snapshot();
        actor.status_tx.send_replace(snapshot);
        actor
    }

    fn id(&self) -> &InstanceId {
        &self.config.id
    }

    fn kind(&self) -> InstanceKind {
        match self.driver {
            InstanceDriver::Session { .. } => InstanceKind::Full,
            InstanceDriver::Probe { .. } => InstanceKind::StatusOnly,
        }
    }

    fn effector(&self) -> Option<Arc<dyn ModeEffector>> {
        match &self.driver {
            InstanceDriver::Session { effector, .. } => Some(Arc::clone(effector)),
            InstanceDriver::Probe { .. } => None,
        }
    }

    fn effector_context(&self, handle: &Arc<dyn ConnectionHandle>) -> EffectorContext {
        EffectorContext {
            instance_id: self.config.id.clone(),
            username: self.config.username.clone(),
            handle: Arc::clone(handle),
            remote: Arc::clone(&self.deps.remote),
            baseline: self.baseline,
        }
    }

    fn live_handle(&self) -> Option<Arc<dyn ConnectionHandle>> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.session.as_ref().map(|s| Arc::clone(&s.handle))
    }

    fn is_current(&self, generation: u64) -> bool {
        if self.destroyed || generation != self.generation {
            trace!(
                instance_id = %self.id(),
                generation,
                current = self.generation,
                "Dropping stale message"
            );
            return false;
        }
        true
    }

    // =========================================================================
    // Connect
    // =========================================================================

    async fn handle_connect(&mut self, reply: Option<Reply<()>>) {
        if self.destroyed {
            warn!(instance_id = %self.id(), "Connect requested for destroyed instance");
            self.reply(reply, Err(SupervisorError::Destroyed));
            return;
        }
        if let Err(e) = self.config.target() {
            self.log(LogLevel::Error, format!("Invalid configuration: {e}"));
            self.reply(reply, Err(SupervisorError::Config(e)));
            return;
        }

        match self.state {
            ConnectionState::Connected => {
                self.reply(reply, Ok(()));
                return;
            }
            ConnectionState::Connecting => {
                debug!(instance_id = %self.id(), "Connect joined in-flight attempt");
                self.waiters.extend(reply);
                return;
            }
            ConnectionState::Failed => {
                self.log(LogLevel::Info, "Retrying after exhausted reconnects");
                self.retry.reset();
            }
            ConnectionState::Disconnected | ConnectionState::Repairing => {}
        }

        self.waiters.extend(reply);
        self.begin_attempt().await;
    }

    /// Starts a fresh attempt. Anything left of the previous connection is
    /// torn down first; if there was a live session or a pending open, the
    /// next open waits for the reconnect grace so the remote side can notice
    /// it left.
    async fn begin_attempt(&mut self) {
        let had_session = self.session.is_some() || self.opening.is_some();
        self.teardown("reconnecting").await;
        self.state = ConnectionState::Connecting;

        let generation = self.generation;
        match &self.driver {
            InstanceDriver::Session { .. } if had_session => {
                debug!(instance_id = %self.id(), "Waiting out reconnect grace");
                self.timers.schedule(
                    TimerKind::Grace,
                    self.deps.timings.reconnect_grace,
                    &self.mailbox,
                    InstanceMessage::GraceElapsed { generation },
                );
            }
            InstanceDriver::Session { .. } => self.open_session(),
            InstanceDriver::Probe { .. } => self.start_probe(),
        }
    }

    fn open_session(&mut self) {
        let InstanceDriver::Session { connector, .. } = &self.driver else {
            return;
        };
        let target = match self.config.target() {
            Ok(target) => target,
            Err(e) => {
                // Config changed under us; report and stay down.
                self.log(LogLevel::Error, format!("Invalid configuration: {e}"));
                self.state = ConnectionState::Disconnected;
                self.fail_waiters(SupervisorError::Config(e));
                return;
            }
        };

        let generation = self.generation;
        let connector = Arc::clone(connector);
        let mailbox = self.mailbox.clone();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.opening = Some(cancel_tx);
        self.log(LogLevel::Info, format!("Connecting to {}", target.address()));
        tokio::spawn(async move {
            // Teardown drops the sender; an open still pending then is
            // abandoned before it can produce a handle.
            let result = tokio::select! {
                biased;

                result = connector.open(&target) => result,
                _ = &mut cancel_rx => {
                    trace!(generation, "Pending open cancelled");
                    return;
                }
            };
            let msg = InstanceMessage::Opened { generation, result };
            // The actor is gone; nobody else will close this session.
            if let Err(InstanceMessage::Opened {
                result: Ok(opened), ..
            }) = mailbox.deliver(msg).await
            {
                let _ = opened.handle.close().await;
            }
        });

        self.timers.schedule(
            TimerKind::ConnectTimeout,
            self.deps.timings.connect_timeout,
            &self.mailbox,
            InstanceMessage::ConnectTimeout { generation },
        );
    }

    async fn handle_opened(
        &mut self,
        generation: u64,
        result: Result<OpenedConnection, ConnectionError>,
    ) {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            if let Ok(opened) = result {
                debug!(
                    instance_id = %self.id(),
                    session_id = %opened.handle.session_id(),
                    "Closing session opened by a superseded attempt"
                );
                if let Err(e) = opened.handle.close().await {
                    debug!(instance_id = %self.id(), error = %e, "Stale session close failed");
                }
            }
            return;
        }

        self.opening = None;
        match result {
            Ok(opened) => {
                info!(
                    instance_id = %self.id(),
                    session_id = %opened.handle.session_id(),
                    "Session opened, waiting for ready"
                );
                let pump = tokio::spawn(pump_events(
                    opened.events,
                    self.mailbox.clone(),
                    generation,
                ));
                self.session = Some(Session {
                    handle: opened.handle,
                    pump,
                });
            }
            Err(e) => {
                self.log(LogLevel::Error, format!("Connection failed: {e}"));
                self.attempt_repair(format!("connect failed: {e}"), SupervisorError::Connection(e))
                    .await;
            }
        }
    }

    async fn handle_event(&mut self, event: ConnectionEvent) {
        self.activity.record_activity();

        match event {
            ConnectionEvent::Ready => self.on_ready(),
            ConnectionEvent::Established { origin } => {
                if let Some(origin) = origin {
                    self.telemetry.position = Some(origin);
                }
                self.baseline = origin.or(self.telemetry.position);
                debug!(instance_id = %self.id(), baseline = ?self.baseline, "Session established");
            }
            ConnectionEvent::Telemetry(update) => update.apply_to(&mut self.telemetry),
            ConnectionEvent::PlayerJoined(name) => {
                if self.telemetry.players.insert(name.clone()) {
                    self.log(LogLevel::Info, format!("{name} joined"));
                }
            }
            ConnectionEvent::PlayerLeft(name) => {
                if self.telemetry.players.remove(&name) {
                    self.log(LogLevel::Info, format!("{name} left"));
                }
            }
            ConnectionEvent::Chat { from, message } => {
                self.log(LogLevel::Chat, format!("<{from}> {message}"));
            }
            ConnectionEvent::Inbound(line) => {
                trace!(instance_id = %self.id(), line = %line, "Inbound");
            }
            ConnectionEvent::Error(reason) => {
                self.log(LogLevel::Error, format!("Connection error: {reason}"));
                let reason = format!("error: {reason}");
                self.attempt_repair(reason.clone(), SupervisorError::Interrupted(reason))
                    .await;
            }
            ConnectionEvent::ForcedDisconnect(reason) => {
                self.log(LogLevel::Warning, format!("Kicked: {reason}"));
                let reason = format!("kicked: {reason}");
                self.attempt_repair(reason.clone(), SupervisorError::Interrupted(reason))
                    .await;
            }
            ConnectionEvent::Closed => {
                self.log(LogLevel::Warning, "Connection closed");
                self.repair("connection closed").await;
            }
        }
    }

    fn on_ready(&mut self) {
        if self.state != ConnectionState::Connecting {
            debug!(instance_id = %self.id(), state = %self.state, "Ignoring repeated ready");
            return;
        }
        let generation = self.generation;
        self.timers.cancel(TimerKind::ConnectTimeout);
        self.state = ConnectionState::Connected;
        self.retry.reset();
        self.connected_at = Some(Utc::now());

        self.activity
            .start(&self.mailbox, move || InstanceMessage::ActivityCheck { generation });
        self.timers.schedule(
            TimerKind::Settle,
            self.deps.timings.settle_delay,
            &self.mailbox,
            InstanceMessage::SettleElapsed { generation },
        );
        self.arm_restart_schedule();

        let user = self.config.username.clone().unwrap_or_default();
        self.log(
            LogLevel::Success,
            format!("Connected to {} as {user}", self.config.address()),
        );
        self.resolve_waiters();
    }

    // =========================================================================
    // Probe driver
    // =========================================================================

    fn start_probe(&mut self) {
        let InstanceDriver::Probe { prober } = &self.driver else {
            return;
        };
        let target = match self.config.target() {
            Ok(target) => target,
            Err(e) => {
                self.log(LogLevel::Error, format!("Invalid configuration: {e}"));
                self.state = ConnectionState::Disconnected;
                self.fail_waiters(SupervisorError::Config(e));
                return;
            }
        };

        let generation = self.generation;
        let prober = Arc::clone(prober);
        let mailbox = self.mailbox.clone();
        let timeout = self.deps.timings.probe_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, prober.probe(&target)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(timeout)),
            };
            let _ = mailbox
                .send(InstanceMessage::ProbeFinished { generation, result })
                .await;
        });
    }

    async fn handle_probe_finished(&mut self, result: Result<ProbeOutcome, ConnectionError>) {
        if !self.state.is_connected() && self.state != ConnectionState::Connecting {
            return;
        }
        match result {
            Ok(outcome) => {
                self.activity.record_activity();
                self.telemetry.latency_ms =
                    Some(u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX));
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Connected;
                    self.retry.reset();
                    self.connected_at = Some(Utc::now());
                    self.arm_restart_schedule();
                    self.log(
                        LogLevel::Success,
                        format!(
                            "{} reachable ({} ms)",
                            self.config.address(),
                            outcome.latency.as_millis()
                        ),
                    );
                    self.resolve_waiters();
                }
                let generation = self.generation;
                self.timers.schedule(
                    TimerKind::Probe,
                    self.deps.timings.probe_interval,
                    &self.mailbox,
                    InstanceMessage::ProbeDue { generation },
                );
            }
            Err(e) => {
                self.log(LogLevel::Warning, format!("Probe failed: {e}"));
                self.attempt_repair(format!("probe failed: {e}"), SupervisorError::Connection(e))
                    .await;
            }
        }
    }

    // =========================================================================
    // Repair and teardown
    // =========================================================================

    /// Tears the connection down and schedules the next attempt per policy.
    /// No-op while already repairing, failed or destroyed. Pending connect
    /// callers are rejected with `cause`.
    async fn attempt_repair(&mut self, reason: String, cause: SupervisorError) {
        if self.destroyed {
            warn!(instance_id = %self.id(), reason = %reason, "Repair requested for destroyed instance");
            return;
        }
        match self.state {
            ConnectionState::Repairing | ConnectionState::Failed => {
                debug!(instance_id = %self.id(), state = %self.state, reason = %reason, "Repair already handled");
                return;
            }
            // Nothing to repair; connecting is an explicit request.
            ConnectionState::Disconnected if self.session.is_none() => {
                warn!(instance_id = %self.id(), reason = %reason, "Repair requested while disconnected, ignoring");
                return;
            }
            _ => {}
        }

        self.teardown(&reason).await;
        self.activity.reset();

        match self.retry.record_failure(&self.policy, &reason) {
            Some(delay) => {
                self.state = ConnectionState::Repairing;
                let generation = self.generation;
                self.timers.schedule(
                    TimerKind::Reconnect,
                    delay,
                    &self.mailbox,
                    InstanceMessage::ReconnectDue { generation },
                );
                self.log(
                    LogLevel::Warning,
                    format!(
                        "Connection lost ({reason}); reconnecting in {}s (attempt {})",
                        delay.as_secs_f32(),
                        self.retry.attempt_count
                    ),
                );
            }
            None => {
                self.state = ConnectionState::Failed;
                self.log(
                    LogLevel::Error,
                    format!(
                        "Giving up after {} attempts ({reason}); restart required",
                        self.retry.attempt_count.saturating_sub(1)
                    ),
                );
            }
        }
        self.fail_waiters(cause);
    }

    async fn repair(&mut self, reason: &str) {
        self.attempt_repair(
            reason.to_string(),
            SupervisorError::Interrupted(reason.to_string()),
        )
        .await;
    }

    /// Releases everything tied to the current connection. Idempotent.
    async fn teardown(&mut self, reason: &str) {
        self.timers.cancel_all();
        self.activity.stop();
        if self.opening.take().is_some() {
            debug!(instance_id = %self.id(), reason, "Cancelled pending open");
        }

        let active = std::mem::take(&mut self.active_modes);
        if let Some(session) = self.session.take() {
            session.pump.abort();
            if let Some(effector) = self.effector() {
                let ctx = self.effector_context(&session.handle);
                for mode in active {
                    if let Err(e) = effector.deactivate(mode, &ctx).await {
                        debug!(instance_id = %self.id(), mode = %mode, error = %e, "Mode stop failed during teardown");
                    }
                }
            }
            if let Err(e) = session.handle.close().await {
                warn!(instance_id = %self.id(), error = %e, "Session did not close cleanly");
            }
            debug!(
                instance_id = %self.id(),
                session_id = %session.handle.session_id(),
                reason,
                "Session torn down"
            );
        }

        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.connected_at = None;
        self.next_restart_at = None;
        self.telemetry.players.clear();
    }

    async fn handle_disconnect(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.teardown("disconnected").await;
        self.fail_waiters(SupervisorError::Destroyed);
        self.log(LogLevel::Info, "Disconnected");
    }

    async fn handle_restart(&mut self) -> Result<(), SupervisorError> {
        if self.destroyed {
            return Err(SupervisorError::Destroyed);
        }
        self.config.target()?;
        self.log(LogLevel::Info, "Restart requested");
        self.retry.reset();
        self.fail_waiters(SupervisorError::Interrupted("restart".to_string()));
        self.begin_attempt().await;
        Ok(())
    }

    // =========================================================================
    // Modes
    // =========================================================================

    async fn restore_after_settle(&mut self) {
        let (Some(effector), Some(handle)) = (self.effector(), self.live_handle()) else {
            return;
        };
        // Modes switched on during the settle window are already running.
        let pending: ModeSet = self
            .config
            .modes
            .enabled()
            .filter(|mode| !self.active_modes.contains(mode))
            .collect();
        if !pending.any_enabled() {
            return;
        }

        let ctx = self.effector_context(&handle);
        let report = restore_modes(&pending, effector.as_ref(), &ctx).await;
        self.active_modes.extend(report.restored.iter().copied());

        if report.restored.contains(&ModeName::AutoChat) {
            self.start_auto_chat();
        }
        for (mode, err) in &report.failed {
            self.config.modes.set(*mode, false);
            self.log(
                LogLevel::Warning,
                format!("Could not restore {mode}: {err}; mode disabled"),
            );
        }
        if !report.failed.is_empty() {
            self.persist(ConfigPatch::modes(self.config.modes.clone()));
        }
        self.log(
            LogLevel::Info,
            format!(
                "Restored {} of {} modes",
                report.restored.len(),
                report.attempted()
            ),
        );
    }

    async fn handle_set_mode(
        &mut self,
        mode: ModeName,
        enabled: bool,
    ) -> Result<ModeSet, SupervisorError> {
        if self.destroyed {
            return Err(SupervisorError::Destroyed);
        }
        let Some(effector) = self.effector() else {
            return Err(SupervisorError::Unsupported {
                operation: "modes",
                kind: self.kind(),
            });
        };

        // Offline changes are only recorded and applied on the next connect.
        if let Some(handle) = self.live_handle() {
            let ctx = self.effector_context(&handle);
            if enabled && !self.active_modes.contains(&mode) {
                if let Err(e) = effector.activate(mode, &ctx).await {
                    self.log(LogLevel::Warning, format!("Failed to enable {mode}: {e}"));
                    if self.config.modes.set(mode, false) {
                        self.persist(ConfigPatch::modes(self.config.modes.clone()));
                    }
                    return Err(SupervisorError::ModeActivation {
                        mode,
                        reason: e.to_string(),
                    });
                }
                self.active_modes.insert(mode);
            } else if !enabled && self.active_modes.remove(&mode) {
                if let Err(e) = effector.deactivate(mode, &ctx).await {
                    warn!(instance_id = %self.id(), mode = %mode, error = %e, "Mode did not stop cleanly");
                }
            }
            if mode == ModeName::AutoChat {
                if enabled {
                    self.start_auto_chat();
                } else {
                    self.timers.cancel(TimerKind::AutoChat);
                }
            }
        }

        if self.config.modes.set(mode, enabled) {
            self.persist(ConfigPatch::modes(self.config.modes.clone()));
            let verb = if enabled { "enabled" } else { "disabled" };
            self.log(LogLevel::Info, format!("Mode {mode} {verb}"));
        }
        Ok(self.config.modes.clone())
    }

    async fn handle_stop_all_modes(&mut self) -> Result<ModeSet, SupervisorError> {
        if self.destroyed {
            return Err(SupervisorError::Destroyed);
        }
        let Some(effector) = self.effector() else {
            return Err(SupervisorError::Unsupported {
                operation: "modes",
                kind: self.kind(),
            });
        };

        let active = std::mem::take(&mut self.active_modes);
        if let Some(handle) = self.live_handle() {
            let ctx = self.effector_context(&handle);
            for mode in active {
                if let Err(e) = effector.deactivate(mode, &ctx).await {
                    warn!(instance_id = %self.id(), mode = %mode, error = %e, "Mode did not stop cleanly");
                }
            }
        }
        self.timers.cancel(TimerKind::AutoChat);

        let stopped = self.config.modes.disable_all();
        if !stopped.is_empty() {
            self.persist(ConfigPatch::modes(self.config.modes.clone()));
            self.log(LogLevel::Info, format!("Stopped {} modes", stopped.len()));
        }
        Ok(self.config.modes.clone())
    }

    // =========================================================================
    // Commands, auto-chat and restart schedule
    // =========================================================================

    async fn handle_send_command(&mut self, text: String) -> Result<(), SupervisorError> {
        if self.destroyed {
            return Err(SupervisorError::Destroyed);
        }
        let handle = self.live_handle().ok_or(SupervisorError::NotConnected)?;
        handle.send(&text).await?;
        self.activity.record_activity();
        self.log(LogLevel::Info, format!("> {text}"));
        Ok(())
    }

    /// Sends through the session when possible, otherwise through remote
    /// management.
    async fn send_with_fallback(&mut self, text: &str) -> Result<(), SupervisorError> {
        if let Some(handle) = self.live_handle() {
            match handle.send(text).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(instance_id = %self.id(), error = %e, "Session send failed, trying remote");
                }
            }
        }
        self.deps
            .remote
            .send_command(&self.config.id, text)
            .await
            .map_err(SupervisorError::from)
    }

    fn start_auto_chat(&mut self) {
        let generation = self.generation;
        self.timers.schedule_every(
            TimerKind::AutoChat,
            self.config.auto_chat.interval(),
            &self.mailbox,
            move || InstanceMessage::AutoChatTick { generation },
        );
    }

    async fn on_auto_chat_tick(&mut self) {
        if !self.config.modes.is_enabled(ModeName::AutoChat) {
            return;
        }
        let Some(handle) = self.live_handle() else {
            return;
        };
        let Some(message) = self.config.auto_chat.pick_message().map(str::to_owned) else {
            debug!(instance_id = %self.id(), "Auto-chat has no messages");
            return;
        };
        match handle.send(&message).await {
            Ok(()) => self.log(LogLevel::Chat, format!("[auto] {message}")),
            Err(e) => self.log(LogLevel::Warning, format!("Auto-chat send failed: {e}")),
        }
    }

    async fn handle_set_auto_chat(&mut self, config: AutoChatConfig) -> Result<(), SupervisorError> {
        if self.destroyed {
            return Err(SupervisorError::Destroyed);
        }
        if self.effector().is_none() {
            return Err(SupervisorError::Unsupported {
                operation: "auto-chat",
                kind: self.kind(),
            });
        }
        self.config.auto_chat = config.clone();
        self.persist(ConfigPatch {
            auto_chat: Some(config),
            ..Default::default()
        });
        if self.timers.is_armed(TimerKind::AutoChat) {
            self.start_auto_chat();
        }
        self.log(
            LogLevel::Info,
            format!(
                "Auto-chat set to {} messages every {}s",
                self.config.auto_chat.messages.len(),
                self.config.auto_chat.interval().as_secs()
            ),
        );
        Ok(())
    }

    fn restart_interval(&self) -> Option<Duration> {
        self.config
            .restart_interval_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
    }

    fn arm_restart_schedule(&mut self) {
        let Some(interval) = self.restart_interval() else {
            self.timers.cancel(TimerKind::RestartSchedule);
            self.next_restart_at = None;
            return;
        };
        if !self.state.is_connected() {
            return;
        }
        let generation = self.generation;
        self.timers.schedule_every(
            TimerKind::RestartSchedule,
            interval,
            &self.mailbox,
            move || InstanceMessage::RestartTick { generation },
        );
        self.next_restart_at = from_now(interval);
    }

    async fn on_restart_tick(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        match self.send_with_fallback(RESTART_COMMAND).await {
            Ok(()) => self.log(LogLevel::Info, "Scheduled restart sent"),
            Err(e) => self.log(LogLevel::Warning, format!("Scheduled restart failed: {e}")),
        }
        self.next_restart_at = self.restart_interval().and_then(from_now);
    }

    async fn handle_set_restart_schedule(
        &mut self,
        minutes: Option<u32>,
    ) -> Result<(), SupervisorError> {
        if self.destroyed {
            return Err(SupervisorError::Destroyed);
        }
        let minutes = minutes.filter(|m| *m > 0);
        self.config.restart_interval_minutes = minutes;
        self.persist(ConfigPatch {
            restart_interval_minutes: Some(minutes),
            ..Default::default()
        });
        self.arm_restart_schedule();
        match minutes {
            Some(m) => self.log(LogLevel::Info, format!("Restart scheduled every {m} minutes")),
            None => self.log(LogLevel::Info, "Restart schedule cleared"),
        }
        Ok(())
    }

    async fn handle_grant_operator(&mut self) -> Result<(), SupervisorError> {
        if self.destroyed {
            return Err(SupervisorError::Destroyed);
        }
        if self.effector().is_none() {
            return Err(SupervisorError::Unsupported {
                operation: "grant_operator",
                kind: self.kind(),
            });
        }
        let username = self
            .config
            .username
            .clone()
            .ok_or(SupervisorError::MissingIdentity)?;
        self.deps
            .remote
            .send_command(&self.config.id, &format!("op {username}"))
            .await?;
        self.log(LogLevel::Success, format!("Granted operator to {username}"));
        Ok(())
    }

    async fn handle_power_signal(&mut self, signal: PowerSignal) -> Result<(), SupervisorError> {
        if self.destroyed {
            return Err(SupervisorError::Destroyed);
        }
        self.deps
            .remote
            .send_power_signal(&self.config.id, signal)
            .await?;
        self.log(LogLevel::Info, format!("Power signal {signal} sent"));
        Ok(())
    }

    fn handle_reconfigure(&mut self, patch: ConfigPatch) {
        self.config.apply(&patch);
        if patch.auto_chat.is_some() && self.timers.is_armed(TimerKind::AutoChat) {
            self.start_auto_chat();
        }
        if patch.restart_interval_minutes.is_some() {
            self.arm_restart_schedule();
        }
        debug!(instance_id = %self.id(), "Instance reconfigured");
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    // Replies go out after the snapshot is published so a caller that wakes
    // up on the reply already sees the state it caused.

    fn resolve_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        self.publish();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_waiters(&mut self, error: SupervisorError) {
        if self.waiters.is_empty() {
            return;
        }
        self.publish();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn reply<T>(&mut self, reply: Option<Reply<T>>, result: Result<T, SupervisorError>) {
        if let Some(reply) = reply {
            self.publish();
            let _ = reply.send(result);
        }
    }

    fn persist(&self, patch: ConfigPatch) {
        match self.deps.roster.save_instance_config(&self.config.id, &patch) {
            Ok(_) => {}
            // Ad-hoc instances are not in the roster.
            Err(RosterError::NotFound(_)) => {
                debug!(instance_id = %self.id(), "Instance not in roster, change kept in memory");
            }
            Err(e) => {
                warn!(instance_id = %self.id(), error = %e, "Failed to persist instance config");
            }
        }
    }

    /// Writes to the instance ring, the global ring and the tracing log.
    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let instance_id = self.id();
        match level {
            LogLevel::Error => error!(instance_id = %instance_id, "{message}"),
            LogLevel::Warning => warn!(instance_id = %instance_id, "{message}"),
            LogLevel::Chat => debug!(instance_id = %instance_id, "{message}"),
            LogLevel::Info | LogLevel::Success => info!(instance_id = %instance_id, "{message}"),
        }
        let entry = self.deps.broadcaster.log(Some(instance_id), level, message);
        lock_logs(&self.logs).push(entry);
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            id: self.config.id.clone(),
            display_name: self.config.display_name(),
            kind: self.kind(),
            state: self.state,
            connected: self.state.is_connected(),
            address: self.config.address(),
            username: self.config.username.clone(),
            telemetry: self.telemetry.clone(),
            baseline: self.baseline,
            modes: self.config.modes.clone(),
            retry: self.retry.view(),
            restart_schedule: self.config.restart_interval_minutes.filter(|m| *m > 0).map(
                |interval_minutes| RestartScheduleView {
                    interval_minutes,
                    next_restart_at: self.next_restart_at,
                },
            ),
            connected_at: self.connected_at,
            last_activity_at: self.activity.last_activity_at(),
            updated_at: Utc::now(),
        }
    }

    /// Refreshes the watched snapshot and broadcasts it when something other
    /// than timestamps changed.
    fn publish(&mut self) {
        let mut next = self.snapshot();
        let changed = {
            let previous = self.status_tx.borrow();
            let mut probe = next.clone();
            probe.last_activity_at = previous.last_activity_at;
            let changed = !previous.same_content(&probe);
            if !changed {
                next.updated_at = previous.updated_at;
            }
            changed
        };
        self.status_tx.send_replace(next.clone());
        if changed {
            self.deps.broadcaster.publish_status(&next);
        }
    }
}

fn from_now(delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .map(|d| Utc::now() + d)
}

async fn pump_events(
    mut events: EventSubscription,
    mailbox: ActorHandle<InstanceMessage>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        if mailbox
            .send(InstanceMessage::Event { generation, event })
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = mailbox
        .send(InstanceMessage::EventsEnded { generation })
        .await;
}

// =============================================================================
// Actor Implementation
// =============================================================================

#[async_trait]
impl Actor for InstanceActor {
    type Message = InstanceMessage;

    fn name(&self) -> &str {
        "instance"
    }

    async fn handle(
        &mut self,
        msg: InstanceMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        let mut keep_running = true;

        match msg {
            InstanceMessage::Connect { reply } => self.handle_connect(reply).await,
            InstanceMessage::Disconnect { reply } => {
                self.handle_disconnect().await;
                if let Some(reply) = reply {
                    self.publish();
                    let _ = reply.send(());
                }
                keep_running = false;
            }
            InstanceMessage::Restart { reply } => {
                let result = self.handle_restart().await;
                self.reply(reply, result);
            }
            InstanceMessage::Repair { reason } => {
                self.repair(&format!("repair requested: {reason}")).await;
            }
            InstanceMessage::SetMode {
                mode,
                enabled,
                reply,
            } => {
                let result = self.handle_set_mode(mode, enabled).await;
                self.reply(Some(reply), result);
            }
            InstanceMessage::StopAllModes { reply } => {
                let result = self.handle_stop_all_modes().await;
                self.reply(Some(reply), result);
            }
            InstanceMessage::SendCommand { text, reply } => {
                let result = self.handle_send_command(text).await;
                self.reply(Some(reply), result);
            }
            InstanceMessage::SetAutoChat { config, reply } => {
                let result = self.handle_set_auto_chat(config).await;
                self.reply(Some(reply), result);
            }
            InstanceMessage::SetRestartSchedule { minutes, reply } => {
                let result = self.handle_set_restart_schedule(minutes).await;
                self.reply(Some(reply), result);
            }
            InstanceMessage::GrantOperator { reply } => {
                let result = self.handle_grant_operator().await;
                self.reply(Some(reply), result);
            }
            InstanceMessage::PowerSignal { signal, reply } => {
                let result = self.handle_power_signal(signal).await;
                self.reply(Some(reply), result);
            }
            InstanceMessage::Reconfigure { patch } => self.handle_reconfigure(patch),

            InstanceMessage::GraceElapsed { generation } => {
                if self.is_current(generation) && self.state == ConnectionState::Connecting {
                    self.open_session();
                }
            }
            InstanceMessage::Opened { generation, result } => {
                self.handle_opened(generation, result).await;
            }
            InstanceMessage::Event { generation, event } => {
                if self.is_current(generation) {
                    self.handle_event(event).await;
                }
            }
            InstanceMessage::EventsEnded { generation } => {
                if self.is_current(generation) {
                    self.repair("event stream ended").await;
                }
            }
            InstanceMessage::ConnectTimeout { generation } => {
                if self.is_current(generation) && self.state == ConnectionState::Connecting {
                    let timeout = self.deps.timings.connect_timeout;
                    self.log(
                        LogLevel::Warning,
                        format!("Connection not ready after {}s", timeout.as_secs()),
                    );
                    self.attempt_repair(
                        "connect timeout".to_string(),
                        SupervisorError::Timeout(timeout),
                    )
                    .await;
                }
            }
            InstanceMessage::ReconnectDue { generation } => {
                if self.is_current(generation) && self.state == ConnectionState::Repairing {
                    info!(
                        instance_id = %self.id(),
                        attempt = self.retry.attempt_count,
                        "Reconnecting"
                    );
                    self.begin_attempt().await;
                }
            }
            InstanceMessage::SettleElapsed { generation } => {
                if self.is_current(generation) {
                    self.restore_after_settle().await;
                }
            }
            InstanceMessage::ActivityCheck { generation } => {
                if self.is_current(generation)
                    && self.state.is_connected()
                    && self.activity.check()
                {
                    let idle = self.activity.idle_for().as_secs();
                    self.log(
                        LogLevel::Warning,
                        format!("No activity for {idle}s, repairing"),
                    );
                    self.repair("stuck").await;
                }
            }
            InstanceMessage::AutoChatTick { generation } => {
                if self.is_current(generation) {
                    self.on_auto_chat_tick().await;
                }
            }
            InstanceMessage::RestartTick { generation } => {
                if self.is_current(generation) {
                    self.on_restart_tick().await;
                }
            }
            InstanceMessage::ProbeDue { generation } => {
                if self.is_current(generation) && self.state.is_connected() {
                    self.start_probe();
                }
            }
            InstanceMessage::ProbeFinished { generation, result } => {
                if self.is_current(generation) {
                    self.handle_probe_finished(result).await;
                }
            }
        }

        self.publish();
        Ok(keep_running)
    }

    async fn on_start(&mut self, ctx: &mut ActorContext) -> Result<(), ActorError> {
        debug!(
            actor_id = %ctx.actor_id,
            instance_id = %self.id(),
            kind = %self.kind(),
            "Instance actor started"
        );
        Ok(())
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext) {
        if !self.destroyed {
            self.destroyed = true;
            self.teardown("supervisor stopped").await;
            self.fail_waiters(SupervisorError::Destroyed);
            self.publish();
        }
        debug!(actor_id = %ctx.actor_id, instance_id = %self.id(), "Instance actor stopped");
    }

    fn on_crash(&mut self, error: &ActorError) {
        error!(instance_id = %self.id(), error = %error, "Instance actor error");
    }
}

// =============================================================================
// Tests
// =============================================================================

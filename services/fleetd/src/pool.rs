//! Instance pool - registry of instance supervisors.
//!
//! The pool:
//! - Creates a supervisor per instance, choosing the driver from its kind
//! - Routes operations to the owning supervisor
//! - Aggregates per-instance status into a fleet-wide summary
//! - Persists the roster and rebuilds the fleet from it at startup
//!
//! The registry is only mutated by the pool's add/remove/recreate paths.
//! Supervisors never see their siblings.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_events::{
    AggregateStatus, FleetEvent, InstanceKind, LogEntry, ModeName, ModeSet, StatusSnapshot,
};
use fleet_id::InstanceId;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::actors::{
    lock_logs, spawn_instance, ActorHandle, ActorRef, InstanceDeps, InstanceDriver,
    InstanceMessage, SpawnedInstance,
};
use crate::broadcast::StatusBroadcaster;
use crate::config::SupervisorTimings;
use crate::connection::{Connector, Prober};
use crate::error::{PoolError, SupervisorError};
use crate::logs::LogRing;
use crate::modes::ModeEffector;
use crate::reconnect::ReconnectPolicy;
use crate::remote::{PowerSignal, RemoteManagement};
use crate::roster::{AutoChatConfig, ConfigPatch, InstanceConfig, RosterError, RosterStore};

/// Time an actor gets to finish after its final teardown.
const ACTOR_STOP_GRACE: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<Result<T, SupervisorError>>;

/// Collaborators shared by every supervisor in the pool.
#[derive(Clone)]
pub struct PoolDeps {
    pub connector: Arc<dyn Connector>,
    pub prober: Arc<dyn Prober>,
    pub effector: Arc<dyn ModeEffector>,
    pub remote: Arc<dyn RemoteManagement>,
    pub roster: Arc<dyn RosterStore>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub timings: SupervisorTimings,
}

/// Options of the legacy single-instance connect path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SingleConnectOptions {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// One registered supervisor.
struct PoolEntry {
    /// Registration order, used for aggregation.
    seq: u64,
    /// Config the supervisor was created from, kept current by the pool.
    config: InstanceConfig,
    handle: ActorHandle<InstanceMessage>,
    actor: ActorRef,
    status: watch::Receiver<StatusSnapshot>,
    logs: Arc<Mutex<LogRing>>,
}

impl PoolEntry {
    fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Config to rebuild the supervisor from, with the live mode set.
    fn current_config(&self) -> InstanceConfig {
        let mut config = self.config.clone();
        config.modes = self.status.borrow().modes.clone();
        config
    }
}

/// Registry of instance supervisors keyed by id.
pub struct InstancePool {
    deps: PoolDeps,
    instances: RwLock<HashMap<InstanceId, PoolEntry>>,
    next_seq: AtomicU64,
}

impl InstancePool {
    pub fn new(deps: PoolDeps) -> Self {
        Self {
            deps,
            instances: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.deps.broadcaster
    }

    /// Event stream of status, aggregate and log events.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.deps.broadcaster.subscribe()
    }

    /// Newest `limit` entries of the global log.
    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        self.deps.broadcaster.recent_logs(limit)
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Ids in registration order.
    pub async fn instance_ids(&self) -> Vec<InstanceId> {
        let instances = self.instances.read().await;
        let mut entries: Vec<_> = instances.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Builds a supervisor for every roster entry, then asks each
    /// auto-connect instance to connect without waiting for any of them.
    ///
    /// Returns the number of instances loaded.
    pub async fn start(&self) -> Result<usize, PoolError> {
        let configs = self.deps.roster.load_roster()?;
        info!(count = configs.len(), "Loading roster");

        let mut to_connect = Vec::new();
        {
            let mut instances = self.instances.write().await;
            for config in configs {
                if instances.contains_key(&config.id) {
                    warn!(instance_id = %config.id, "Duplicate roster entry skipped");
                    continue;
                }
                let auto_connect = config.auto_connect;
                let entry = self.spawn_entry(config, ReconnectPolicy::fleet());
                if auto_connect {
                    to_connect.push((entry.config.id.clone(), entry.handle.clone()));
                }
                instances.insert(entry.config.id.clone(), entry);
            }
        }

        let loaded = self.len().await;
        for (id, handle) in to_connect {
            // Mailboxes are empty here, so this only fails for a dead actor.
            if let Err(e) = handle.try_send(InstanceMessage::Connect { reply: None }) {
                warn!(instance_id = %id, error = %e, "Failed to trigger startup connect");
            }
        }

        info!(instances = loaded, "Instance pool started");
        Ok(loaded)
    }

    fn spawn_entry(&self, config: InstanceConfig, policy: ReconnectPolicy) -> PoolEntry {
        let driver = match config.kind {
            InstanceKind::Full => InstanceDriver::Session {
                connector: Arc::clone(&self.deps.connector),
                effector: Arc::clone(&self.deps.effector),
            },
            InstanceKind::StatusOnly => InstanceDriver::Probe {
                prober: Arc::clone(&self.deps.prober),
            },
        };
        let deps = InstanceDeps {
            remote: Arc::clone(&self.deps.remote),
            roster: Arc::clone(&self.deps.roster),
            broadcaster: Arc::clone(&self.deps.broadcaster),
            timings: self.deps.timings.clone(),
        };

        debug!(instance_id = %config.id, kind = %config.kind, "Creating supervisor");
        let SpawnedInstance {
            handle,
            actor,
            status,
            logs,
        } = spawn_instance(config.clone(), driver, policy, deps);

        PoolEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            config,
            handle,
            actor,
            status,
            logs,
        }
    }

    // =========================================================================
    // Add / remove
    // =========================================================================

    /// Adds an instance and starts connecting it.
    ///
    /// Returns the current status without waiting for the connection. An id
    /// that is already registered is reconnected instead of recreated, so
    /// its retry state and modes carry over.
    pub async fn add_instance(&self, mut config: InstanceConfig) -> Result<StatusSnapshot, PoolError> {
        config.target()?;

        let mut instances = self.instances.write().await;
        if let Some(entry) = instances.get(&config.id) {
            let status = entry.snapshot();
            let handle = entry.handle.clone();
            drop(instances);

            if !status.connected {
                info!(instance_id = %config.id, state = %status.state, "Instance exists, reconnecting");
                if handle
                    .send(InstanceMessage::Connect { reply: None })
                    .await
                    .is_err()
                {
                    return Err(PoolError::Unavailable(config.id));
                }
            }
            return Ok(status);
        }

        config.ensure_identity();
        self.persist_new(&config);

        let entry = self.spawn_entry(config, ReconnectPolicy::fleet());
        let id = entry.config.id.clone();
        let handle = entry.handle.clone();
        let status = entry.snapshot();
        instances.insert(id.clone(), entry);
        drop(instances);

        info!(instance_id = %id, kind = %status.kind, "Instance added");
        self.deps.broadcaster.publish_status(&status);
        if handle
            .send(InstanceMessage::Connect { reply: None })
            .await
            .is_err()
        {
            return Err(PoolError::Unavailable(id));
        }
        Ok(status)
    }

    /// Disconnects an instance for good and forgets it.
    pub async fn remove_instance(&self, id: &InstanceId) -> Result<(), PoolError> {
        let entry = self
            .instances
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PoolError::NotFound(id.clone()))?;

        stop_entry(id, entry, self.deps.timings.disconnect_timeout).await;

        match self.deps.roster.remove_instance(id) {
            Ok(true) => {}
            Ok(false) => debug!(instance_id = %id, "Removed instance had no roster entry"),
            Err(e) => warn!(instance_id = %id, error = %e, "Failed to remove roster entry"),
        }

        self.deps.broadcaster.publish_removed(id);
        info!(instance_id = %id, "Instance removed");
        Ok(())
    }

    /// Removes every instance. Returns how many were removed.
    pub async fn disconnect_all(&self) -> usize {
        let ids = self.instance_ids().await;
        let mut removed = 0;
        for id in ids {
            match self.remove_instance(&id).await {
                Ok(()) => removed += 1,
                Err(e) => debug!(instance_id = %id, error = %e, "Instance already gone"),
            }
        }
        removed
    }

    fn persist_new(&self, config: &InstanceConfig) {
        // The legacy instance is ad hoc and never stored.
        if config.id.is_legacy_default() {
            return;
        }
        if let Err(e) = self.deps.roster.upsert_instance(config) {
            warn!(instance_id = %config.id, error = %e, "Failed to persist instance");
        }
    }

    fn persist_patch(&self, id: &InstanceId, patch: &ConfigPatch) {
        match self.deps.roster.save_instance_config(id, patch) {
            Ok(_) => {}
            Err(RosterError::NotFound(_)) => {
                debug!(instance_id = %id, "Instance not in roster, change kept in memory");
            }
            Err(e) => warn!(instance_id = %id, error = %e, "Failed to persist instance config"),
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn get_status(&self, id: &InstanceId) -> Result<StatusSnapshot, PoolError> {
        self.instances
            .read()
            .await
            .get(id)
            .map(PoolEntry::snapshot)
            .ok_or_else(|| PoolError::NotFound(id.clone()))
    }

    pub async fn get_all_status(&self) -> BTreeMap<InstanceId, StatusSnapshot> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot()))
            .collect()
    }

    /// Fleet-wide summary. Reads snapshots only.
    pub async fn get_aggregate_status(&self) -> AggregateStatus {
        let instances = self.instances.read().await;
        let mut entries: Vec<_> = instances.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        let snapshots: Vec<_> = entries.iter().map(|entry| entry.snapshot()).collect();
        AggregateStatus::from_snapshots(&snapshots)
    }

    /// Republishes the aggregate whenever an instance changes.
    pub fn spawn_aggregate_relay(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(FleetEvent::InstanceStatus { .. } | FleetEvent::InstanceRemoved { .. }) => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Aggregate relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let aggregate = pool.get_aggregate_status().await;
                pool.deps.broadcaster.publish_aggregate(aggregate);
            }
            debug!("Aggregate relay stopped");
        })
    }

    // =========================================================================
    // Connection control
    // =========================================================================

    async fn handle(&self, id: &InstanceId) -> Result<ActorHandle<InstanceMessage>, PoolError> {
        self.instances
            .read()
            .await
            .get(id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| PoolError::NotFound(id.clone()))
    }

    async fn request<T>(
        &self,
        id: &InstanceId,
        make: impl FnOnce(Reply<T>) -> InstanceMessage,
    ) -> Result<T, PoolError> {
        let handle = self.handle(id).await?;
        let (tx, rx) = oneshot::channel();
        handle
            .send(make(tx))
            .await
            .map_err(|_| PoolError::Unavailable(id.clone()))?;
        rx.await
            .map_err(|_| PoolError::Unavailable(id.clone()))?
            .map_err(|e| PoolError::supervisor(id, e))
    }

    async fn notify(&self, id: &InstanceId, msg: InstanceMessage) -> Result<(), PoolError> {
        self.handle(id)
            .await?
            .send(msg)
            .await
            .map_err(|_| PoolError::Unavailable(id.clone()))
    }

    /// Connects and waits until the instance is ready.
    pub async fn connect_instance(&self, id: &InstanceId) -> Result<StatusSnapshot, PoolError> {
        self.request(id, |reply| InstanceMessage::Connect { reply: Some(reply) })
            .await?;
        self.get_status(id).await
    }

    /// Asks every instance that is not connected to connect. Returns how
    /// many were asked.
    pub async fn connect_all(&self) -> usize {
        let targets: Vec<_> = self
            .instances
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !entry.status.borrow().connected)
            .map(|(id, entry)| (id.clone(), entry.handle.clone()))
            .collect();

        let mut asked = 0;
        for (id, handle) in targets {
            match handle.send(InstanceMessage::Connect { reply: None }).await {
                Ok(()) => asked += 1,
                Err(e) => warn!(instance_id = %id, error = %e, "Failed to request connect"),
            }
        }
        asked
    }

    pub async fn restart(&self, id: &InstanceId) -> Result<(), PoolError> {
        self.request(id, |reply| InstanceMessage::Restart { reply: Some(reply) })
            .await
    }

    pub async fn repair(&self, id: &InstanceId, reason: impl Into<String>) -> Result<(), PoolError> {
        self.notify(
            id,
            InstanceMessage::Repair {
                reason: reason.into(),
            },
        )
        .await
    }

    /// Legacy single-instance connect: replaces any `default` instance with
    /// a full supervisor under the exponential policy and waits until it is
    /// connected.
    pub async fn connect_single(
        &self,
        options: SingleConnectOptions,
    ) -> Result<StatusSnapshot, PoolError> {
        let id = InstanceId::legacy_default();
        let mut config = InstanceConfig::new(id.clone(), InstanceKind::Full, options.host, options.port);
        config.username = options.username;
        config.credentials = options.credentials;
        config.version = options.version;
        config.auto_connect = false;
        config.target()?;
        config.ensure_identity();

        let previous = self.instances.write().await.remove(&id);
        if let Some(previous) = previous {
            info!("Replacing existing single instance");
            stop_entry(&id, previous, self.deps.timings.disconnect_timeout).await;
        }

        let entry = self.spawn_entry(config, ReconnectPolicy::legacy());
        self.instances.write().await.insert(id.clone(), entry);
        self.connect_instance(&id).await
    }

    // =========================================================================
    // Modes and commands
    // =========================================================================

    pub async fn set_mode(
        &self,
        id: &InstanceId,
        mode: ModeName,
        enabled: bool,
    ) -> Result<ModeSet, PoolError> {
        let modes = self
            .request(id, |reply| InstanceMessage::SetMode {
                mode,
                enabled,
                reply,
            })
            .await?;
        self.update_entry(id, |config| config.modes = modes.clone())
            .await;
        Ok(modes)
    }

    pub async fn stop_all_modes(&self, id: &InstanceId) -> Result<ModeSet, PoolError> {
        let modes = self
            .request(id, |reply| InstanceMessage::StopAllModes { reply })
            .await?;
        self.update_entry(id, |config| config.modes = modes.clone())
            .await;
        Ok(modes)
    }

    pub async fn send_command(&self, id: &InstanceId, text: impl Into<String>) -> Result<(), PoolError> {
        let text = text.into();
        self.request(id, |reply| InstanceMessage::SendCommand { text, reply })
            .await
    }

    pub async fn send_power_signal(
        &self,
        id: &InstanceId,
        signal: PowerSignal,
    ) -> Result<(), PoolError> {
        self.request(id, |reply| InstanceMessage::PowerSignal { signal, reply })
            .await
    }

    pub async fn grant_operator(&self, id: &InstanceId) -> Result<(), PoolError> {
        self.request(id, |reply| InstanceMessage::GrantOperator { reply })
            .await
    }

    pub async fn set_auto_chat(
        &self,
        id: &InstanceId,
        auto_chat: AutoChatConfig,
    ) -> Result<(), PoolError> {
        let config = auto_chat.clone();
        self.request(id, |reply| InstanceMessage::SetAutoChat { config, reply })
            .await?;
        self.update_entry(id, |config| config.auto_chat = auto_chat)
            .await;
        Ok(())
    }

    pub async fn set_restart_schedule(
        &self,
        id: &InstanceId,
        minutes: Option<u32>,
    ) -> Result<(), PoolError> {
        self.request(id, |reply| InstanceMessage::SetRestartSchedule { minutes, reply })
            .await?;
        self.update_entry(id, |config| {
            config.restart_interval_minutes = minutes.filter(|m| *m > 0);
        })
        .await;
        Ok(())
    }

    /// Newest `limit` entries of one instance's log.
    pub async fn logs(&self, id: &InstanceId, limit: usize) -> Result<Vec<LogEntry>, PoolError> {
        let instances = self.instances.read().await;
        let entry = instances
            .get(id)
            .ok_or_else(|| PoolError::NotFound(id.clone()))?;
        let recent = lock_logs(&entry.logs).recent(limit);
        Ok(recent)
    }

    pub async fn clear_logs(&self, id: &InstanceId) -> Result<(), PoolError> {
        let instances = self.instances.read().await;
        let entry = instances
            .get(id)
            .ok_or_else(|| PoolError::NotFound(id.clone()))?;
        lock_logs(&entry.logs).clear();
        Ok(())
    }

    async fn update_entry(&self, id: &InstanceId, update: impl FnOnce(&mut InstanceConfig)) {
        if let Some(entry) = self.instances.write().await.get_mut(id) {
            update(&mut entry.config);
        }
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    /// Persists `patch` and applies it.
    ///
    /// Changes to how the instance connects rebuild its supervisor; a
    /// supervisor that was connected or trying to connect is reconnected.
    pub async fn update_instance_config(
        &self,
        id: &InstanceId,
        patch: ConfigPatch,
    ) -> Result<StatusSnapshot, PoolError> {
        let mut config = {
            let instances = self.instances.read().await;
            instances
                .get(id)
                .map(PoolEntry::current_config)
                .ok_or_else(|| PoolError::NotFound(id.clone()))?
        };
        config.apply(&patch);
        config.target()?;

        if patch.affects_connection() {
            config.ensure_identity();
            let mut persisted = patch.clone();
            persisted.username = config.username.clone();
            self.persist_patch(id, &persisted);
            return self.recreate(id, config).await;
        }

        self.persist_patch(id, &patch);
        self.notify(id, InstanceMessage::Reconfigure { patch })
            .await?;
        self.update_entry(id, |entry| *entry = config).await;
        self.get_status(id).await
    }

    /// Rebuilds an instance as the other supervisor variant.
    pub async fn switch_kind(
        &self,
        id: &InstanceId,
        kind: InstanceKind,
    ) -> Result<StatusSnapshot, PoolError> {
        let current = self.get_status(id).await?;
        if current.kind == kind {
            return Ok(current);
        }
        self.update_instance_config(
            id,
            ConfigPatch {
                kind: Some(kind),
                ..Default::default()
            },
        )
        .await
    }

    /// Replaces the supervisor of `id` with one built from `config`.
    async fn recreate(
        &self,
        id: &InstanceId,
        config: InstanceConfig,
    ) -> Result<StatusSnapshot, PoolError> {
        let previous = self
            .instances
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PoolError::NotFound(id.clone()))?;
        let previous_state = previous.snapshot().state;
        let policy = if id.is_legacy_default() {
            ReconnectPolicy::legacy()
        } else {
            ReconnectPolicy::fleet()
        };
        stop_entry(id, previous, self.deps.timings.disconnect_timeout).await;

        let entry = self.spawn_entry(config, policy);
        let handle = entry.handle.clone();
        let status = entry.snapshot();
        self.instances.write().await.insert(id.clone(), entry);
        self.deps.broadcaster.publish_status(&status);
        info!(instance_id = %id, kind = %status.kind, "Supervisor rebuilt");

        if previous_state.is_connected() || previous_state.is_in_flight() {
            handle
                .send(InstanceMessage::Connect { reply: None })
                .await
                .map_err(|_| PoolError::Unavailable(id.clone()))?;
        }
        Ok(status)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Destroys every supervisor. Roster entries are kept.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.instances.write().await.drain().collect();
        info!(instances = entries.len(), "Shutting down instance pool");

        let timeout = self.deps.timings.disconnect_timeout;
        let mut stops = JoinSet::new();
        for (id, entry) in entries {
            stops.spawn(async move { stop_entry(&id, entry, timeout).await });
        }
        while stops.join_next().await.is_some() {}

        info!("Instance pool shutdown complete");
    }
}

/// Sends the final disconnect and waits for the actor to finish.
async fn stop_entry(id: &InstanceId, entry: PoolEntry, timeout: Duration) {
    let (tx, rx) = oneshot::channel();
    if entry
        .handle
        .send(InstanceMessage::Disconnect { reply: Some(tx) })
        .await
        .is_ok()
    {
        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => {}
            Err(_) => warn!(instance_id = %id, "Disconnect did not finish in time"),
        }
    }
    entry.actor.shutdown(ACTOR_STOP_GRACE).await;
}

// =============================================================================
// Tests
// =============================================================================

//! Shared harness for the supervisor integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_events::{ConnectionState, InstanceKind, ModeName, StatusSnapshot};
use fleet_id::InstanceId;
use fleet_supervisor::connection::{ConnectTarget, ConnectionError, Connector, OpenedConnection};
use fleet_supervisor::modes::{EffectorContext, EffectorError, ModeEffector};
use fleet_supervisor::remote::UnconfiguredRemote;
use fleet_supervisor::{
    InstanceConfig, InstancePool, MemoryRoster, MockConnector, MockProber, PoolDeps, RosterStore,
    StatusBroadcaster, SupervisorTimings,
};

/// Effector that records what it was asked to do and fails on demand.
#[derive(Default)]
pub struct RecordingEffector {
    failing: Mutex<BTreeSet<ModeName>>,
    activated: Mutex<Vec<ModeName>>,
    deactivated: Mutex<Vec<ModeName>>,
}

impl RecordingEffector {
    pub fn fail(&self, mode: ModeName) {
        self.failing.lock().unwrap().insert(mode);
    }

    pub fn heal(&self, mode: ModeName) {
        self.failing.lock().unwrap().remove(&mode);
    }

    pub fn activations(&self) -> Vec<ModeName> {
        self.activated.lock().unwrap().clone()
    }

    pub fn deactivations(&self) -> Vec<ModeName> {
        self.deactivated.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.activated.lock().unwrap().clear();
        self.deactivated.lock().unwrap().clear();
    }
}

#[async_trait]
impl ModeEffector for RecordingEffector {
    async fn activate(&self, mode: ModeName, _ctx: &EffectorContext) -> Result<(), EffectorError> {
        self.activated.lock().unwrap().push(mode);
        if self.failing.lock().unwrap().contains(&mode) {
            return Err(EffectorError::Failed {
                mode,
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn deactivate(&self, mode: ModeName, _ctx: &EffectorContext) -> Result<(), EffectorError> {
        self.deactivated.lock().unwrap().push(mode);
        Ok(())
    }
}

/// Connector whose first open hangs for `stall` before reaching the mock.
pub struct StalledFirstOpen {
    inner: Arc<MockConnector>,
    stall: Duration,
    stalled: AtomicBool,
}

impl StalledFirstOpen {
    pub fn new(inner: Arc<MockConnector>, stall: Duration) -> Self {
        Self {
            inner,
            stall,
            stalled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connector for StalledFirstOpen {
    async fn open(&self, target: &ConnectTarget) -> Result<OpenedConnection, ConnectionError> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.open(target).await
    }
}

/// A pool wired to mocks.
pub struct Harness {
    pub pool: Arc<InstancePool>,
    pub connector: Arc<MockConnector>,
    pub prober: Arc<MockProber>,
    pub effector: Arc<RecordingEffector>,
    pub roster: Arc<dyn RosterStore>,
    pub broadcaster: Arc<StatusBroadcaster>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_roster(Arc::new(MemoryRoster::new()))
    }

    pub fn with_roster(roster: Arc<dyn RosterStore>) -> Self {
        Self::build(roster, Arc::new(MockConnector::new()))
    }

    pub fn with_connector(connector: MockConnector) -> Self {
        Self::build(Arc::new(MemoryRoster::new()), Arc::new(connector))
    }

    pub fn build(roster: Arc<dyn RosterStore>, connector: Arc<MockConnector>) -> Self {
        Self::wrapped(roster, connector.clone(), connector)
    }

    /// Pool that opens through `opener`; `connector` is the mock behind it
    /// and keeps the counters.
    pub fn wrapped(
        roster: Arc<dyn RosterStore>,
        opener: Arc<dyn Connector>,
        connector: Arc<MockConnector>,
    ) -> Self {
        let prober = Arc::new(MockProber::new());
        let effector = Arc::new(RecordingEffector::default());
        let broadcaster = Arc::new(StatusBroadcaster::default());
        let pool = Arc::new(InstancePool::new(PoolDeps {
            connector: opener,
            prober: prober.clone(),
            effector: effector.clone(),
            remote: Arc::new(UnconfiguredRemote),
            roster: roster.clone(),
            broadcaster: broadcaster.clone(),
            timings: SupervisorTimings::default(),
        }));
        Self {
            pool,
            connector,
            prober,
            effector,
            roster,
            broadcaster,
        }
    }
}

pub fn id(raw: &str) -> InstanceId {
    InstanceId::parse(raw).unwrap()
}

/// Full instance `raw` at `{raw}.local`.
pub fn full(raw: &str) -> InstanceConfig {
    InstanceConfig::new(id(raw), InstanceKind::Full, host(raw), None)
}

pub fn status_only(raw: &str) -> InstanceConfig {
    InstanceConfig::new(id(raw), InstanceKind::StatusOnly, host(raw), None)
}

pub fn host(raw: &str) -> String {
    format!("{raw}.local")
}

/// Polls until `check` holds, advancing (paused) time in small steps.
pub async fn wait_for<F>(pool: &InstancePool, id: &InstanceId, what: &str, check: F) -> StatusSnapshot
where
    F: Fn(&StatusSnapshot) -> bool,
{
    for _ in 0..2_000 {
        if let Ok(status) = pool.get_status(id).await {
            if check(&status) {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what} on {id}");
}

pub async fn wait_for_state(pool: &InstancePool, id: &InstanceId, state: ConnectionState) -> StatusSnapshot {
    wait_for(pool, id, state.as_str(), |s| s.state == state).await
}

/// Round-trips a request through the instance mailbox so everything sent
/// before it has been handled.
pub async fn barrier(pool: &InstancePool, id: &InstanceId) {
    let _ = pool.send_command(id, "barrier").await;
}

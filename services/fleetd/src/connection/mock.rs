//! Scripted connector and prober for tests and development.
//!
//! Behavior is chosen per host, so one connector can serve a whole fleet
//! where some instances come up and others do not. The connector keeps
//! per-host counters (opens, currently live handles, peak live handles) so
//! tests can assert that no instance ever held two sessions at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_events::Position;
use fleet_id::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    ConnectTarget, ConnectionError, ConnectionEvent, ConnectionHandle, Connector,
    EventSubscription, OpenedConnection, ProbeOutcome, Prober, EVENT_CHANNEL_CAPACITY,
};

/// What an open against a host does.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Open succeeds; the session reports ready and established at once.
    Ready,
    /// Open fails.
    Refuse(String),
    /// Open succeeds but the session stays silent until events are emitted.
    Silent,
}

#[derive(Debug, Default)]
struct HostStats {
    opens: u64,
    live: i64,
    max_live: i64,
    sent: Vec<String>,
    /// Event sender of the most recently opened session.
    latest: Option<(SessionId, mpsc::Sender<ConnectionEvent>)>,
}

type SharedStats = Arc<Mutex<HashMap<String, HostStats>>>;

fn with_host<R>(stats: &SharedStats, host: &str, f: impl FnOnce(&mut HostStats) -> R) -> R {
    let mut guard = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(guard.entry(host.to_string()).or_default())
}

/// Scripted [`Connector`].
pub struct MockConnector {
    default: MockBehavior,
    host_defaults: Mutex<HashMap<String, MockBehavior>>,
    queued: Mutex<HashMap<String, VecDeque<MockBehavior>>>,
    origin: Option<Position>,
    stats: SharedStats,
}

impl MockConnector {
    /// Every host connects and reports ready.
    pub fn new() -> Self {
        Self::with_default(MockBehavior::Ready)
    }

    /// Every host refuses connections.
    pub fn refusing() -> Self {
        Self::with_default(MockBehavior::Refuse("mock connection refused".to_string()))
    }

    pub fn with_default(default: MockBehavior) -> Self {
        Self {
            default,
            host_defaults: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            origin: Some(Position {
                x: 0.5,
                y: 64.0,
                z: 0.5,
            }),
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the standing behavior of one host.
    pub fn set_host_behavior(&self, host: &str, behavior: MockBehavior) {
        self.host_defaults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(host.to_string(), behavior);
    }

    /// Queues a one-shot behavior used by the next open of `host`.
    pub fn push_behavior(&self, host: &str, behavior: MockBehavior) {
        self.queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(host.to_string())
            .or_default()
            .push_back(behavior);
    }

    /// Number of opens attempted against `host`.
    pub fn open_count(&self, host: &str) -> u64 {
        with_host(&self.stats, host, |s| s.opens)
    }

    /// Handles of `host` opened and not yet closed.
    pub fn live_handles(&self, host: &str) -> i64 {
        with_host(&self.stats, host, |s| s.live)
    }

    /// Highest number of simultaneously live handles seen for `host`.
    pub fn max_live_handles(&self, host: &str) -> i64 {
        with_host(&self.stats, host, |s| s.max_live)
    }

    /// Commands sent through handles of `host`, oldest first.
    pub fn sent_commands(&self, host: &str) -> Vec<String> {
        with_host(&self.stats, host, |s| s.sent.clone())
    }

    /// Delivers an event to the most recently opened session of `host`.
    ///
    /// Returns false if that session is gone.
    pub async fn emit(&self, host: &str, event: ConnectionEvent) -> bool {
        let Some(tx) = with_host(&self.stats, host, |s| s.latest.as_ref().map(|(_, tx)| tx.clone()))
        else {
            return false;
        };
        tx.send(event).await.is_ok()
    }

    fn next_behavior(&self, host: &str) -> MockBehavior {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(host)
            .and_then(VecDeque::pop_front);
        if let Some(behavior) = queued {
            return behavior;
        }
        self.host_defaults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(host)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<OpenedConnection, ConnectionError> {
        let behavior = self.next_behavior(&target.host);
        with_host(&self.stats, &target.host, |s| s.opens += 1);

        if let MockBehavior::Refuse(reason) = &behavior {
            info!(address = %target.address(), reason = %reason, "[MOCK] Refusing connection");
            return Err(ConnectionError::Refused(reason.clone()));
        }

        let (tx, events) = EventSubscription::channel(EVENT_CHANNEL_CAPACITY);
        if behavior == MockBehavior::Ready {
            // Fresh channel, capacity is never exceeded here.
            let _ = tx.try_send(ConnectionEvent::Ready);
            let _ = tx.try_send(ConnectionEvent::Established {
                origin: self.origin,
            });
        }

        let session_id = SessionId::generate();
        with_host(&self.stats, &target.host, |s| {
            s.live += 1;
            s.max_live = s.max_live.max(s.live);
            s.latest = Some((session_id, tx.clone()));
        });

        info!(
            address = %target.address(),
            session_id = %session_id,
            behavior = ?behavior,
            "[MOCK] Opened connection"
        );

        let handle = MockHandle {
            session_id,
            host: target.host.clone(),
            stats: Arc::clone(&self.stats),
            closed: AtomicBool::new(false),
            events_tx: Mutex::new(Some(tx)),
        };

        Ok(OpenedConnection {
            handle: Arc::new(handle),
            events,
        })
    }
}

/// Handle returned by [`MockConnector`].
#[derive(Debug)]
struct MockHandle {
    session_id: SessionId,
    host: String,
    stats: SharedStats,
    closed: AtomicBool,
    /// Keeps the session's event stream open until close.
    events_tx: Mutex<Option<mpsc::Sender<ConnectionEvent>>>,
}

#[async_trait]
impl ConnectionHandle for MockHandle {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    async fn send(&self, command: &str) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        debug!(session_id = %self.session_id, command, "[MOCK] Command sent");
        with_host(&self.stats, &self.host, |s| s.sent.push(command.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.events_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        with_host(&self.stats, &self.host, |s| {
            s.live -= 1;
            if s.latest.as_ref().is_some_and(|(id, _)| *id == self.session_id) {
                s.latest = None;
            }
        });
        debug!(session_id = %self.session_id, "[MOCK] Connection closed");
        Ok(())
    }
}

/// Scripted [`Prober`].
pub struct MockProber {
    reachable_by_default: bool,
    hosts: Mutex<HashMap<String, bool>>,
    probes: Mutex<HashMap<String, u64>>,
    latency: Duration,
}

impl MockProber {
    /// Every host answers.
    pub fn new() -> Self {
        Self {
            reachable_by_default: true,
            hosts: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            latency: Duration::from_millis(12),
        }
    }

    /// No host answers.
    pub fn unreachable() -> Self {
        Self {
            reachable_by_default: false,
            ..Self::new()
        }
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        self.hosts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(host.to_string(), reachable);
    }

    pub fn probe_count(&self, host: &str) -> u64 {
        self.probes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(host)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MockProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for MockProber {
    async fn probe(&self, target: &ConnectTarget) -> Result<ProbeOutcome, ConnectionError> {
        *self
            .probes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(target.host.clone())
            .or_default() += 1;

        let reachable = self
            .hosts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&target.host)
            .copied()
            .unwrap_or(self.reachable_by_default);

        debug!(address = %target.address(), reachable, "[MOCK] Probe");

        if reachable {
            Ok(ProbeOutcome {
                latency: self.latency,
            })
        } else {
            Err(ConnectionError::Refused(format!(
                "{} unreachable",
                target.address()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> ConnectTarget {
        ConnectTarget {
            host: host.to_string(),
            port: 25565,
            username: Some("tester".to_string()),
            credentials: None,
            version: None,
        }
    }

    #[tokio::test]
    async fn test_ready_session_emits_ready_then_established() {
        let connector = MockConnector::new();
        let mut opened = connector.open(&target("a")).await.unwrap();

        assert_eq!(opened.events.recv().await, Some(ConnectionEvent::Ready));
        assert!(matches!(
            opened.events.recv().await,
            Some(ConnectionEvent::Established { origin: Some(_) })
        ));
        assert_eq!(connector.live_handles("a"), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_tracks_live_handles() {
        let connector = MockConnector::new();
        let opened = connector.open(&target("a")).await.unwrap();

        opened.handle.close().await.unwrap();
        opened.handle.close().await.unwrap();

        assert_eq!(connector.live_handles("a"), 0);
        assert_eq!(connector.max_live_handles("a"), 1);
        assert_eq!(
            opened.handle.send("hello").await,
            Err(ConnectionError::Closed)
        );
    }

    #[tokio::test]
    async fn test_queued_behavior_is_used_once() {
        let connector = MockConnector::new();
        connector.push_behavior("a", MockBehavior::Refuse("down".to_string()));

        assert!(connector.open(&target("a")).await.is_err());
        assert!(connector.open(&target("a")).await.is_ok());
        assert_eq!(connector.open_count("a"), 2);
    }

    #[tokio::test]
    async fn test_emit_reaches_latest_session() {
        let connector = MockConnector::with_default(MockBehavior::Silent);
        let mut opened = connector.open(&target("a")).await.unwrap();

        assert!(connector.emit("a", ConnectionEvent::Closed).await);
        assert_eq!(opened.events.recv().await, Some(ConnectionEvent::Closed));

        opened.handle.close().await.unwrap();
        assert!(!connector.emit("a", ConnectionEvent::Closed).await);
    }

    #[tokio::test]
    async fn test_overlapping_sessions_keep_their_own_streams() {
        let connector = MockConnector::with_default(MockBehavior::Silent);
        let mut first = connector.open(&target("a")).await.unwrap();
        let mut second = connector.open(&target("a")).await.unwrap();
        assert_eq!(connector.max_live_handles("a"), 2);

        // Opening the second session must not end the first one's stream.
        assert!(tokio::time::timeout(Duration::from_millis(20), first.events.recv())
            .await
            .is_err());

        // Closing the older session leaves the newer one reachable.
        first.handle.close().await.unwrap();
        assert_eq!(first.events.recv().await, None);
        assert!(connector.emit("a", ConnectionEvent::Closed).await);
        assert_eq!(second.events.recv().await, Some(ConnectionEvent::Closed));

        second.handle.close().await.unwrap();
        assert_eq!(second.events.recv().await, None);
        assert!(!connector.emit("a", ConnectionEvent::Closed).await);
    }

    #[tokio::test]
    async fn test_prober_per_host() {
        let prober = MockProber::new();
        prober.set_reachable("down", false);

        assert!(prober.probe(&target("up")).await.is_ok());
        assert!(prober.probe(&target("down")).await.is_err());
        assert_eq!(prober.probe_count("down"), 1);
    }
}

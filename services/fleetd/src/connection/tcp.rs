//! Plain TCP implementations used by the daemon.
//!
//! `LineConnector` treats the remote as a newline-delimited text stream:
//! the session is ready as soon as the socket connects, every received line
//! is activity, and EOF is a close. `TcpProber` only checks that the port
//! accepts connections.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleet_id::SessionId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    ConnectTarget, ConnectionError, ConnectionEvent, ConnectionHandle, Connector,
    EventSubscription, OpenedConnection, ProbeOutcome, Prober, EVENT_CHANNEL_CAPACITY,
};

/// Newline-delimited TCP connector.
#[derive(Debug, Default)]
pub struct LineConnector;

impl LineConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LineConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<OpenedConnection, ConnectionError> {
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (tx, events) = EventSubscription::channel(EVENT_CHANNEL_CAPACITY);
        let session_id = SessionId::generate();

        let reader = tokio::spawn(async move {
            if tx.send(ConnectionEvent::Ready).await.is_err() {
                return;
            }
            if tx
                .send(ConnectionEvent::Established { origin: None })
                .await
                .is_err()
            {
                return;
            }

            let mut lines = BufReader::new(read_half).lines();
            loop {
                let event = match lines.next_line().await {
                    Ok(Some(line)) => ConnectionEvent::Inbound(line),
                    Ok(None) => ConnectionEvent::Closed,
                    Err(e) => ConnectionEvent::Error(e.to_string()),
                };
                let terminal = !matches!(event, ConnectionEvent::Inbound(_));
                if tx.send(event).await.is_err() || terminal {
                    break;
                }
            }
        });

        debug!(address = %target.address(), session_id = %session_id, "TCP session opened");

        Ok(OpenedConnection {
            handle: Arc::new(LineHandle {
                session_id,
                writer: tokio::sync::Mutex::new(Some(write_half)),
                reader: Mutex::new(Some(reader)),
            }),
            events,
        })
    }
}

#[derive(Debug)]
struct LineHandle {
    session_id: SessionId,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ConnectionHandle for LineHandle {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    async fn send(&self, command: &str) -> Result<(), ConnectionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::Closed)?;
        writer.write_all(command.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

/// Connect-and-close TCP reachability check.
#[derive(Debug, Default)]
pub struct TcpProber;

impl TcpProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: &ConnectTarget) -> Result<ProbeOutcome, ConnectionError> {
        let started = tokio::time::Instant::now();
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        let latency = started.elapsed();
        drop(stream);
        Ok(ProbeOutcome { latency })
    }
}

//! Mode effectors.
//!
//! A mode is a flag in the instance's `ModeSet`; its effector is whatever
//! makes the behavior happen on the live connection. Effectors are an
//! extension point: the daemon ships [`CommandEffector`], tests plug in
//! recording or failing ones.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_events::{ModeName, Position};
use fleet_id::InstanceId;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::remote::RemoteManagement;

/// Failure to switch a mode on or off.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EffectorError {
    #[error("mode {0} needs a fixed username")]
    MissingIdentity(ModeName),

    #[error("mode {mode} failed: {reason}")]
    Failed { mode: ModeName, reason: String },
}

/// What an effector may touch while switching a mode.
#[derive(Clone)]
pub struct EffectorContext {
    pub instance_id: InstanceId,
    pub username: Option<String>,
    pub handle: Arc<dyn ConnectionHandle>,
    pub remote: Arc<dyn RemoteManagement>,
    /// Origin recorded when the session was established.
    pub baseline: Option<Position>,
}

/// Activates and deactivates mode behaviors on a live connection.
#[async_trait]
pub trait ModeEffector: Send + Sync {
    async fn activate(&self, mode: ModeName, ctx: &EffectorContext) -> Result<(), EffectorError>;

    async fn deactivate(&self, mode: ModeName, ctx: &EffectorContext) -> Result<(), EffectorError>;
}

/// Default effector.
///
/// Movement, combat and view modes are driven by the connection client
/// itself and only need acknowledging. Invincibility is a console effect:
/// it is sent through the session first and through remote management when
/// the session cannot run it.
#[derive(Debug, Default)]
pub struct CommandEffector;

impl CommandEffector {
    async fn run_with_fallback(
        &self,
        mode: ModeName,
        command: &str,
        ctx: &EffectorContext,
    ) -> Result<(), EffectorError> {
        match ctx.handle.send(&format!("/{command}")).await {
            Ok(()) => Ok(()),
            Err(session_err) => {
                warn!(
                    instance_id = %ctx.instance_id,
                    mode = %mode,
                    error = %session_err,
                    "Session rejected command, using remote management"
                );
                ctx.remote
                    .send_command(&ctx.instance_id, command)
                    .await
                    .map_err(|remote_err| EffectorError::Failed {
                        mode,
                        reason: format!("session: {session_err}; remote: {remote_err}"),
                    })
            }
        }
    }
}

#[async_trait]
impl ModeEffector for CommandEffector {
    async fn activate(&self, mode: ModeName, ctx: &EffectorContext) -> Result<(), EffectorError> {
        match mode {
            ModeName::Invincible => {
                let username = ctx
                    .username
                    .as_deref()
                    .ok_or(EffectorError::MissingIdentity(mode))?;
                let command = format!("effect give {username} minecraft:resistance infinite 255 true");
                self.run_with_fallback(mode, &command, ctx).await
            }
            ModeName::Patrol if ctx.baseline.is_none() => Err(EffectorError::Failed {
                mode,
                reason: "no patrol origin recorded yet".to_string(),
            }),
            _ => {
                debug!(instance_id = %ctx.instance_id, mode = %mode, "Mode activated");
                Ok(())
            }
        }
    }

    async fn deactivate(&self, mode: ModeName, ctx: &EffectorContext) -> Result<(), EffectorError> {
        match mode {
            ModeName::Invincible => {
                let username = ctx
                    .username
                    .as_deref()
                    .ok_or(EffectorError::MissingIdentity(mode))?;
                let command = format!("effect clear {username} minecraft:resistance");
                self.run_with_fallback(mode, &command, ctx).await
            }
            _ => {
                debug!(instance_id = %ctx.instance_id, mode = %mode, "Mode deactivated");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectTarget, Connector, MockConnector};
    use crate::remote::UnconfiguredRemote;

    async fn context(username: Option<&str>) -> (EffectorContext, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let opened = connector
            .open(&ConnectTarget {
                host: "fx".to_string(),
                port: 25565,
                username: username.map(str::to_string),
                credentials: None,
                version: None,
            })
            .await
            .unwrap();
        let ctx = EffectorContext {
            instance_id: InstanceId::parse("fx").unwrap(),
            username: username.map(str::to_string),
            handle: opened.handle,
            remote: Arc::new(UnconfiguredRemote),
            baseline: None,
        };
        (ctx, connector)
    }

    #[tokio::test]
    async fn test_invincible_sends_effect_through_session() {
        let (ctx, connector) = context(Some("Guard")).await;

        CommandEffector
            .activate(ModeName::Invincible, &ctx)
            .await
            .unwrap();

        let sent = connector.sent_commands("fx");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("/effect give Guard"));
    }

    #[tokio::test]
    async fn test_invincible_without_session_or_remote_fails() {
        let (ctx, _connector) = context(Some("Guard")).await;
        ctx.handle.close().await.unwrap();

        let err = CommandEffector
            .activate(ModeName::Invincible, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EffectorError::Failed { mode: ModeName::Invincible, .. }));
    }

    #[tokio::test]
    async fn test_invincible_needs_username() {
        let (ctx, _connector) = context(None).await;
        assert_eq!(
            CommandEffector.activate(ModeName::Invincible, &ctx).await,
            Err(EffectorError::MissingIdentity(ModeName::Invincible))
        );
    }

    #[tokio::test]
    async fn test_patrol_needs_origin() {
        let (mut ctx, _connector) = context(Some("Guard")).await;
        assert!(CommandEffector.activate(ModeName::Patrol, &ctx).await.is_err());

        ctx.baseline = Some(Position { x: 1.0, y: 2.0, z: 3.0 });
        assert!(CommandEffector.activate(ModeName::Patrol, &ctx).await.is_ok());
    }
}

//! Minimal actor runtime.
//!
//! An actor is a value that owns its state and is driven by a single task
//! reading from a bounded mailbox. Senders hold an [`ActorHandle`]; whoever
//! spawned the actor holds the [`ActorRef`] and decides when it stops.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Anything that can sit in a mailbox.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of an actor. `handle` is never called concurrently.
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    /// Short type name, used as the actor id prefix in logs.
    fn name(&self) -> &str;

    /// Handles one message. `Ok(false)` stops the actor.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Runs once when the loop exits, however it exits.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}

    fn on_crash(&mut self, _error: &ActorError) {}
}

/// Per-actor bookkeeping passed to every callback.
#[derive(Debug)]
pub struct ActorContext {
    pub actor_id: String,
    pub messages_processed: u64,
}

/// Actor failures.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Logged; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// The actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    Stopped,
}

// =============================================================================
// Handles
// =============================================================================

/// Sending side of a mailbox. Cheap to clone.
#[derive(Debug)]
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

/// Receiving side of a mailbox, consumed by [`spawn_actor`].
pub struct Mailbox<M: Message> {
    rx: mpsc::Receiver<M>,
    actor_id: String,
}

impl<M: Message> Mailbox<M> {
    /// Pops a queued message without waiting. Lets tests drive timers
    /// without a running actor.
    pub fn recv_now(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }
}

impl<M: Message> ActorHandle<M> {
    /// Creates the mailbox up front so the actor can be given a handle to
    /// itself before it is spawned.
    pub fn channel(name: &str, capacity: usize) -> (Self, Mailbox<M>) {
        let actor_id = format!("{name}_{}", NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity);
        let mailbox = Mailbox {
            rx,
            actor_id: actor_id.clone(),
        };
        (Self { tx, actor_id }, mailbox)
    }

    /// Waits for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::Stopped)
    }

    /// Like [`send`](Self::send), but returns the message if the actor is
    /// gone so the caller can release what it carries.
    pub async fn deliver(&self, msg: M) -> Result<(), M> {
        self.tx
            .send(msg)
            .await
            .map_err(|mpsc::error::SendError(msg)| msg)
    }

    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::Stopped,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Lifecycle side of a running actor.
#[derive(Debug)]
pub struct ActorRef {
    pub actor_id: String,
    task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Asks the loop to exit after the message in progress.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stops the actor and waits for `on_stop` to finish, aborting the task
    /// if it takes longer than `grace`.
    pub async fn shutdown(self, grace: Duration) {
        self.stop();
        let abort = self.task.abort_handle();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!(actor_id = %self.actor_id, "Actor did not stop in time, aborting");
            abort.abort();
        }
    }
}

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(0);

/// Runs `actor` on its own task, draining `mailbox`.
pub fn spawn_actor<A: Actor>(actor: A, mailbox: Mailbox<A::Message>) -> ActorRef {
    let (stop_tx, stop_rx) = watch::channel(false);
    let actor_id = mailbox.actor_id.clone();
    debug!(actor_id = %actor_id, actor_type = actor.name(), "Spawning actor");

    let task = tokio::spawn(run(actor, mailbox, stop_rx));
    ActorRef {
        actor_id,
        task,
        stop_tx,
    }
}

// =============================================================================
// Loop
// =============================================================================

enum Step {
    Continue,
    Exit,
}

async fn dispatch<A: Actor>(actor: &mut A, msg: A::Message, ctx: &mut ActorContext) -> Step {
    ctx.messages_processed += 1;
    match actor.handle(msg, ctx).await {
        Ok(true) => Step::Continue,
        Ok(false) => {
            debug!(actor_id = %ctx.actor_id, "Actor finished");
            Step::Exit
        }
        Err(e) => {
            error!(actor_id = %ctx.actor_id, error = %e, "Actor error");
            actor.on_crash(&e);
            match e {
                ActorError::Permanent(_) => Step::Exit,
                _ => Step::Continue,
            }
        }
    }
}

async fn run<A: Actor>(mut actor: A, mailbox: Mailbox<A::Message>, mut stop: watch::Receiver<bool>) {
    let Mailbox { mut rx, actor_id } = mailbox;
    let mut ctx = ActorContext {
        actor_id,
        messages_processed: 0,
    };

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %ctx.actor_id, error = %e, "Actor failed to start");
        return;
    }

    loop {
        tokio::select! {
            biased;

            changed = stop.changed() => {
                // A dropped ActorRef counts as a stop request.
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                if let Step::Exit = dispatch(&mut actor, msg, &mut ctx).await {
                    break;
                }
            }
        }
    }

    // Nothing queued behind the stop may run.
    rx.close();
    actor.on_stop(&mut ctx).await;

    info!(
        actor_id = %ctx.actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

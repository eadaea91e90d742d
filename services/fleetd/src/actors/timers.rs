//! Named timer slots owned by an actor.
//!
//! A timer is a spawned task that sleeps and then posts a message into the
//! owning actor's mailbox. Arming a slot replaces (aborts) whatever was
//! armed there before, so a slot can never hold two pending timers.
//! Cancelling an empty slot is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use super::framework::{ActorHandle, Message};

/// Timer slots of an instance supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires if an opened connection never reports ready.
    ConnectTimeout,
    /// Pause between teardown and the next open.
    Grace,
    /// Pending reconnect scheduled by a repair.
    Reconnect,
    /// Delay before mode restoration.
    Settle,
    /// Periodic auto-chat message.
    AutoChat,
    /// Periodic scheduled restart.
    RestartSchedule,
    /// Next reachability probe.
    Probe,
}

/// Table of armed timers.
#[derive(Debug, Default)]
pub struct Timers {
    slots: HashMap<TimerKind, JoinHandle<()>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts `msg` to `mailbox` once after `delay`.
    pub fn schedule<M: Message>(
        &mut self,
        kind: TimerKind,
        delay: Duration,
        mailbox: &ActorHandle<M>,
        msg: M,
    ) {
        let mailbox = mailbox.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A stopped actor simply drops the tick.
            if mailbox.send(msg).await.is_err() {
                trace!(timer = ?kind, "Timer fired after actor stopped");
            }
        });
        self.replace(kind, task);
    }

    /// Posts `make()` to `mailbox` every `period`, first after one period.
    pub fn schedule_every<M, F>(
        &mut self,
        kind: TimerKind,
        period: Duration,
        mailbox: &ActorHandle<M>,
        make: F,
    ) where
        M: Message,
        F: Fn() -> M + Send + 'static,
    {
        let mailbox = mailbox.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                if mailbox.send(make()).await.is_err() {
                    trace!(timer = ?kind, "Periodic timer stopping, actor gone");
                    break;
                }
            }
        });
        self.replace(kind, task);
    }

    /// Cancels one slot. Returns whether something was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.slots.remove(&kind) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every slot.
    pub fn cancel_all(&mut self) {
        for (_, task) in self.slots.drain() {
            task.abort();
        }
    }

    /// Whether a slot holds a timer that has not fired yet.
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots
            .get(&kind)
            .is_some_and(|task| !task.is_finished())
    }

    pub fn armed_count(&self) -> usize {
        self.slots.values().filter(|task| !task.is_finished()).count()
    }

    fn replace(&mut self, kind: TimerKind, task: JoinHandle<()>) {
        if let Some(previous) = self.slots.insert(kind, task) {
            previous.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Tick(u32);

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_once() {
        let (handle, mut mailbox) = ActorHandle::<Tick>::channel("timers", 8);
        let mut timers = Timers::new();

        timers.schedule(TimerKind::Reconnect, Duration::from_secs(5), &handle, Tick(1));
        assert!(timers.is_armed(TimerKind::Reconnect));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(mailbox.recv_now(), Some(Tick(1)));
        assert_eq!(mailbox.recv_now(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_previous_timer() {
        let (handle, mut mailbox) = ActorHandle::<Tick>::channel("timers", 8);
        let mut timers = Timers::new();

        timers.schedule(TimerKind::Settle, Duration::from_secs(2), &handle, Tick(1));
        timers.schedule(TimerKind::Settle, Duration::from_secs(2), &handle, Tick(2));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mailbox.recv_now(), Some(Tick(2)));
        assert_eq!(mailbox.recv_now(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_is_idempotent() {
        let (handle, mut mailbox) = ActorHandle::<Tick>::channel("timers", 8);
        let mut timers = Timers::new();

        timers.schedule(TimerKind::ConnectTimeout, Duration::from_secs(30), &handle, Tick(1));
        timers.schedule_every(TimerKind::AutoChat, Duration::from_secs(60), &handle, || Tick(2));
        assert_eq!(timers.armed_count(), 2);

        timers.cancel_all();
        timers.cancel_all();
        assert!(!timers.cancel(TimerKind::Probe));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(mailbox.recv_now(), None);
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer_ticks() {
        let (handle, mut mailbox) = ActorHandle::<Tick>::channel("timers", 8);
        let mut timers = Timers::new();

        timers.schedule_every(TimerKind::Probe, Duration::from_secs(30), &handle, || Tick(7));

        tokio::time::sleep(Duration::from_secs(95)).await;
        let mut ticks = 0;
        while mailbox.recv_now().is_some() {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
    }
}

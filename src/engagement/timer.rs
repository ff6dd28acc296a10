use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Observable lifecycle of a [`DebounceTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Pending,
    Fired,
    Cancelled,
}

/// One-shot timer that delivers an event to the event loop after a delay.
///
/// The receiver calls [`DebounceTimer::mark_fired`] when the event arrives;
/// an event whose `id` no longer matches the owner's current timer is stale.
/// Dropping the timer aborts the sleeping task.
#[derive(Debug)]
pub struct DebounceTimer {
    id: u64,
    deadline: Instant,
    state: TimerState,
    task: JoinHandle<()>,
}

impl DebounceTimer {
    pub fn start<E>(id: u64, delay: Duration, tx: mpsc::Sender<E>, event: E) -> Self
    where
        E: Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if tx.send(event).await.is_err() {
                tracing::debug!(timer_id = id, "Timer fired after receiver dropped");
            }
        });
        Self {
            id,
            deadline,
            state: TimerState::Pending,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == TimerState::Pending
    }

    /// Stop the timer if it has not fired yet.
    pub fn cancel(&mut self) {
        if self.state == TimerState::Pending {
            self.task.abort();
            self.state = TimerState::Cancelled;
        }
    }

    pub fn mark_fired(&mut self) {
        if self.state == TimerState::Pending {
            self.state = TimerState::Fired;
        }
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

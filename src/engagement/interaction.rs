//! Debounced, optimistic like/save toggles.
//!
//! A toggle updates the displayed flag and counter immediately, then waits
//! for a quiet period before sending the latest desired state. Taps during
//! the quiet period overwrite the desired state and restart the timer. At
//! most one request per (item, kind) is in flight; a timer that fires while
//! one is outstanding is deferred until it settles.
//!
//! On failure the flag and counter are restored to the exact values captured
//! at the first tap, not recomputed from what they became.

use crate::controller::FeedEvent;
use crate::engagement::timer::{DebounceTimer, TimerState};
use crate::feed::{ApiError, FeedBackend, FeedStore, InteractionKind, ItemId, LocalFlags, ToggleOutcome};
use crate::util::catch_task_panic;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// A toggle the server rejected. The optimistic change has been reverted.
#[derive(Debug, Error)]
#[error("Could not update {kind} on listing {item_id}, change reverted: {source}")]
pub struct InteractionError {
    pub item_id: ItemId,
    pub kind: InteractionKind,
    #[source]
    pub source: ApiError,
}

#[derive(Debug)]
pub struct PendingInteraction {
    pub item_id: ItemId,
    pub kind: InteractionKind,
    pub desired: bool,
    pub in_flight: bool,
    /// Desired state carried by the outstanding request.
    sent: Option<bool>,
    /// Timer fired while a request was in flight.
    deferred: bool,
    /// Last known-good local state, restored on failure.
    rollback: LocalFlags,
    timer: Option<DebounceTimer>,
}

impl PendingInteraction {
    pub fn timer_state(&self) -> Option<TimerState> {
        self.timer.as_ref().map(DebounceTimer::state)
    }

    pub fn sent(&self) -> Option<bool> {
        self.sent
    }
}

pub struct InteractionCoordinator {
    /// Keyed by listing so lookups can borrow a plain `&str`.
    pending: HashMap<ItemId, HashMap<InteractionKind, PendingInteraction>>,
    backend: Arc<dyn FeedBackend>,
    events: mpsc::Sender<FeedEvent>,
    debounce: Duration,
    next_timer_id: u64,
}

impl std::fmt::Debug for InteractionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionCoordinator")
            .field("pending", &self.pending)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl InteractionCoordinator {
    pub fn new(
        backend: Arc<dyn FeedBackend>,
        events: mpsc::Sender<FeedEvent>,
        debounce: Duration,
    ) -> Self {
        Self {
            pending: HashMap::new(),
            backend,
            events,
            debounce,
            next_timer_id: 0,
        }
    }

    pub fn pending(&self, item_id: &str, kind: InteractionKind) -> Option<&PendingInteraction> {
        self.pending.get(item_id)?.get(&kind)
    }

    fn take(&mut self, item_id: &str, kind: InteractionKind) -> Option<PendingInteraction> {
        let kinds = self.pending.get_mut(item_id)?;
        let pending = kinds.remove(&kind);
        if kinds.is_empty() {
            self.pending.remove(item_id);
        }
        pending
    }

    pub fn has_pending(&self, item_id: &str, kind: InteractionKind) -> bool {
        self.pending(item_id, kind).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(HashMap::len).sum()
    }

    /// Flip the local flag and counter now and (re)start the debounce timer.
    ///
    /// Returns false if the listing is not in the feed.
    pub fn toggle(&mut self, store: &mut FeedStore, item_id: &str, kind: InteractionKind) -> bool {
        let Some(item) = store.get_mut(item_id) else {
            tracing::warn!(item_id, %kind, "Toggle for listing not in feed");
            return false;
        };

        let before = item.local;
        let desired = !before.flag(kind);
        let count = if desired {
            before.count(kind).saturating_add(1)
        } else {
            before.count(kind).saturating_sub(1)
        };
        item.local.set(kind, desired, count);
        let id = Arc::clone(&item.id);

        self.next_timer_id = self.next_timer_id.wrapping_add(1);
        let timer_id = self.next_timer_id;
        let timer = DebounceTimer::start(
            timer_id,
            self.debounce,
            self.events.clone(),
            FeedEvent::DebounceElapsed {
                item_id: Arc::clone(&id),
                kind,
                timer_id,
            },
        );

        let pending = self
            .pending
            .entry(Arc::clone(&id))
            .or_default()
            .entry(kind)
            .or_insert_with(|| PendingInteraction {
                item_id: id,
                kind,
                desired,
                in_flight: false,
                sent: None,
                deferred: false,
                rollback: before,
                timer: None,
            });
        pending.desired = desired;
        if let Some(mut previous) = pending.timer.replace(timer) {
            previous.cancel();
        }

        tracing::debug!(item_id = %pending.item_id, %kind, desired, count, timer_id, "Optimistic toggle applied");
        true
    }

    /// Handle a debounce timer firing. Stale timer ids are ignored.
    pub fn on_debounce_elapsed(&mut self, item_id: &ItemId, kind: InteractionKind, timer_id: u64) {
        let Some(pending) = self.pending.get_mut(&**item_id).and_then(|kinds| kinds.get_mut(&kind)) else {
            tracing::trace!(item_id = %item_id, %kind, timer_id, "Debounce fired with nothing pending");
            return;
        };
        match pending.timer.as_mut() {
            Some(timer) if timer.id() == timer_id => timer.mark_fired(),
            _ => {
                tracing::trace!(item_id = %item_id, %kind, timer_id, "Ignoring superseded debounce timer");
                return;
            }
        }

        if pending.in_flight {
            tracing::debug!(item_id = %item_id, %kind, "Request in flight, deferring dispatch");
            pending.deferred = true;
            return;
        }
        dispatch(pending, &self.backend, &self.events);
    }

    /// Reconcile a finished request.
    ///
    /// Success adopts the server's flag and count unless the user has toggled
    /// again since the request was sent. Failure restores the rollback
    /// snapshot and returns the error for display.
    pub fn on_settled(
        &mut self,
        store: &mut FeedStore,
        item_id: &ItemId,
        kind: InteractionKind,
        requested: bool,
        result: Result<ToggleOutcome, ApiError>,
    ) -> Option<InteractionError> {
        let Some(pending) = self.pending.get_mut(&**item_id).and_then(|kinds| kinds.get_mut(&kind)) else {
            tracing::debug!(item_id = %item_id, %kind, "Interaction settled after teardown, ignoring");
            return None;
        };
        pending.in_flight = false;
        pending.sent = None;

        match result {
            Ok(outcome) => {
                if let Some(item) = store.get_mut(item_id) {
                    item.server_stats.set_count(kind, outcome.count);
                }

                let superseded = pending.deferred
                    || pending.desired != requested
                    || pending.timer.as_ref().is_some_and(DebounceTimer::is_pending);
                if superseded {
                    pending.rollback.set(kind, outcome.state, outcome.count);
                    tracing::debug!(
                        item_id = %item_id,
                        %kind,
                        confirmed = outcome.state,
                        desired = pending.desired,
                        "Interaction confirmed, newer toggle pending"
                    );
                    if pending.deferred {
                        dispatch(pending, &self.backend, &self.events);
                    }
                } else {
                    if let Some(item) = store.get_mut(item_id) {
                        item.local.set(kind, outcome.state, outcome.count);
                    }
                    self.take(item_id, kind);
                    tracing::debug!(item_id = %item_id, %kind, state = outcome.state, count = outcome.count, "Interaction confirmed");
                }
                None
            }
            Err(source) => {
                let pending = self.take(item_id, kind)?;
                if let Some(item) = store.get_mut(item_id) {
                    item.local.copy_kind(&pending.rollback, kind);
                }
                tracing::error!(
                    item_id = %item_id,
                    %kind,
                    error = %source,
                    restored = pending.rollback.flag(kind),
                    count = pending.rollback.count(kind),
                    "Interaction failed, rolled back"
                );
                Some(InteractionError {
                    item_id: Arc::clone(item_id),
                    kind,
                    source,
                })
            }
        }
    }

    /// Cancel every debounce timer and forget pending interactions.
    ///
    /// Requests already in flight still complete; their results are ignored.
    pub fn cancel_all(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(count = self.pending_count(), "Cancelling pending interactions");
        }
        for pending in self.pending.values_mut().flat_map(HashMap::values_mut) {
            if let Some(timer) = pending.timer.as_mut() {
                timer.cancel();
            }
        }
        self.pending.clear();
    }
}

fn dispatch(
    pending: &mut PendingInteraction,
    backend: &Arc<dyn FeedBackend>,
    events: &mpsc::Sender<FeedEvent>,
) {
    let desired = pending.desired;
    pending.in_flight = true;
    pending.deferred = false;
    pending.sent = Some(desired);

    let item_id = Arc::clone(&pending.item_id);
    let kind = pending.kind;
    let backend = Arc::clone(backend);
    let tx = events.clone();
    tracing::debug!(item_id = %item_id, %kind, desired, "Sending interaction");

    tokio::spawn(async move {
        let result = match catch_task_panic(backend.set_interaction(&item_id, kind, desired)).await {
            Ok(result) => result,
            Err(panic_msg) => {
                tracing::error!(task = "interaction", item_id = %item_id, error = %panic_msg, "Background task panicked");
                Err(ApiError::TaskFailed(panic_msg))
            }
        };
        let event = FeedEvent::InteractionSettled {
            item_id,
            kind,
            requested: desired,
            result,
        };
        if let Err(e) = tx.send(event).await {
            tracing::warn!(error = %e, event = "InteractionSettled", "Channel send failed (receiver dropped)");
        }
    });
}

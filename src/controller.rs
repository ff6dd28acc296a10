//! Top-level feed orchestration.
//!
//! [`FeedController`] owns every component for one feed screen and is driven
//! from a single event loop: scroll input, focus changes, ticks, and the
//! [`FeedEvent`]s that background tasks send back. Nothing here blocks; media
//! opens, page fetches, view reports, and toggles run on spawned tasks.

use crate::config::FeedSettings;
use crate::engagement::{spawn_view_report, InteractionCoordinator, InteractionError, ViewTracker};
use crate::feed::{
    ApiError, FeedBackend, FeedItem, FeedPage, FeedStore, InteractionKind, ItemId, ToggleOutcome,
};
use crate::focus::{FocusChange, FocusGate};
use crate::playback::{
    LoadRequest, MediaError, MediaOpener, PlaybackScheduler, PlayerHandle, SlotId, SlotSnapshot,
};
use crate::util::catch_task_panic;
use crate::viewability::{ItemGeometry, ViewabilityDetector, Viewport, VisibilitySnapshot};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Results delivered from background tasks to the event loop.
#[derive(Debug)]
pub enum FeedEvent {
    /// A player setup finished. `generation` is the stamp from the [`LoadRequest`].
    MediaOpened {
        slot_id: SlotId,
        generation: u64,
        result: Result<PlayerHandle, MediaError>,
    },
    /// An attached player failed after it was opened. Sent by whatever owns
    /// the decoders; ignored if the slot has since been rebound.
    PlaybackFailed {
        slot_id: SlotId,
        item_id: ItemId,
        error: MediaError,
    },
    /// A like/save debounce timer elapsed.
    DebounceElapsed {
        item_id: ItemId,
        kind: InteractionKind,
        timer_id: u64,
    },
    /// A like/save request finished. `requested` is the state that was sent.
    InteractionSettled {
        item_id: ItemId,
        kind: InteractionKind,
        requested: bool,
        result: Result<ToggleOutcome, ApiError>,
    },
    /// A page fetch finished. `replace` is true for the first page of a load or refresh.
    PageLoaded {
        generation: u64,
        replace: bool,
        result: Result<FeedPage, ApiError>,
    },
}

/// Recoverable failure for non-blocking display.
#[derive(Debug)]
pub enum Notice {
    InteractionReverted(InteractionError),
    PageLoadFailed(ApiError),
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::InteractionReverted(e) => write!(f, "{e}"),
            Notice::PageLoadFailed(e) => write!(f, "Could not load listings: {e}"),
        }
    }
}

#[derive(Debug, Default)]
struct PageState {
    generation: u64,
    in_flight: bool,
    next_cursor: Option<String>,
}

/// True when `active` is within `distance` items of the end of a `len`-item feed.
fn should_prefetch(active: usize, len: usize, distance: usize) -> bool {
    active.saturating_add(distance).saturating_add(1) >= len
}

pub struct FeedController {
    settings: FeedSettings,
    store: FeedStore,
    detector: ViewabilityDetector,
    scheduler: PlaybackScheduler,
    views: ViewTracker,
    interactions: InteractionCoordinator,
    focus: FocusGate,
    backend: Arc<dyn FeedBackend>,
    opener: Arc<dyn MediaOpener>,
    events: mpsc::Sender<FeedEvent>,
    notices: Vec<Notice>,
    pages: PageState,
    last_snapshot: Option<VisibilitySnapshot>,
}

impl FeedController {
    pub fn new(
        settings: FeedSettings,
        backend: Arc<dyn FeedBackend>,
        opener: Arc<dyn MediaOpener>,
        events: mpsc::Sender<FeedEvent>,
    ) -> Self {
        Self {
            store: FeedStore::new(),
            detector: ViewabilityDetector::new(
                settings.viewability_threshold,
                settings.visibility_stabilization,
            ),
            scheduler: PlaybackScheduler::new(settings.slot_count, settings.muted_by_default),
            views: ViewTracker::new(settings.view_dwell),
            interactions: InteractionCoordinator::new(
                Arc::clone(&backend),
                events.clone(),
                settings.interaction_debounce,
            ),
            focus: FocusGate::new(true),
            backend,
            opener,
            events,
            notices: Vec::new(),
            pages: PageState::default(),
            last_snapshot: None,
            settings,
        }
    }

    // ========================================================================
    // Read Access
    // ========================================================================

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    pub fn item(&self, item_id: &str) -> Option<&FeedItem> {
        self.store.get(item_id)
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn views(&self) -> &ViewTracker {
        &self.views
    }

    pub fn interactions(&self) -> &InteractionCoordinator {
        &self.interactions
    }

    pub fn active_index(&self) -> Option<usize> {
        self.scheduler.active_index()
    }

    pub fn is_focused(&self) -> bool {
        self.focus.is_focused()
    }

    pub fn is_loading(&self) -> bool {
        self.pages.in_flight
    }

    pub fn has_more(&self) -> bool {
        self.pages.next_cursor.is_some()
    }

    pub fn subscribe_active(&self) -> watch::Receiver<Option<usize>> {
        self.scheduler.subscribe_active()
    }

    pub fn subscribe_slot(&self, slot_id: SlotId) -> Option<watch::Receiver<SlotSnapshot>> {
        self.scheduler.subscribe_slot(slot_id)
    }

    pub fn subscribe_focus(&self) -> watch::Receiver<bool> {
        self.focus.subscribe()
    }

    /// Take every notice raised since the last call.
    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    // ========================================================================
    // Feed Loading
    // ========================================================================

    /// Fetch the first page.
    pub fn load_initial(&mut self) {
        tracing::info!(page_size = self.settings.page_size, "Loading feed");
        self.request_page(None, true);
    }

    /// Re-fetch the first page and replace the list. Supersedes any page
    /// request already in flight.
    pub fn refresh(&mut self) {
        tracing::info!(items = self.store.len(), "Refreshing feed");
        self.request_page(None, true);
    }

    fn request_page(&mut self, cursor: Option<String>, replace: bool) {
        self.pages.generation = self.pages.generation.wrapping_add(1);
        self.pages.in_flight = true;
        let generation = self.pages.generation;
        let limit = self.settings.page_size;
        let backend = Arc::clone(&self.backend);
        let tx = self.events.clone();

        tracing::debug!(generation, replace, cursor = ?cursor, "Spawning page load");
        tokio::spawn(async move {
            let result = match catch_task_panic(backend.fetch_page(cursor.as_deref(), limit)).await {
                Ok(result) => result,
                Err(panic_msg) => {
                    tracing::error!(task = "page_load", error = %panic_msg, "Background task panicked");
                    Err(ApiError::TaskFailed(panic_msg))
                }
            };
            let event = FeedEvent::PageLoaded {
                generation,
                replace,
                result,
            };
            if let Err(e) = tx.send(event).await {
                tracing::warn!(error = %e, event = "PageLoaded", "Channel send failed (receiver dropped)");
            }
        });
    }

    fn on_page_loaded(&mut self, generation: u64, replace: bool, result: Result<FeedPage, ApiError>) {
        if generation != self.pages.generation {
            tracing::debug!(
                expected = self.pages.generation,
                got = generation,
                "Ignoring stale page load (generation mismatch)"
            );
            return;
        }
        self.pages.in_flight = false;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(error = %e, replace, "Page load failed");
                self.notices.push(Notice::PageLoadFailed(e));
                return;
            }
        };

        self.pages.next_cursor = page.next_cursor;
        let received = page.items.len();
        if replace {
            self.replace_items(page.items);
        } else {
            let added = self.store.append(page.items);
            tracing::info!(received, added, total = self.store.len(), "Appended page");
        }
        self.maybe_prefetch();
    }

    fn replace_items(&mut self, items: Vec<FeedItem>) {
        let interactions = &self.interactions;
        let removed = self
            .store
            .replace_with(items, |id, kind| interactions.has_pending(id, kind));

        for id in &removed {
            self.scheduler.release_item(id);
        }

        let bound: Vec<ItemId> = self
            .scheduler
            .pool()
            .iter()
            .filter_map(|slot| slot.item_id().cloned())
            .chain(self.scheduler.active_item().cloned())
            .collect();
        for id in bound {
            if let Some(index) = self.store.index_of(&id) {
                self.scheduler.update_item_index(&id, index);
            }
        }

        // Indices changed meaning; the next scroll event re-evaluates from scratch
        self.detector.reset();
        self.last_snapshot = None;

        tracing::info!(
            total = self.store.len(),
            removed = removed.len(),
            active = ?self.scheduler.active_index(),
            "Feed replaced"
        );
    }

    fn maybe_prefetch(&mut self) {
        if self.pages.in_flight {
            return;
        }
        let Some(cursor) = self.pages.next_cursor.clone() else {
            return;
        };
        let Some(active) = self.scheduler.active_index() else {
            return;
        };
        if should_prefetch(active, self.store.len(), self.settings.prefetch_distance) {
            tracing::debug!(active, len = self.store.len(), "Prefetching next page");
            self.request_page(Some(cursor), false);
        }
    }

    // ========================================================================
    // Presentation Inputs
    // ========================================================================

    /// Feed a scroll position. Runs the viewability detector and applies any
    /// resulting snapshot.
    pub fn on_scroll(&mut self, geometry: &[ItemGeometry], viewport: Viewport, now: Instant) {
        if let Some(snapshot) = self.detector.observe(geometry, viewport, now) {
            self.on_visibility_changed(snapshot, now);
        }
    }

    /// Apply a visibility snapshot: start or stop dwell clocks and, while
    /// focused, activate the most visible item.
    pub fn on_visibility_changed(&mut self, snapshot: VisibilitySnapshot, now: Instant) {
        let viewable: Vec<ItemId> = snapshot
            .viewable_indices()
            .filter_map(|index| self.store.at(index))
            .map(|item| Arc::clone(&item.id))
            .collect();
        self.views.on_snapshot(viewable, now);

        let primary = snapshot.primary_index();
        self.last_snapshot = Some(snapshot);

        if !self.focus.is_focused() {
            tracing::trace!(primary = ?primary, "Unfocused, not activating");
            return;
        }
        if let Some(index) = primary {
            self.activate(index);
        }
    }

    pub fn on_focus_changed(&mut self, focused: bool, now: Instant) {
        match self.focus.apply(focused, &mut self.scheduler, &self.store) {
            FocusChange::Unchanged => {}
            FocusChange::Suspended => self.views.suspend(),
            FocusChange::Resumed { index, load } => {
                self.views.resume(now);
                if let Some(request) = load {
                    self.spawn_media_load(request);
                }
                if index.is_none() {
                    let primary = self.last_snapshot.as_ref().and_then(VisibilitySnapshot::primary_index);
                    if let Some(primary) = primary {
                        self.activate(primary);
                    }
                }
            }
        }
    }

    /// Periodic tick: visibility stabilization and view dwell.
    pub fn tick(&mut self, now: Instant) {
        if let Some(snapshot) = self.detector.tick(now) {
            self.on_visibility_changed(snapshot, now);
        }
        if !self.focus.is_focused() {
            return;
        }
        if let Some(item_id) = self.views.check_dwell(self.scheduler.active_item(), now) {
            spawn_view_report(Arc::clone(&self.backend), item_id);
        }
    }

    pub fn toggle_like(&mut self, item_id: &str) -> bool {
        self.interactions
            .toggle(&mut self.store, item_id, InteractionKind::Like)
    }

    pub fn toggle_save(&mut self, item_id: &str) -> bool {
        self.interactions
            .toggle(&mut self.store, item_id, InteractionKind::Save)
    }

    /// Reload an errored slot. Returns false if the slot is not errored.
    pub fn retry(&mut self, slot_id: SlotId) -> bool {
        match self.scheduler.retry(slot_id, &self.store) {
            Some(request) => {
                self.spawn_media_load(request);
                true
            }
            None => false,
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.scheduler.set_muted(muted);
    }

    pub fn set_muted_by_default(&mut self, muted: bool) {
        self.settings.muted_by_default = muted;
        self.scheduler.set_muted_by_default(muted);
    }

    /// Release every slot, cancel every timer, and drop outstanding page loads.
    pub fn teardown(&mut self) {
        self.interactions.cancel_all();
        self.scheduler.clear();
        self.views.suspend();
        self.detector.reset();
        self.pages.generation = self.pages.generation.wrapping_add(1);
        self.pages.in_flight = false;
        self.last_snapshot = None;
        tracing::info!("Feed torn down");
    }

    // ========================================================================
    // Background Results
    // ========================================================================

    pub fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::MediaOpened {
                slot_id,
                generation,
                result,
            } => {
                self.scheduler.on_media_opened(slot_id, generation, result);
            }
            FeedEvent::PlaybackFailed {
                slot_id,
                item_id,
                error,
            } => {
                self.scheduler.on_playback_error(slot_id, &item_id, error);
            }
            FeedEvent::DebounceElapsed {
                item_id,
                kind,
                timer_id,
            } => {
                self.interactions.on_debounce_elapsed(&item_id, kind, timer_id);
            }
            FeedEvent::InteractionSettled {
                item_id,
                kind,
                requested,
                result,
            } => {
                if let Some(e) =
                    self.interactions
                        .on_settled(&mut self.store, &item_id, kind, requested, result)
                {
                    self.notices.push(Notice::InteractionReverted(e));
                }
            }
            FeedEvent::PageLoaded {
                generation,
                replace,
                result,
            } => {
                self.on_page_loaded(generation, replace, result);
            }
        }
    }

    fn activate(&mut self, index: usize) {
        if let Some(request) = self.scheduler.set_active_index(index, &self.store) {
            self.spawn_media_load(request);
        }
        self.maybe_prefetch();
    }

    fn spawn_media_load(&self, request: LoadRequest) {
        let opener = Arc::clone(&self.opener);
        let tx = self.events.clone();
        tracing::debug!(
            slot_id = request.slot_id,
            generation = request.generation,
            item_id = %request.item_id,
            "Spawning media open"
        );

        tokio::spawn(async move {
            let LoadRequest {
                slot_id,
                generation,
                item_id,
                media_ref,
            } = request;
            let result = match catch_task_panic(opener.open(&media_ref)).await {
                Ok(result) => result,
                Err(panic_msg) => {
                    tracing::error!(task = "media_open", item_id = %item_id, error = %panic_msg, "Background task panicked");
                    Err(MediaError::Open(panic_msg))
                }
            };
            let event = FeedEvent::MediaOpened {
                slot_id,
                generation,
                result,
            };
            if let Err(mpsc::error::SendError(event)) = tx.send(event).await {
                tracing::warn!(event = "MediaOpened", "Channel send failed (receiver dropped)");
                if let FeedEvent::MediaOpened {
                    result: Ok(mut player),
                    ..
                } = event
                {
                    player.release();
                }
            }
        });
    }
}

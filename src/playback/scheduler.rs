use crate::feed::{FeedStore, ItemId};
use crate::playback::media::{MediaError, PlayerHandle};
use crate::playback::pool::{Acquired, PlayerSlotPool, SlotId, SlotSnapshot, SlotState};
use std::sync::Arc;
use tokio::sync::watch;

/// An asynchronous player setup the caller must perform.
///
/// The result goes back through [`PlaybackScheduler::on_media_opened`] with
/// the same `slot_id` and `generation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub slot_id: SlotId,
    pub generation: u64,
    pub item_id: ItemId,
    pub media_ref: String,
}

#[derive(Debug, Clone)]
struct Active {
    index: usize,
    item_id: ItemId,
    /// `None` for placeholder items without media.
    slot: Option<SlotId>,
}

/// Decides which single feed item plays and drives the slot pool.
///
/// All transitions are synchronous. The only asynchronous step is opening
/// media, returned to the caller as a [`LoadRequest`]. Every activation bumps
/// a generation counter. A slot has at most one open outstanding; activating
/// its item again hands that open to the new generation instead of issuing
/// another. A load whose activation was superseded never reaches `Playing`.
#[derive(Debug)]
pub struct PlaybackScheduler {
    pool: PlayerSlotPool,
    generation: u64,
    active: Option<Active>,
    /// Set by `pause_all`; the active item is remembered but not playing.
    suspended: bool,
    muted_by_default: bool,
    active_muted: bool,
    active_tx: watch::Sender<Option<usize>>,
    slot_txs: Vec<watch::Sender<SlotSnapshot>>,
}

impl PlaybackScheduler {
    pub fn new(slot_count: usize, muted_by_default: bool) -> Self {
        let pool = PlayerSlotPool::new(slot_count);
        let slot_txs = pool
            .iter()
            .map(|slot| watch::Sender::new(slot.snapshot()))
            .collect();
        Self {
            pool,
            generation: 0,
            active: None,
            suspended: false,
            muted_by_default,
            active_muted: muted_by_default,
            active_tx: watch::Sender::new(None),
            slot_txs,
        }
    }

    // ========================================================================
    // Read Access
    // ========================================================================

    pub fn active_index(&self) -> Option<usize> {
        self.active.as_ref().map(|a| a.index)
    }

    pub fn active_item(&self) -> Option<&ItemId> {
        self.active.as_ref().map(|a| &a.item_id)
    }

    pub fn active_slot(&self) -> Option<SlotId> {
        self.active.as_ref().and_then(|a| a.slot)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pool(&self) -> &PlayerSlotPool {
        &self.pool
    }

    pub fn slot_state(&self, slot_id: SlotId) -> Option<SlotState> {
        self.pool.get(slot_id).map(|s| s.state())
    }

    /// Observable active index.
    pub fn subscribe_active(&self) -> watch::Receiver<Option<usize>> {
        self.active_tx.subscribe()
    }

    /// Observable state of one slot.
    pub fn subscribe_slot(&self, slot_id: SlotId) -> Option<watch::Receiver<SlotSnapshot>> {
        self.slot_txs.get(slot_id).map(watch::Sender::subscribe)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Make the item at `index` the single active item.
    ///
    /// Reuses the item's slot if it has one, otherwise takes a free slot or
    /// evicts the binding farthest from `index`. Every other slot is paused
    /// and muted. Calling again with an index that is already applied is a
    /// no-op. An index with no listing is logged and ignored.
    pub fn set_active_index(&mut self, index: usize, store: &FeedStore) -> Option<LoadRequest> {
        let Some(item) = store.at(index) else {
            tracing::warn!(index, len = store.len(), "Ignoring activation of index with no listing");
            return None;
        };

        if self.is_applied(index, &item.id) {
            tracing::trace!(index, "Activation already applied");
            return None;
        }

        self.generation += 1;
        let generation = self.generation;
        self.suspended = false;
        self.active_muted = self.muted_by_default;

        let target = match item.media_ref {
            Some(_) => self.pool.acquire(&item.id, index),
            None => None,
        };
        if let Some((slot_id, Acquired::Evicted(evicted))) = &target {
            tracing::debug!(slot_id, evicted = %evicted, "Slot rebound for activation");
        }
        let target = target.map(|(slot_id, _)| slot_id);

        for slot in self.pool.iter_mut() {
            if Some(slot.id()) != target {
                slot.pause();
            }
        }

        let request = match (target, item.media_ref.as_deref()) {
            (Some(slot_id), Some(media_ref)) => self.start(slot_id, generation, &item.id, media_ref),
            _ => None,
        };

        tracing::debug!(
            index,
            item_id = %item.id,
            slot_id = ?target,
            generation,
            loading = request.is_some(),
            "Activated feed item"
        );

        self.active = Some(Active {
            index,
            item_id: Arc::clone(&item.id),
            slot: target,
        });
        self.publish();
        request
    }

    /// Apply the result of a [`LoadRequest`].
    ///
    /// Results for a slot that has since been rebound or re-requested are
    /// discarded. A result whose activation was superseded releases the
    /// player and leaves the slot unloaded. A result for a slot that is not
    /// the playing target stays `Ready`.
    pub fn on_media_opened(
        &mut self,
        slot_id: SlotId,
        generation: u64,
        result: Result<PlayerHandle, MediaError>,
    ) {
        let current = self.generation;
        let suspended = self.suspended;
        let muted = self.active_muted;
        let is_target = self.active_slot() == Some(slot_id);

        let Some(slot) = self.pool.get_mut(slot_id) else {
            tracing::warn!(slot_id, "Media opened for unknown slot");
            if let Ok(mut player) = result {
                player.release();
            }
            return;
        };

        if slot.ticket() != Some(generation) {
            tracing::debug!(slot_id, generation, "Discarding media open for rebound slot");
            if let Ok(mut player) = result {
                player.release();
            }
            return;
        }

        if slot.owner() != current {
            tracing::debug!(
                slot_id,
                generation,
                current,
                "Discarding media open from superseded activation"
            );
            if let Ok(mut player) = result {
                player.release();
            }
            slot.abandon_load();
            self.publish();
            return;
        }

        match result {
            Ok(player) => {
                slot.attach(player);
                if is_target && !suspended {
                    slot.play(muted);
                }
                tracing::debug!(slot_id, generation, state = ?slot.state(), "Media ready");
            }
            Err(e) => {
                tracing::warn!(slot_id, generation, error = %e, "Media failed to open");
                slot.fail(e);
            }
        }
        self.publish();
    }

    /// Report that an attached player failed during playback.
    ///
    /// Moves a `Ready`, `Playing` or `Paused` slot still bound to `item_id`
    /// to `Errored` and frees its decoder. Returns false when the slot was
    /// rebound or holds no player, in which case the report is stale.
    pub fn on_playback_error(&mut self, slot_id: SlotId, item_id: &str, error: MediaError) -> bool {
        let Some(slot) = self.pool.get_mut(slot_id) else {
            tracing::warn!(slot_id, "Playback error for unknown slot");
            return false;
        };
        if slot.item_id().map(|id| &**id) != Some(item_id) || !slot.has_player() {
            tracing::debug!(
                slot_id,
                item_id,
                bound = ?slot.item_id(),
                state = ?slot.state(),
                "Ignoring stale playback error"
            );
            return false;
        }

        tracing::warn!(slot_id, item_id, state = ?slot.state(), error = %error, "Playback failed");
        slot.fail(error);
        self.publish();
        true
    }

    /// Rewrite an item's ordinal after the list reorders. Playback is untouched.
    pub fn update_item_index(&mut self, item_id: &str, new_index: usize) -> bool {
        let mut found = self.pool.update_ordinal(item_id, new_index);
        if let Some(active) = self.active.as_mut() {
            if &*active.item_id == item_id {
                active.index = new_index;
                found = true;
            }
        }
        if found {
            self.publish();
        }
        found
    }

    /// Release the slot bound to an item that left the feed.
    pub fn release_item(&mut self, item_id: &str) {
        if let Some(slot_id) = self.pool.slot_for(item_id) {
            if let Some(slot) = self.pool.get_mut(slot_id) {
                slot.release();
            }
        }
        if self
            .active
            .as_ref()
            .is_some_and(|a| &*a.item_id == item_id)
        {
            tracing::debug!(item_id, "Active item left the feed");
            self.active = None;
        }
        self.publish();
    }

    /// Pause every slot while remembering the active item. Safe to repeat.
    pub fn pause_all(&mut self) {
        for slot in self.pool.iter_mut() {
            slot.pause();
        }
        if !self.suspended {
            tracing::debug!(active = ?self.active_index(), "Playback suspended");
        }
        self.suspended = true;
        self.publish();
    }

    /// Move an errored slot back to `Loading`.
    pub fn retry(&mut self, slot_id: SlotId, store: &FeedStore) -> Option<LoadRequest> {
        let generation = self.generation;
        let slot = self.pool.get_mut(slot_id)?;
        if slot.state() != SlotState::Errored {
            tracing::debug!(slot_id, state = ?slot.state(), "Retry ignored: slot not errored");
            return None;
        }
        let item_id = slot.item_id().cloned()?;

        let Some(media_ref) = store.get(&item_id).and_then(|i| i.media_ref.clone()) else {
            tracing::warn!(slot_id, item_id = %item_id, "Retry for listing no longer in feed");
            slot.release();
            self.publish();
            return None;
        };

        slot.begin_load(generation);
        tracing::debug!(slot_id, item_id = %item_id, generation, "Retrying media open");
        self.publish();
        Some(LoadRequest {
            slot_id,
            generation,
            item_id,
            media_ref,
        })
    }

    /// Mute or unmute the active slot until the next activation.
    pub fn set_muted(&mut self, muted: bool) {
        self.active_muted = muted;
        if let Some(slot_id) = self.active_slot() {
            if let Some(slot) = self.pool.get_mut(slot_id) {
                if slot.state() == SlotState::Playing {
                    slot.set_muted(muted);
                }
            }
        }
        self.publish();
    }

    /// Default mute state for newly activated slots.
    pub fn set_muted_by_default(&mut self, muted: bool) {
        self.muted_by_default = muted;
    }

    /// Unbind and release every slot. Outstanding loads are discarded.
    pub fn clear(&mut self) {
        for slot in self.pool.iter_mut() {
            slot.release();
        }
        self.generation += 1;
        self.active = None;
        self.suspended = false;
        self.publish();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn is_applied(&self, index: usize, item_id: &ItemId) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        if self.suspended || active.index != index || active.item_id != *item_id {
            return false;
        }
        match active.slot {
            None => true,
            Some(slot_id) => matches!(
                self.slot_state(slot_id),
                Some(SlotState::Loading | SlotState::Playing | SlotState::Errored)
            ),
        }
    }

    fn start(
        &mut self,
        slot_id: SlotId,
        generation: u64,
        item_id: &ItemId,
        media_ref: &str,
    ) -> Option<LoadRequest> {
        let muted = self.active_muted;
        let slot = self.pool.get_mut(slot_id)?;
        match slot.state() {
            // The open already in flight serves this activation too
            SlotState::Loading => {
                slot.adopt_load(generation);
                tracing::debug!(slot_id, generation, ticket = ?slot.ticket(), "Reusing in-flight media open");
                None
            }
            SlotState::Idle => {
                slot.begin_load(generation);
                Some(LoadRequest {
                    slot_id,
                    generation,
                    item_id: Arc::clone(item_id),
                    media_ref: media_ref.to_string(),
                })
            }
            SlotState::Ready | SlotState::Paused | SlotState::Playing => {
                slot.play(muted);
                None
            }
            SlotState::Errored => {
                tracing::debug!(slot_id, "Active slot is errored, waiting for retry");
                None
            }
        }
    }

    fn publish(&self) {
        let index = self.active_index();
        self.active_tx.send_if_modified(|current| {
            if *current != index {
                *current = index;
                true
            } else {
                false
            }
        });
        for (slot, tx) in self.pool.iter().zip(&self.slot_txs) {
            let snapshot = slot.snapshot();
            tx.send_if_modified(|current| {
                if *current != snapshot {
                    *current = snapshot;
                    true
                } else {
                    false
                }
            });
        }
    }
}

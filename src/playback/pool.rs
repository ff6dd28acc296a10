use crate::feed::ItemId;
use crate::playback::media::{MediaError, PlayerHandle};
use std::sync::Arc;

/// Index of a slot in the pool, `0..N`.
pub type SlotId = usize;

/// Lifecycle of a player slot.
///
/// `Idle → Loading → Ready → Playing ⇄ Paused`. A failed open moves
/// `Loading` to `Errored`; a player failing later moves `Ready`, `Playing`
/// or `Paused` there. `Errored` only leaves via an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Errored,
}

/// Observable view of a slot, published to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub state: SlotState,
    pub item_id: Option<ItemId>,
    pub muted: bool,
    pub error: Option<MediaError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    item_id: ItemId,
    ordinal: usize,
}

/// One reusable playback resource.
#[derive(Debug)]
pub struct PlayerSlot {
    id: SlotId,
    binding: Option<Binding>,
    state: SlotState,
    muted: bool,
    /// Generation stamp of the outstanding load, if any.
    ticket: Option<u64>,
    /// Activation the outstanding load serves. Moves forward when the same
    /// binding is activated again while still loading.
    owner: u64,
    player: Option<PlayerHandle>,
    error: Option<MediaError>,
}

impl PlayerSlot {
    fn new(id: SlotId) -> Self {
        Self {
            id,
            binding: None,
            state: SlotState::Idle,
            muted: true,
            ticket: None,
            owner: 0,
            player: None,
            error: None,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn item_id(&self) -> Option<&ItemId> {
        self.binding.as_ref().map(|b| &b.item_id)
    }

    pub fn ordinal(&self) -> Option<usize> {
        self.binding.as_ref().map(|b| b.ordinal)
    }

    pub fn error(&self) -> Option<&MediaError> {
        self.error.as_ref()
    }

    pub(crate) fn ticket(&self) -> Option<u64> {
        self.ticket
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            state: self.state,
            item_id: self.item_id().cloned(),
            muted: self.muted,
            error: self.error.clone(),
        }
    }

    pub(crate) fn begin_load(&mut self, generation: u64) {
        if let Some(mut player) = self.player.take() {
            player.release();
        }
        self.state = SlotState::Loading;
        self.ticket = Some(generation);
        self.owner = generation;
        self.error = None;
    }

    /// Hand the outstanding load to a newer activation of the same binding.
    pub(crate) fn adopt_load(&mut self, generation: u64) {
        self.owner = generation;
    }

    /// Install the opened player. Caller has verified the ticket.
    pub(crate) fn attach(&mut self, mut player: PlayerHandle) {
        self.ticket = None;
        self.muted = true;
        player.set_muted(true);
        self.player = Some(player);
        self.state = SlotState::Ready;
    }

    /// Drop an outstanding load whose activation was superseded.
    pub(crate) fn abandon_load(&mut self) {
        self.ticket = None;
        self.state = SlotState::Idle;
    }

    /// Whether a decoder is attached.
    pub(crate) fn has_player(&self) -> bool {
        self.player.is_some()
    }

    pub(crate) fn fail(&mut self, error: MediaError) {
        self.ticket = None;
        if let Some(mut player) = self.player.take() {
            player.release();
        }
        self.error = Some(error);
        self.state = SlotState::Errored;
    }

    pub(crate) fn play(&mut self, muted: bool) {
        if let Some(player) = self.player.as_mut() {
            player.set_muted(muted);
            player.play();
            self.muted = muted;
            self.state = SlotState::Playing;
        }
    }

    /// Pause and mute. No-op unless the slot is playing; a `Ready` slot is
    /// already muted and stopped.
    pub(crate) fn pause(&mut self) {
        if self.state != SlotState::Playing {
            return;
        }
        if let Some(player) = self.player.as_mut() {
            player.pause();
            player.set_muted(true);
        }
        self.muted = true;
        self.state = SlotState::Paused;
    }

    pub(crate) fn set_muted(&mut self, muted: bool) {
        if let Some(player) = self.player.as_mut() {
            player.set_muted(muted);
        }
        self.muted = muted;
    }

    /// Unbind and free the decoder.
    pub(crate) fn release(&mut self) {
        if let Some(mut player) = self.player.take() {
            player.release();
        }
        self.binding = None;
        self.state = SlotState::Idle;
        self.muted = true;
        self.ticket = None;
        self.error = None;
    }

    fn bind(&mut self, item_id: &ItemId, ordinal: usize) {
        self.release();
        self.binding = Some(Binding {
            item_id: Arc::clone(item_id),
            ordinal,
        });
    }
}

/// How [`PlayerSlotPool::acquire`] found a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    /// The item was already bound to this slot.
    Existing,
    /// An unbound slot was used.
    Free,
    /// The slot was taken from another item.
    Evicted(ItemId),
}

/// Fixed-size pool of player slots. Owned and written only by the scheduler.
#[derive(Debug)]
pub struct PlayerSlotPool {
    slots: Vec<PlayerSlot>,
}

impl PlayerSlotPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(PlayerSlot::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: SlotId) -> Option<&PlayerSlot> {
        self.slots.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerSlot> {
        self.slots.iter()
    }

    pub(crate) fn get_mut(&mut self, id: SlotId) -> Option<&mut PlayerSlot> {
        self.slots.get_mut(id)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlayerSlot> {
        self.slots.iter_mut()
    }

    pub fn slot_for(&self, item_id: &str) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|s| s.item_id().is_some_and(|id| &**id == item_id))
            .map(|s| s.id)
    }

    pub fn count_in(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    /// Bound slot whose item is farthest from `target` by ordinal.
    /// Ties go to the lowest slot id.
    pub fn eviction_candidate(&self, target: usize) -> Option<SlotId> {
        let mut best: Option<(usize, SlotId)> = None;
        for slot in &self.slots {
            let Some(ordinal) = slot.ordinal() else {
                continue;
            };
            let distance = ordinal.abs_diff(target);
            match best {
                Some((d, _)) if distance <= d => {}
                _ => best = Some((distance, slot.id)),
            }
        }
        best.map(|(_, id)| id)
    }

    /// Find a slot for `item_id`: its existing binding, else a free slot,
    /// else the eviction candidate relative to `ordinal`.
    pub(crate) fn acquire(&mut self, item_id: &ItemId, ordinal: usize) -> Option<(SlotId, Acquired)> {
        if let Some(id) = self.slot_for(item_id) {
            if let Some(slot) = self.slots.get_mut(id) {
                if let Some(binding) = slot.binding.as_mut() {
                    binding.ordinal = ordinal;
                }
            }
            return Some((id, Acquired::Existing));
        }

        if let Some(slot) = self.slots.iter_mut().find(|s| s.binding.is_none()) {
            slot.bind(item_id, ordinal);
            return Some((slot.id, Acquired::Free));
        }

        let victim = self.eviction_candidate(ordinal)?;
        let slot = self.slots.get_mut(victim)?;
        let evicted = slot.item_id().cloned()?;
        tracing::debug!(
            slot_id = victim,
            evicted = %evicted,
            item_id = %item_id,
            "Evicting farthest slot binding"
        );
        slot.bind(item_id, ordinal);
        Some((victim, Acquired::Evicted(evicted)))
    }

    /// Rewrite the ordinal of a bound item. Returns false if it is not bound.
    pub(crate) fn update_ordinal(&mut self, item_id: &str, ordinal: usize) -> bool {
        for slot in &mut self.slots {
            if let Some(binding) = slot.binding.as_mut() {
                if &*binding.item_id == item_id {
                    binding.ordinal = ordinal;
                    return true;
                }
            }
        }
        false
    }
}

//! Feed playback scheduling.
//!
//! Exactly one feed item plays at a time. Video decoders are expensive, so a
//! small fixed pool of player slots is rebound as the user scrolls:
//!
//! - [`media`] - boundary to the rendering layer that actually opens decoders
//! - [`pool`] - the bounded slot pool and per-slot state machine
//! - [`scheduler`] - picks the active item, drives the pool, discards stale loads

pub mod media;
pub mod pool;
pub mod scheduler;

pub use media::{MediaError, MediaOpener, Player, PlayerHandle};
pub use pool::{PlayerSlot, PlayerSlotPool, SlotId, SlotSnapshot, SlotState};
pub use scheduler::{LoadRequest, PlaybackScheduler};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from opening a media reference.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media not found")]
    NotFound,
    #[error("Media open timed out")]
    Timeout,
    #[error("Unsupported media: {0}")]
    Unsupported(String),
    #[error("Failed to open media: {0}")]
    Open(String),
}

/// A decoder handle owned by one player slot.
///
/// All calls happen on the event loop. `release` is called exactly once
/// before the handle is dropped, including for handles whose load was
/// superseded and never played.
pub trait Player: Send + std::fmt::Debug {
    fn play(&mut self);
    fn pause(&mut self);
    fn set_muted(&mut self, muted: bool);
    fn release(&mut self);
}

pub type PlayerHandle = Box<dyn Player>;

/// Rendering-layer primitive that turns a media reference into a player.
///
/// Opening is asynchronous and cannot be cancelled; superseded opens are
/// discarded when they complete.
#[async_trait]
pub trait MediaOpener: Send + Sync {
    async fn open(&self, media_ref: &str) -> Result<PlayerHandle, MediaError>;
}

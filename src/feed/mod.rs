//! Listing feed data and the marketplace API.
//!
//! - [`model`] - feed items, counters, and the ordered in-memory store
//! - [`api`] - the backend trait and its HTTP implementation

pub mod api;
pub mod model;

pub use api::{ApiError, FeedBackend, FeedPage, HttpBackend, ToggleOutcome};
pub use model::{
    FeedItem, FeedStore, InteractionKind, ItemId, ItemStats, ListingCategory, LocalFlags,
};

//! Playback scheduling core for a swipeable short-form video listing feed.
//!
//! One item plays at a time out of a small pool of reusable player slots.
//! Scroll geometry drives a viewability detector, the most visible item is
//! activated, views are counted once after a dwell period, and like/save
//! taps are applied optimistically and debounced before reaching the server.
//!
//! [`controller::FeedController`] wires the pieces together for one feed
//! screen; [`session`] drives it headlessly from line commands.

pub mod config;
pub mod controller;
pub mod engagement;
pub mod feed;
pub mod focus;
pub mod playback;
pub mod session;
pub mod util;
pub mod viewability;

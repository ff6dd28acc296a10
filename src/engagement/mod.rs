//! User-engagement reporting: view counting and like/save toggles.

pub mod interaction;
pub mod timer;
pub mod views;

pub use interaction::{InteractionCoordinator, InteractionError, PendingInteraction};
pub use timer::{DebounceTimer, TimerState};
pub use views::{spawn_view_report, ViewRecord, ViewTracker};

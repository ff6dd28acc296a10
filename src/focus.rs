use crate::feed::FeedStore;
use crate::playback::{LoadRequest, PlaybackScheduler};
use tokio::sync::watch;

/// Effect of a focus change on playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusChange {
    /// Same state as before; nothing happened.
    Unchanged,
    /// Lost focus; every slot was paused.
    Suspended,
    /// Regained focus. `index` is the remembered active item, if any.
    Resumed {
        index: Option<usize>,
        load: Option<LoadRequest>,
    },
}

/// Binary focus signal that short-circuits the scheduler to all-paused.
///
/// Resuming reactivates the item that was active before focus was lost, not
/// whatever is most visible now.
#[derive(Debug)]
pub struct FocusGate {
    tx: watch::Sender<bool>,
}

impl FocusGate {
    pub fn new(focused: bool) -> Self {
        Self {
            tx: watch::Sender::new(focused),
        }
    }

    pub fn is_focused(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn apply(
        &mut self,
        focused: bool,
        scheduler: &mut PlaybackScheduler,
        store: &FeedStore,
    ) -> FocusChange {
        if !self.tx.send_if_modified(|current| std::mem::replace(current, focused) != focused) {
            return FocusChange::Unchanged;
        }

        if !focused {
            tracing::debug!(active = ?scheduler.active_index(), "Feed lost focus");
            scheduler.pause_all();
            return FocusChange::Suspended;
        }

        let index = scheduler.active_index();
        tracing::debug!(active = ?index, "Feed regained focus");
        let load = index.and_then(|i| scheduler.set_active_index(i, store));
        FocusChange::Resumed { index, load }
    }
}

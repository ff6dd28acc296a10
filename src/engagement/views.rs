//! At-most-once view counting.
//!
//! A view is counted when the active item has stayed viewable for the dwell
//! threshold. The `reported` latch is set before the request is issued, so
//! repeated dwell checks and slow or failing requests never produce a second
//! increment for the same item in one session.

use crate::feed::{FeedBackend, ItemId};
use crate::util::catch_task_panic;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRecord {
    pub item_id: ItemId,
    /// Cleared when the item leaves visibility.
    pub dwell_started_at: Option<Instant>,
    /// One-way latch; never reset for the life of the session.
    pub reported: bool,
}

#[derive(Debug)]
pub struct ViewTracker {
    records: HashMap<ItemId, ViewRecord>,
    viewable: HashSet<ItemId>,
    threshold: Duration,
    suspended: bool,
}

impl ViewTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            records: HashMap::new(),
            viewable: HashSet::new(),
            threshold,
            suspended: false,
        }
    }

    pub fn record(&self, item_id: &str) -> Option<&ViewRecord> {
        self.records.get(item_id)
    }

    pub fn reported_count(&self) -> usize {
        self.records.values().filter(|r| r.reported).count()
    }

    /// Apply a visibility snapshot given as the ids that are viewable now.
    ///
    /// Newly viewable items start their dwell clock; items that left lose it.
    pub fn on_snapshot<I>(&mut self, viewable: I, now: Instant)
    where
        I: IntoIterator<Item = ItemId>,
    {
        let next: HashSet<ItemId> = viewable.into_iter().collect();

        for gone in self.viewable.difference(&next) {
            if let Some(record) = self.records.get_mut(gone) {
                record.dwell_started_at = None;
            }
        }

        for id in &next {
            let record = self
                .records
                .entry(Arc::clone(id))
                .or_insert_with(|| ViewRecord {
                    item_id: Arc::clone(id),
                    dwell_started_at: None,
                    reported: false,
                });
            if !self.suspended && record.dwell_started_at.is_none() {
                record.dwell_started_at = Some(now);
            }
        }

        self.viewable = next;
    }

    /// Latch and return `active` if it has dwelled long enough and was not
    /// reported yet. The caller issues the increment.
    pub fn check_dwell(&mut self, active: Option<&ItemId>, now: Instant) -> Option<ItemId> {
        if self.suspended {
            return None;
        }
        let record = self.records.get_mut(active?)?;
        if record.reported {
            return None;
        }
        let started = record.dwell_started_at?;
        if now.saturating_duration_since(started) < self.threshold {
            return None;
        }
        record.reported = true;
        tracing::debug!(item_id = %record.item_id, "View dwell threshold reached");
        Some(Arc::clone(&record.item_id))
    }

    /// Stop all dwell clocks while the feed is not in focus.
    pub fn suspend(&mut self) {
        self.suspended = true;
        for record in self.records.values_mut() {
            record.dwell_started_at = None;
        }
    }

    /// Restart dwell clocks for items still viewable.
    pub fn resume(&mut self, now: Instant) {
        self.suspended = false;
        for id in &self.viewable {
            if let Some(record) = self.records.get_mut(id) {
                record.dwell_started_at.get_or_insert(now);
            }
        }
    }
}

/// Fire-and-forget view increment. Failures are logged and dropped.
pub fn spawn_view_report(backend: Arc<dyn FeedBackend>, item_id: ItemId) -> JoinHandle<()> {
    tokio::spawn(async move {
        match catch_task_panic(backend.increment_view(&item_id)).await {
            Ok(Ok(())) => {
                tracing::debug!(item_id = %item_id, "View reported");
            }
            Ok(Err(e)) => {
                tracing::debug!(item_id = %item_id, error = %e, "View report failed, dropping");
            }
            Err(panic_msg) => {
                tracing::error!(task = "view_report", item_id = %item_id, error = %panic_msg, "Background task panicked");
            }
        }
    })
}

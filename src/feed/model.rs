use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque listing identifier.
///
/// `Arc<str>` so ids can be handed to slots, records, and background tasks
/// without copying the string.
pub type ItemId = Arc<str>;

// ============================================================================
// Listing Types
// ============================================================================

/// Marketplace category a listing belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingCategory {
    Vehicle,
    Animal,
    Property,
    #[default]
    #[serde(other)]
    Other,
}

/// User toggle that has a server-side counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Like,
    Save,
}

impl InteractionKind {
    /// Path segment used by the toggle endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionKind::Like => "like",
            InteractionKind::Save => "save",
        }
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last server-confirmed counters for a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemStats {
    pub views: u64,
    pub likes: u64,
    pub saves: u64,
}

impl ItemStats {
    pub fn count(&self, kind: InteractionKind) -> u64 {
        match kind {
            InteractionKind::Like => self.likes,
            InteractionKind::Save => self.saves,
        }
    }

    pub fn set_count(&mut self, kind: InteractionKind, count: u64) {
        match kind {
            InteractionKind::Like => self.likes = count,
            InteractionKind::Save => self.saves = count,
        }
    }
}

/// Optimistic per-user state and the counters displayed next to it.
///
/// May diverge from [`ItemStats`] while a toggle is pending; reconciled
/// with the server response or rolled back on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalFlags {
    pub liked: bool,
    pub saved: bool,
    pub like_count: u64,
    pub save_count: u64,
}

impl LocalFlags {
    pub fn flag(&self, kind: InteractionKind) -> bool {
        match kind {
            InteractionKind::Like => self.liked,
            InteractionKind::Save => self.saved,
        }
    }

    pub fn count(&self, kind: InteractionKind) -> u64 {
        match kind {
            InteractionKind::Like => self.like_count,
            InteractionKind::Save => self.save_count,
        }
    }

    pub fn set(&mut self, kind: InteractionKind, flag: bool, count: u64) {
        match kind {
            InteractionKind::Like => {
                self.liked = flag;
                self.like_count = count;
            }
            InteractionKind::Save => {
                self.saved = flag;
                self.save_count = count;
            }
        }
    }

    /// Copy one kind's flag and counter from `other`.
    pub fn copy_kind(&mut self, other: &LocalFlags, kind: InteractionKind) {
        self.set(kind, other.flag(kind), other.count(kind));
    }
}

/// A listing in the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: ItemId,
    /// Current position in the feed. Rewritten whenever the list reloads.
    pub ordinal: usize,
    /// Validated media URL; `None` renders a placeholder.
    pub media_ref: Option<String>,
    pub title: Option<String>,
    pub category: ListingCategory,
    pub server_stats: ItemStats,
    pub local: LocalFlags,
    pub created_at: Option<DateTime<Utc>>,
}

impl FeedItem {
    /// Build an item whose local state mirrors the server counters.
    pub fn new(id: impl Into<ItemId>, media_ref: Option<String>, stats: ItemStats) -> Self {
        Self {
            id: id.into(),
            ordinal: 0,
            media_ref,
            title: None,
            category: ListingCategory::default(),
            server_stats: stats,
            local: LocalFlags {
                liked: false,
                saved: false,
                like_count: stats.likes,
                save_count: stats.saves,
            },
            created_at: None,
        }
    }

    pub fn with_flags(mut self, liked: bool, saved: bool) -> Self {
        self.local.liked = liked;
        self.local.saved = saved;
        self
    }
}

// ============================================================================
// Feed Store
// ============================================================================

/// Ordered working set of feed items with an id → position index.
///
/// Ordinals always equal the item's position in `items`.
#[derive(Debug, Default)]
pub struct FeedStore {
    items: Vec<FeedItem>,
    positions: HashMap<ItemId, usize>,
}

impl FeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&FeedItem> {
        self.positions.get(id).and_then(|&i| self.items.get(i))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut FeedItem> {
        match self.positions.get(id) {
            Some(&i) => self.items.get_mut(i),
            None => None,
        }
    }

    pub fn at(&self, index: usize) -> Option<&FeedItem> {
        self.items.get(index)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeedItem> {
        self.items.iter()
    }

    /// Append a page of items, skipping ids already present.
    ///
    /// Returns the number of items actually added.
    pub fn append(&mut self, items: Vec<FeedItem>) -> usize {
        let before = self.items.len();
        for mut item in items {
            if self.positions.contains_key(&item.id) {
                tracing::debug!(item_id = %item.id, "Skipping duplicate listing in page");
                continue;
            }
            item.ordinal = self.items.len();
            self.positions.insert(Arc::clone(&item.id), item.ordinal);
            self.items.push(item);
        }
        self.items.len() - before
    }

    /// Replace the whole list, rewriting every ordinal.
    ///
    /// For surviving ids where `keep_local(id, kind)` is true, the previous
    /// optimistic flag and counter for that kind are carried over instead of
    /// the fresh server values. Returns ids that are no longer in the feed.
    pub fn replace_with<F>(&mut self, items: Vec<FeedItem>, keep_local: F) -> Vec<ItemId>
    where
        F: Fn(&str, InteractionKind) -> bool,
    {
        let mut previous: HashMap<ItemId, LocalFlags> = self
            .items
            .drain(..)
            .map(|item| (item.id, item.local))
            .collect();
        self.positions.clear();

        for mut item in items {
            if self.positions.contains_key(&item.id) {
                continue;
            }
            if let Some(old) = previous.remove(&item.id) {
                for kind in [InteractionKind::Like, InteractionKind::Save] {
                    if keep_local(&item.id, kind) {
                        item.local.copy_kind(&old, kind);
                    }
                }
            }
            item.ordinal = self.items.len();
            self.positions.insert(Arc::clone(&item.id), item.ordinal);
            self.items.push(item);
        }

        previous.into_keys().collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.positions.clear();
    }
}

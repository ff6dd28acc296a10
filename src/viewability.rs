//! Scroll-driven viewability detection.
//!
//! Computes which feed indices are "viewable" (visible-area fraction at or
//! above a threshold, held continuously for a stabilization period) from the
//! item geometry and scroll position. Output is a full snapshot each time the
//! viewable set changes; consumers diff against their own previous set.
//!
//! Per-index state lives in an arena reused across scroll events. Only the
//! contiguous range of items intersecting the viewport is visited.

use std::ops::Range;
use std::time::Duration;
use tokio::time::Instant;

/// Position and length of one rendered item along the scroll axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemGeometry {
    pub offset: f32,
    pub length: f32,
}

impl ItemGeometry {
    fn end(&self) -> f32 {
        self.offset + self.length
    }
}

/// The visible window of the scroll list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scroll_offset: f32,
    pub length: f32,
}

impl Viewport {
    fn end(&self) -> f32 {
        self.scroll_offset + self.length
    }
}

/// Fraction of `item` inside `viewport`, in `0.0..=1.0`.
///
/// Degenerate items or viewports (zero or negative length) are never visible.
pub fn visible_fraction(item: ItemGeometry, viewport: Viewport) -> f32 {
    if item.length <= 0.0 || viewport.length <= 0.0 {
        return 0.0;
    }
    let start = item.offset.max(viewport.scroll_offset);
    let end = item.end().min(viewport.end());
    ((end - start).max(0.0) / item.length).clamp(0.0, 1.0)
}

/// Indices of items intersecting the viewport. `geometry` must be sorted by offset.
fn intersecting(geometry: &[ItemGeometry], viewport: Viewport) -> Range<usize> {
    let start = geometry.partition_point(|g| g.end() <= viewport.scroll_offset);
    let len = geometry[start..]
        .iter()
        .take_while(|g| g.offset < viewport.end())
        .count();
    start..start + len
}

/// Visibility of one index at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewToken {
    pub index: usize,
    pub is_viewable: bool,
    pub visible_fraction: f32,
}

/// Every item currently intersecting the viewport, in scroll order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisibilitySnapshot {
    pub tokens: Vec<ViewToken>,
}

impl VisibilitySnapshot {
    pub fn new(tokens: Vec<ViewToken>) -> Self {
        Self { tokens }
    }

    pub fn viewable_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.tokens.iter().filter(|t| t.is_viewable).map(|t| t.index)
    }

    /// The most visible viewable index; ties go to the first in scroll order.
    pub fn primary_index(&self) -> Option<usize> {
        let mut best: Option<&ViewToken> = None;
        for token in self.tokens.iter().filter(|t| t.is_viewable) {
            match best {
                Some(b) if token.visible_fraction <= b.visible_fraction => {}
                _ => best = Some(token),
            }
        }
        best.map(|t| t.index)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct IndexState {
    fraction: f32,
    above_since: Option<Instant>,
    viewable: bool,
}

/// Stateful viewability tracker for one scroll list.
#[derive(Debug)]
pub struct ViewabilityDetector {
    threshold: f32,
    stabilization: Duration,
    arena: Vec<IndexState>,
    in_range: Range<usize>,
    dirty: bool,
}

impl ViewabilityDetector {
    /// `threshold` is the minimum visible fraction; `stabilization` is how long
    /// an index must stay above it before it counts as viewable.
    pub fn new(threshold: f32, stabilization: Duration) -> Self {
        Self {
            threshold: threshold.clamp(f32::MIN_POSITIVE, 1.0),
            stabilization,
            arena: Vec::new(),
            in_range: 0..0,
            dirty: false,
        }
    }

    /// Feed a scroll event. Returns a snapshot if the viewable set changed.
    pub fn observe(
        &mut self,
        geometry: &[ItemGeometry],
        viewport: Viewport,
        now: Instant,
    ) -> Option<VisibilitySnapshot> {
        if self.arena.len() != geometry.len() {
            if self.arena.iter().skip(geometry.len()).any(|s| s.viewable) {
                self.dirty = true;
            }
            self.arena.resize(geometry.len(), IndexState::default());
            self.in_range.end = self.in_range.end.min(geometry.len());
            self.in_range.start = self.in_range.start.min(self.in_range.end);
        }

        let range = intersecting(geometry, viewport);

        // Items that scrolled out lose their clock entirely
        for i in self.in_range.clone() {
            if !range.contains(&i) {
                if self.arena[i].viewable {
                    self.dirty = true;
                }
                self.arena[i] = IndexState::default();
            }
        }

        for i in range.clone() {
            let fraction = visible_fraction(geometry[i], viewport);
            let state = &mut self.arena[i];
            state.fraction = fraction;
            if fraction >= self.threshold {
                state.above_since.get_or_insert(now);
            } else {
                state.above_since = None;
            }
        }
        self.in_range = range;

        self.evaluate(now)
    }

    /// Re-evaluate stabilization without a scroll event.
    pub fn tick(&mut self, now: Instant) -> Option<VisibilitySnapshot> {
        self.evaluate(now)
    }

    /// How long `index` has continuously been above the threshold.
    pub fn dwell(&self, index: usize, now: Instant) -> Option<Duration> {
        self.arena
            .get(index)
            .and_then(|s| s.above_since)
            .map(|since| now.saturating_duration_since(since))
    }

    /// Forget all per-index state, e.g. after the list reloads.
    pub fn reset(&mut self) {
        self.arena.clear();
        self.in_range = 0..0;
        self.dirty = false;
    }

    fn evaluate(&mut self, now: Instant) -> Option<VisibilitySnapshot> {
        for i in self.in_range.clone() {
            let state = &mut self.arena[i];
            let viewable = state
                .above_since
                .is_some_and(|since| now.saturating_duration_since(since) >= self.stabilization);
            if viewable != state.viewable {
                state.viewable = viewable;
                self.dirty = true;
            }
        }

        if !self.dirty {
            return None;
        }
        self.dirty = false;

        let tokens = self
            .in_range
            .clone()
            .map(|index| {
                let state = &self.arena[index];
                ViewToken {
                    index,
                    is_viewable: state.viewable,
                    visible_fraction: state.fraction,
                }
            })
            .collect();
        Some(VisibilitySnapshot::new(tokens))
    }
}

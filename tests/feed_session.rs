//! End-to-end tests for the feed controller.
//!
//! A fake listing backend and a fake media opener stand in for the network
//! and the decoder. Time is paused, so debounce, dwell, and load latency are
//! deterministic. Background results are pumped through the controller the
//! same way the headless session does it.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use reelfeed::config::FeedSettings;
use reelfeed::controller::{FeedController, FeedEvent, Notice};
use reelfeed::feed::{
    ApiError, FeedBackend, FeedItem, FeedPage, InteractionKind, ItemStats, ToggleOutcome,
};
use reelfeed::playback::{MediaError, MediaOpener, Player, PlayerHandle, SlotState};
use reelfeed::session::Session;
use reelfeed::viewability::{ItemGeometry, Viewport};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const PAGE: f32 = 1000.0;
const STABILIZE: Duration = Duration::from_millis(100);

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeBackend {
    pages: Mutex<VecDeque<Result<FeedPage, ApiError>>>,
    cursors: Mutex<Vec<Option<String>>>,
    views: Mutex<Vec<String>>,
    toggles: Mutex<Vec<(String, InteractionKind, bool)>>,
    fail_toggles: bool,
}

impl FakeBackend {
    fn with_pages(pages: Vec<Result<FeedPage, ApiError>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            ..Self::default()
        }
    }

    fn views(&self) -> Vec<String> {
        self.views.lock().unwrap().clone()
    }

    fn toggles(&self) -> Vec<(String, InteractionKind, bool)> {
        self.toggles.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedBackend for FakeBackend {
    async fn fetch_page(&self, cursor: Option<&str>, _limit: usize) -> Result<FeedPage, ApiError> {
        self.cursors.lock().unwrap().push(cursor.map(str::to_string));
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(FeedPage::default()))
    }

    async fn increment_view(&self, item_id: &str) -> Result<(), ApiError> {
        self.views.lock().unwrap().push(item_id.to_string());
        Ok(())
    }

    async fn set_interaction(
        &self,
        item_id: &str,
        kind: InteractionKind,
        desired: bool,
    ) -> Result<ToggleOutcome, ApiError> {
        self.toggles
            .lock()
            .unwrap()
            .push((item_id.to_string(), kind, desired));
        if self.fail_toggles {
            return Err(ApiError::HttpStatus(500));
        }
        Ok(ToggleOutcome {
            count: if desired { 12 } else { 11 },
            state: desired,
        })
    }
}

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Debug)]
struct RecordingPlayer {
    name: String,
    log: Log,
}

impl RecordingPlayer {
    fn record(&self, what: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, what));
    }
}

impl Player for RecordingPlayer {
    fn play(&mut self) {
        self.record("play");
    }
    fn pause(&mut self) {
        self.record("pause");
    }
    fn set_muted(&mut self, _muted: bool) {}
    fn release(&mut self) {
        self.record("release");
    }
}

#[derive(Default)]
struct FakeOpener {
    latency: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    log: Log,
    opening: AtomicUsize,
    peak_opening: AtomicUsize,
}

impl FakeOpener {
    fn set_latency(&self, id: &str, latency: Duration) {
        self.latency.lock().unwrap().insert(id.to_string(), latency);
    }

    fn set_failing(&self, id: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    fn logged(&self, entry: &str) -> bool {
        self.log.lock().unwrap().iter().any(|e| e == entry)
    }
}

#[async_trait]
impl MediaOpener for FakeOpener {
    async fn open(&self, media_ref: &str) -> Result<PlayerHandle, MediaError> {
        let name = media_ref
            .rsplit('/')
            .next()
            .unwrap_or(media_ref)
            .trim_end_matches(".mp4")
            .to_string();
        let latency = self.latency.lock().unwrap().get(&name).copied();
        let opening = self.opening.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_opening.fetch_max(opening, Ordering::SeqCst);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.opening.fetch_sub(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&name) {
            return Err(MediaError::NotFound);
        }
        Ok(Box::new(RecordingPlayer {
            name,
            log: Arc::clone(&self.log),
        }))
    }
}

// ============================================================================
// Harness
// ============================================================================

fn listing(id: &str, likes: u64) -> FeedItem {
    FeedItem::new(
        id,
        Some(format!("https://cdn.example.com/{id}.mp4")),
        ItemStats {
            views: 0,
            likes,
            saves: 0,
        },
    )
}

fn page(ids: &[&str], next_cursor: Option<&str>) -> Result<FeedPage, ApiError> {
    Ok(FeedPage {
        items: ids.iter().map(|id| listing(id, 11)).collect(),
        next_cursor: next_cursor.map(str::to_string),
    })
}

fn numbered(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("item-{i}")).collect()
}

fn numbered_page(count: usize) -> Result<FeedPage, ApiError> {
    let ids = numbered(count);
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    page(&refs, None)
}

struct Feed {
    controller: FeedController,
    rx: mpsc::Receiver<FeedEvent>,
    tx: mpsc::Sender<FeedEvent>,
    backend: Arc<FakeBackend>,
    opener: Arc<FakeOpener>,
}

impl Feed {
    async fn start(backend: FakeBackend, settings: FeedSettings) -> Self {
        let backend = Arc::new(backend);
        let opener = Arc::new(FakeOpener::default());
        let (tx, rx) = mpsc::channel(64);
        let controller = FeedController::new(settings, backend.clone(), opener.clone(), tx.clone());
        let mut feed = Self {
            controller,
            rx,
            tx,
            backend,
            opener,
        };
        feed.controller.load_initial();
        feed.pump_until(|c| !c.is_loading()).await;
        feed
    }

    /// Handle one background event; returns its kind.
    async fn pump(&mut self) -> &'static str {
        let event = self.rx.recv().await.expect("event channel closed");
        let kind = match &event {
            FeedEvent::MediaOpened { .. } => "media",
            FeedEvent::PlaybackFailed { .. } => "playback",
            FeedEvent::DebounceElapsed { .. } => "debounce",
            FeedEvent::InteractionSettled { .. } => "interaction",
            FeedEvent::PageLoaded { .. } => "page",
        };
        self.controller.handle_event(event);
        kind
    }

    async fn pump_until(&mut self, done: impl Fn(&FeedController) -> bool) {
        while !done(&self.controller) {
            self.pump().await;
        }
    }

    async fn pump_media(&mut self, count: usize) {
        let mut seen = 0;
        while seen < count {
            if self.pump().await == "media" {
                seen += 1;
            }
        }
    }

    fn geometry(&self) -> Vec<ItemGeometry> {
        (0..self.controller.store().len())
            .map(|i| ItemGeometry {
                offset: i as f32 * PAGE,
                length: PAGE,
            })
            .collect()
    }

    /// Scroll so `index` fills the viewport and let viewability stabilize.
    async fn show(&mut self, index: usize) {
        let viewport = Viewport {
            scroll_offset: index as f32 * PAGE,
            length: PAGE,
        };
        let geometry = self.geometry();
        self.controller.on_scroll(&geometry, viewport, Instant::now());
        tokio::time::advance(STABILIZE).await;
        self.controller.tick(Instant::now());
    }

    /// Tick the controller every 50ms for `total`.
    async fn run_ticks(&mut self, total: Duration) {
        let step = Duration::from_millis(50);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            tokio::time::advance(step).await;
            self.controller.tick(Instant::now());
            elapsed += step;
        }
        // Let fire-and-forget tasks run
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn playing(&self) -> Vec<String> {
        self.controller
            .scheduler()
            .pool()
            .iter()
            .filter(|s| s.state() == SlotState::Playing)
            .filter_map(|s| s.item_id().map(|id| id.to_string()))
            .collect()
    }

    fn state_of(&self, item_id: &str) -> Option<SlotState> {
        let pool = self.controller.scheduler().pool();
        pool.slot_for(item_id)
            .and_then(|slot| pool.get(slot))
            .map(|slot| slot.state())
    }
}

// ============================================================================
// Playback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_most_visible_item_plays() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(5)]), FeedSettings::default()).await;
    assert_eq!(feed.controller.store().len(), 5);

    feed.show(0).await;
    feed.pump_media(1).await;
    assert_eq!(feed.controller.active_index(), Some(0));
    assert_eq!(feed.playing(), vec!["item-0".to_string()]);

    feed.show(1).await;
    feed.pump_media(1).await;
    assert_eq!(feed.playing(), vec!["item-1".to_string()]);
    assert_eq!(feed.state_of("item-0"), Some(SlotState::Paused));
}

#[tokio::test(start_paused = true)]
async fn test_slow_load_for_skipped_item_never_plays() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(10)]), FeedSettings::default()).await;
    feed.opener.set_latency("item-3", Duration::from_secs(2));
    feed.opener.set_latency("item-7", Duration::from_millis(100));

    feed.show(3).await;
    feed.show(7).await;
    assert_eq!(feed.controller.active_index(), Some(7));

    feed.pump_media(2).await;

    assert_eq!(feed.playing(), vec!["item-7".to_string()]);
    assert_eq!(feed.state_of("item-3"), Some(SlotState::Idle));
    assert!(feed.opener.logged("item-3:release"));
    assert!(!feed.opener.logged("item-3:play"));
}

#[tokio::test(start_paused = true)]
async fn test_full_pool_evicts_farthest_binding() {
    let settings = FeedSettings {
        slot_count: 2,
        ..FeedSettings::default()
    };
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(21)]), settings).await;

    for index in [5, 9, 20] {
        feed.show(index).await;
        feed.pump_media(1).await;
    }

    let pool = feed.controller.scheduler().pool();
    assert_eq!(pool.slot_for("item-5"), None);
    assert!(pool.slot_for("item-9").is_some());
    assert!(pool.slot_for("item-20").is_some());
    assert!(feed.opener.logged("item-5:release"));
    assert_eq!(feed.playing(), vec!["item-20".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_focus_resume_restores_previous_item() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(8)]), FeedSettings::default()).await;
    feed.show(4).await;
    feed.pump_media(1).await;
    assert_eq!(feed.playing(), vec!["item-4".to_string()]);

    feed.controller.on_focus_changed(false, Instant::now());
    assert!(feed.playing().is_empty());

    // Scrolled while away: index 6 is now the most visible
    feed.show(6).await;
    assert_eq!(feed.controller.active_index(), Some(4));

    feed.controller.on_focus_changed(true, Instant::now());
    assert_eq!(feed.controller.active_index(), Some(4));
    assert_eq!(feed.playing(), vec!["item-4".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_errored_slot_recovers_on_retry() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(3)]), FeedSettings::default()).await;
    feed.opener.set_failing("item-0", true);

    feed.show(0).await;
    feed.pump_media(1).await;
    let slot = feed.controller.scheduler().active_slot().unwrap();
    assert_eq!(feed.state_of("item-0"), Some(SlotState::Errored));
    assert_eq!(
        feed.controller.scheduler().pool().get(slot).unwrap().error(),
        Some(&MediaError::NotFound)
    );

    feed.opener.set_failing("item-0", false);
    assert!(feed.controller.retry(slot));
    assert_eq!(feed.state_of("item-0"), Some(SlotState::Loading));
    feed.pump_media(1).await;
    assert_eq!(feed.playing(), vec!["item-0".to_string()]);

    assert!(!feed.controller.retry(slot));
}

#[tokio::test(start_paused = true)]
async fn test_placeholder_item_is_active_without_slot() {
    let backend = FakeBackend::with_pages(vec![Ok(FeedPage {
        items: vec![
            FeedItem::new("no-media", None, ItemStats::default()),
            listing("item-1", 0),
        ],
        next_cursor: None,
    })]);
    let mut feed = Feed::start(backend, FeedSettings::default()).await;

    feed.show(0).await;
    assert_eq!(feed.controller.active_index(), Some(0));
    assert_eq!(feed.controller.scheduler().active_slot(), None);
    assert!(feed.controller.toggle_like("no-media"));
}

#[tokio::test(start_paused = true)]
async fn test_mute_applies_to_active_slot_only() {
    let settings = FeedSettings {
        muted_by_default: true,
        ..FeedSettings::default()
    };
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(3)]), settings).await;
    let slot0 = feed.controller.subscribe_slot(0).unwrap();

    feed.show(0).await;
    feed.pump_media(1).await;
    assert!(slot0.borrow().muted);

    feed.controller.set_muted(false);
    assert!(!slot0.borrow().muted);

    feed.show(1).await;
    feed.pump_media(1).await;
    assert!(slot0.borrow().muted);
    let active = feed.controller.scheduler().active_slot().unwrap();
    assert!(feed.controller.scheduler().pool().get(active).unwrap().is_muted());
}

#[tokio::test(start_paused = true)]
async fn test_swiping_back_and_forth_reuses_in_flight_opens() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(10)]), FeedSettings::default()).await;
    feed.opener.set_latency("item-3", Duration::from_secs(2));
    feed.opener.set_latency("item-7", Duration::from_secs(2));

    for _ in 0..5 {
        feed.show(3).await;
        feed.show(7).await;
    }
    assert_eq!(feed.controller.active_index(), Some(7));

    feed.pump_media(2).await;
    assert_eq!(feed.opener.peak_opening.load(Ordering::SeqCst), 2);
    assert_eq!(feed.playing(), vec!["item-7".to_string()]);
    assert!(feed.rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_player_failure_mid_playback_then_retry() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(3)]), FeedSettings::default()).await;
    feed.show(0).await;
    feed.pump_media(1).await;
    let slot_id = feed.controller.scheduler().active_slot().unwrap();

    feed.tx
        .send(FeedEvent::PlaybackFailed {
            slot_id,
            item_id: "item-0".into(),
            error: MediaError::Open("decoder lost".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(feed.pump().await, "playback");

    assert_eq!(feed.state_of("item-0"), Some(SlotState::Errored));
    assert!(feed.playing().is_empty());
    assert!(feed.opener.logged("item-0:release"));

    assert!(feed.controller.retry(slot_id));
    feed.pump_media(1).await;
    assert_eq!(feed.playing(), vec!["item-0".to_string()]);
}

// ============================================================================
// View Counting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_view_counted_once_after_dwell() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(3)]), FeedSettings::default()).await;
    feed.show(0).await;
    feed.pump_media(1).await;

    feed.run_ticks(Duration::from_millis(2500)).await;
    assert!(feed.backend.views().is_empty());

    feed.run_ticks(Duration::from_secs(5)).await;
    assert_eq!(feed.backend.views(), vec!["item-0".to_string()]);
    assert!(feed.controller.views().record("item-0").unwrap().reported);
}

#[tokio::test(start_paused = true)]
async fn test_leaving_before_dwell_restarts_clock() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(3)]), FeedSettings::default()).await;
    feed.show(0).await;
    feed.run_ticks(Duration::from_secs(2)).await;

    feed.show(1).await;
    feed.run_ticks(Duration::from_secs(2)).await;
    feed.show(0).await;
    feed.run_ticks(Duration::from_secs(2)).await;
    assert!(feed.backend.views().is_empty());

    feed.run_ticks(Duration::from_millis(1500)).await;
    assert_eq!(feed.backend.views(), vec!["item-0".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_no_dwell_while_unfocused() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(3)]), FeedSettings::default()).await;
    feed.show(0).await;
    feed.controller.on_focus_changed(false, Instant::now());

    feed.run_ticks(Duration::from_secs(10)).await;
    assert!(feed.backend.views().is_empty());

    feed.controller.on_focus_changed(true, Instant::now());
    feed.run_ticks(Duration::from_millis(3100)).await;
    assert_eq!(feed.backend.views(), vec!["item-0".to_string()]);
}

// ============================================================================
// Interactions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rapid_likes_send_one_request_with_final_state() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(2)]), FeedSettings::default()).await;

    for _ in 0..5 {
        assert!(feed.controller.toggle_like("item-0"));
        tokio::time::advance(Duration::from_millis(80)).await;
    }
    let item = feed.controller.item("item-0").unwrap();
    assert!(item.local.liked);
    assert_eq!(item.local.like_count, 12);

    feed.pump_until(|c| c.interactions().pending_count() == 0).await;

    assert_eq!(
        feed.backend.toggles(),
        vec![("item-0".to_string(), InteractionKind::Like, true)]
    );
    let item = feed.controller.item("item-0").unwrap();
    assert!(item.local.liked);
    assert_eq!(item.local.like_count, 12);
    assert_eq!(item.server_stats.likes, 12);
}

#[tokio::test(start_paused = true)]
async fn test_failed_like_rolls_back_and_notifies() {
    let backend = FakeBackend {
        fail_toggles: true,
        ..FakeBackend::with_pages(vec![numbered_page(2)])
    };
    let mut feed = Feed::start(backend, FeedSettings::default()).await;

    feed.controller.toggle_like("item-0");
    let item = feed.controller.item("item-0").unwrap();
    assert_eq!((item.local.liked, item.local.like_count), (true, 12));

    feed.pump_until(|c| c.interactions().pending_count() == 0).await;

    let item = feed.controller.item("item-0").unwrap();
    assert_eq!((item.local.liked, item.local.like_count), (false, 11));

    let notices = feed.controller.drain_notices();
    assert_eq!(notices.len(), 1);
    assert!(matches!(&notices[0], Notice::InteractionReverted(e) if e.kind == InteractionKind::Like));
    assert!(feed.controller.drain_notices().is_empty());
}

// ============================================================================
// Loading
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_next_page_prefetched_near_end() {
    let backend = FakeBackend::with_pages(vec![
        page(&["a", "b", "c", "d", "e"], Some("page-2")),
        page(&["f", "g", "h", "c"], None),
    ]);
    let mut feed = Feed::start(backend, FeedSettings::default()).await;
    assert!(feed.controller.has_more());

    feed.show(0).await;
    assert!(!feed.controller.is_loading());

    feed.show(1).await;
    assert!(feed.controller.is_loading());
    feed.pump_until(|c| !c.is_loading()).await;

    // Duplicate "c" is skipped
    assert_eq!(feed.controller.store().len(), 8);
    assert!(!feed.controller.has_more());
    assert_eq!(
        feed.backend.cursors.lock().unwrap().clone(),
        vec![None, Some("page-2".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_refresh_reindexes_and_releases_removed_items() {
    let backend = FakeBackend::with_pages(vec![
        page(&["a", "b", "c", "d"], None),
        page(&["x", "y", "b"], None),
    ]);
    let mut feed = Feed::start(backend, FeedSettings::default()).await;
    feed.show(0).await;
    feed.pump_media(1).await;
    feed.show(1).await;
    feed.pump_media(1).await;
    assert_eq!(feed.playing(), vec!["b".to_string()]);

    feed.controller.refresh();
    feed.pump_until(|c| !c.is_loading()).await;

    assert_eq!(feed.controller.store().index_of("b"), Some(2));
    assert_eq!(feed.controller.active_index(), Some(2));
    assert_eq!(feed.playing(), vec!["b".to_string()]);
    assert_eq!(feed.controller.scheduler().pool().slot_for("a"), None);
    assert!(feed.opener.logged("a:release"));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_keeps_pending_toggle() {
    let backend = FakeBackend::with_pages(vec![page(&["a", "b"], None), page(&["b", "a"], None)]);
    let mut feed = Feed::start(backend, FeedSettings::default()).await;

    feed.controller.toggle_like("a");
    feed.controller.refresh();
    // The page arrives before the debounce elapses
    assert_eq!(feed.pump().await, "page");

    let a = feed.controller.item("a").unwrap();
    assert_eq!(a.ordinal, 1);
    assert!(a.local.liked);
    assert_eq!(a.local.like_count, 12);
}

#[tokio::test(start_paused = true)]
async fn test_active_item_removed_by_refresh() {
    let backend = FakeBackend::with_pages(vec![page(&["a", "b"], None), page(&["b"], None)]);
    let mut feed = Feed::start(backend, FeedSettings::default()).await;
    feed.show(0).await;
    feed.pump_media(1).await;

    feed.controller.refresh();
    feed.pump_until(|c| !c.is_loading()).await;

    assert_eq!(feed.controller.active_index(), None);
    assert!(feed.playing().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_page_failure_becomes_notice() {
    let backend = FakeBackend::with_pages(vec![Err(ApiError::HttpStatus(503))]);
    let mut feed = Feed::start(backend, FeedSettings::default()).await;

    assert!(feed.controller.store().is_empty());
    let notices = feed.controller.drain_notices();
    assert_eq!(notices.len(), 1);
    assert!(matches!(notices[0], Notice::PageLoadFailed(ApiError::HttpStatus(503))));
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_teardown_releases_slots_and_cancels_timers() {
    let mut feed = Feed::start(FakeBackend::with_pages(vec![numbered_page(3)]), FeedSettings::default()).await;
    feed.show(0).await;
    feed.pump_media(1).await;
    feed.controller.toggle_like("item-1");

    feed.controller.teardown();

    assert_eq!(feed.controller.active_index(), None);
    assert_eq!(feed.controller.scheduler().pool().count_in(SlotState::Idle), 3);
    assert_eq!(feed.controller.interactions().pending_count(), 0);
    assert!(feed.opener.logged("item-0:release"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(feed.backend.toggles().is_empty());
    assert!(feed.rx.try_recv().is_err());
}

// ============================================================================
// Headless Session
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_headless_session_plays_and_reports_state() {
    use tokio::io::AsyncWriteExt;

    let backend = Arc::new(FakeBackend::with_pages(vec![numbered_page(3)]));
    let opener = Arc::new(FakeOpener::default());
    let (tx, rx) = mpsc::channel(64);
    let controller = FeedController::new(FeedSettings::default(), backend.clone(), opener.clone(), tx);
    let mut session = Session::new(controller, rx, Vec::new());

    let (mut input, reader) = tokio::io::duplex(1024);
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        input.write_all(b"like item-0\nstate\nbogus\n").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        input.write_all(b"quit\n").await.unwrap();
        input
    });

    session
        .run(tokio::io::BufReader::new(reader), Duration::from_millis(50))
        .await
        .unwrap();
    drop(writer.await.unwrap());

    let output = String::from_utf8(session.into_output()).unwrap();
    assert!(output.contains("active 0 item-0"), "{output}");
    assert!(output.contains("slot 0 Playing"), "{output}");
    assert!(output.contains("items=3 active=Some(0)"), "{output}");
    assert!(output.contains("item-0 liked=true (12)"), "{output}");
    assert!(output.contains("error: Unknown command: bogus"), "{output}");
    assert!(output.trim_end().ends_with("bye"), "{output}");
    assert_eq!(
        backend.toggles(),
        vec![("item-0".to_string(), InteractionKind::Like, true)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_skips_undecodable_lines() {
    use tokio::io::AsyncWriteExt;

    let backend = Arc::new(FakeBackend::with_pages(vec![numbered_page(3)]));
    let opener = Arc::new(FakeOpener::default());
    let (tx, rx) = mpsc::channel(64);
    let controller = FeedController::new(FeedSettings::default(), backend, opener.clone(), tx);
    let mut session = Session::new(controller, rx, Vec::new());

    let (mut input, reader) = tokio::io::duplex(1024);
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        input.write_all(b"like item-0\n\xff\xfe\nstate\nquit\n").await.unwrap();
        input
    });

    session
        .run(tokio::io::BufReader::new(reader), Duration::from_millis(50))
        .await
        .unwrap();
    drop(writer.await.unwrap());

    assert_eq!(session.controller().active_index(), None);
    assert_eq!(session.controller().interactions().pending_count(), 0);
    assert!(opener.logged("item-0:release"));

    let output = String::from_utf8(session.into_output()).unwrap();
    assert!(output.contains("error: input is not valid UTF-8"), "{output}");
    assert!(output.contains("item-0 liked=true (12)"), "{output}");
    assert!(output.trim_end().ends_with("bye"), "{output}");
}

/// Output sink that starts failing once `broken` is set.
struct BrittleOutput {
    written: Vec<u8>,
    broken: Arc<AtomicBool>,
}

impl std::io::Write for BrittleOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("output closed"));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_tears_down_when_output_fails() {
    use tokio::io::AsyncWriteExt;

    let backend = Arc::new(FakeBackend::with_pages(vec![numbered_page(3)]));
    let opener = Arc::new(FakeOpener::default());
    let (tx, rx) = mpsc::channel(64);
    let controller = FeedController::new(FeedSettings::default(), backend.clone(), opener.clone(), tx);
    let broken = Arc::new(AtomicBool::new(false));
    let out = BrittleOutput {
        written: Vec::new(),
        broken: Arc::clone(&broken),
    };
    let mut session = Session::new(controller, rx, out);

    let (mut input, reader) = tokio::io::duplex(1024);
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        input.write_all(b"like item-0\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        broken.store(true, Ordering::SeqCst);
        input.write_all(b"state\n").await.unwrap();
        input
    });

    let result = session
        .run(tokio::io::BufReader::new(reader), Duration::from_millis(50))
        .await;
    drop(writer.await.unwrap());

    assert!(result.is_err());
    let controller = session.controller();
    assert_eq!(controller.active_index(), None);
    assert_eq!(controller.scheduler().pool().count_in(SlotState::Playing), 0);
    assert_eq!(controller.interactions().pending_count(), 0);
    assert!(opener.logged("item-0:release"));

    // The cancelled debounce never reaches the backend
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(backend.toggles().is_empty());

    let output = String::from_utf8(session.into_output().written).unwrap();
    assert!(output.contains("active 0 item-0"), "{output}");
}

//! End-to-end lifecycle tests driving the recording core through its event
//! channel with a stubbed encoder backend.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use episodic::expand::QueryExpander;
use episodic::{
    AddressBarReader, CapturedFrame, DatabaseManager, EncoderBackend, EncoderSession,
    FinalizeTracker, IntervalIndex, LifecycleManager, PageContext, RecorderConfig, RecorderEvent,
    RecorderHandle,
};
use episodic::video::{CloseStatus, FrameStatus};
use image::DynamicImage;

struct StubBackend {
    opened: Arc<AtomicU64>,
}

struct StubSession {
    frames: u64,
    path: PathBuf,
}

#[async_trait]
impl EncoderBackend for StubBackend {
    async fn open(
        &self,
        _width: u32,
        _height: u32,
        output_path: &Path,
        _seconds_per_frame: i64,
    ) -> episodic::Result<Box<dyn EncoderSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubSession {
            frames: 0,
            path: output_path.to_path_buf(),
        }))
    }
}

#[async_trait]
impl EncoderSession for StubSession {
    async fn push(&mut self, _frame: &CapturedFrame) -> episodic::Result<FrameStatus> {
        self.frames += 1;
        Ok(FrameStatus::Accepted)
    }

    async fn close(
        self: Box<Self>,
        min_frame_count: u64,
        tracker: &FinalizeTracker,
    ) -> episodic::Result<CloseStatus> {
        if self.frames < min_frame_count.max(1) {
            return Ok(CloseStatus::CancelledTooShort);
        }
        tracker.track(self.path.clone(), async {}).await;
        Ok(CloseStatus::Finalized {
            frame_count: self.frames,
        })
    }

    fn frame_count(&self) -> u64 {
        self.frames
    }

    fn output_path(&self) -> &Path {
        &self.path
    }
}

/// Hands out one scripted page per address bar read.
struct ScriptedAddressBar {
    pages: tokio::sync::Mutex<VecDeque<PageContext>>,
}

#[async_trait]
impl AddressBarReader for ScriptedAddressBar {
    async fn read(&self, _bundle: &str) -> Option<PageContext> {
        self.pages.lock().await.pop_front()
    }
}

struct Harness {
    db: Arc<DatabaseManager>,
    index: Arc<IntervalIndex>,
    opened: Arc<AtomicU64>,
    handle: RecorderHandle,
}

async fn start(retention_days: u32) -> Harness {
    start_with_pages(retention_days, Vec::new()).await
}

async fn start_with_pages(retention_days: u32, pages: Vec<PageContext>) -> Harness {
    let db = Arc::new(DatabaseManager::new("sqlite::memory:").await.unwrap());
    let index = Arc::new(IntervalIndex::open("sqlite::memory:").await.unwrap());
    let opened = Arc::new(AtomicU64::new(0));
    let backend = Arc::new(StubBackend {
        opened: Arc::clone(&opened),
    });
    let config = RecorderConfig::new(PathBuf::from("/nonexistent/episodic"), retention_days, true);
    let mut manager = LifecycleManager::new(Arc::clone(&db), Arc::clone(&index), backend, config);
    if !pages.is_empty() {
        manager = manager.with_address_bar(Arc::new(ScriptedAddressBar {
            pages: tokio::sync::Mutex::new(pages.into()),
        }));
    }
    manager.recover_unclosed().await.unwrap();
    Harness {
        db,
        index,
        opened,
        handle: manager.spawn(16),
    }
}

fn context(bundle: &str, title: &str) -> RecorderEvent {
    RecorderEvent::ContextChanged {
        bundle: bundle.to_string(),
        window_title: title.to_string(),
        is_private: false,
    }
}

fn frame() -> RecorderEvent {
    RecorderEvent::Frame(CapturedFrame {
        image: DynamicImage::new_rgb8(4, 4),
        captured_at: Utc::now(),
    })
}

fn text(s: &str) -> RecorderEvent {
    RecorderEvent::ObservedText {
        text: s.to_string(),
        timestamp: Utc::now(),
    }
}

// Interval timestamps are stored at millisecond resolution; ordering-sensitive
// tests space observations out explicitly.
fn text_at(s: &str, offset_ms: i64) -> RecorderEvent {
    RecorderEvent::ObservedText {
        text: s.to_string(),
        timestamp: Utc::now() + chrono::Duration::milliseconds(offset_ms),
    }
}

#[tokio::test]
async fn context_change_opens_and_closes_one_episode() {
    let h = start(0).await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.send(context("com.example.terminal", "Shell")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.shutdown().await;

    let episodes = h.db.list_episodes().await.unwrap();
    assert_eq!(episodes.len(), 2);
    assert_eq!(h.opened.load(Ordering::SeqCst), 2);
    // Every episode was committed with a real end time.
    assert!(h.db.unclosed_episodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_context_event_does_not_reopen() {
    let h = start(0).await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.shutdown().await;

    assert_eq!(h.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.db.list_episodes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn first_frame_after_open_is_skipped() {
    let h = start(0).await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    // Only one frame: it absorbs the open skip, leaving zero accepted frames,
    // so the episode is suppressed as too short.
    h.handle.send(frame()).await;
    h.handle.shutdown().await;

    assert!(h.db.list_episodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn short_episode_record_is_suppressed() {
    let h = start(0).await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.send(text("fleeting words")).await;
    h.handle.send(context("com.example.terminal", "Shell")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.shutdown().await;

    let episodes = h.db.list_episodes().await.unwrap();
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0].bundle, "com.example.terminal");
    // The suppressed episode's intervals went with it.
    let expander = QueryExpander::disabled();
    let hits = h.index.search("fleeting", 0, &expander, &h.db).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn private_context_is_not_recorded() {
    let h = start(0).await;
    h.handle.send(RecorderEvent::ContextChanged {
        bundle: "com.example.browser".to_string(),
        window_title: "secret".to_string(),
        is_private: true,
    })
    .await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.shutdown().await;

    assert_eq!(h.opened.load(Ordering::SeqCst), 0);
    assert!(h.db.list_episodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn browser_dwell_lands_on_its_own_episode() {
    let page = |url: &str, title: &str| PageContext {
        url: Some(url.to_string()),
        title: Some(title.to_string()),
    };
    let h = start_with_pages(
        0,
        vec![
            page("https://alpha.example/page", "Alpha"),
            page("https://beta.example/page", "Beta"),
        ],
    )
    .await;

    h.handle.send(context("com.apple.Safari", "Alpha")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.send(context("com.apple.Safari", "Beta")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.shutdown().await;

    let episodes = h.db.list_episodes().await.unwrap();
    assert_eq!(episodes.len(), 3);
    let alpha = episodes.iter().find(|e| e.bundle == "alpha.example").unwrap();
    let beta = episodes.iter().find(|e| e.bundle == "beta.example").unwrap();

    // Each episode carries exactly its own page's dwell; the host change
    // must not leave a zero-dwell row for the new page on the old episode.
    let alpha_docs = h.db.documents_for_episode(alpha.id).await.unwrap();
    assert_eq!(alpha_docs.len(), 1);
    assert_eq!(alpha_docs[0].path, "https://alpha.example/page");
    assert!(alpha_docs[0].start_time < alpha_docs[0].end_time);

    let beta_docs = h.db.documents_for_episode(beta.id).await.unwrap();
    assert_eq!(beta_docs.len(), 1);
    assert_eq!(beta_docs[0].path, "https://beta.example/page");
}

#[tokio::test]
async fn leaving_private_context_skips_an_extra_frame() {
    // Two frames only absorb the open skip plus the private-exit skip, so
    // the episode is suppressed as too short.
    let h = start(0).await;
    h.handle.send(RecorderEvent::ContextChanged {
        bundle: "com.example.vault".to_string(),
        window_title: "".to_string(),
        is_private: true,
    })
    .await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.shutdown().await;
    assert!(h.db.list_episodes().await.unwrap().is_empty());

    // A third frame survives both skips and the episode persists.
    let h = start(0).await;
    h.handle.send(RecorderEvent::ContextChanged {
        bundle: "com.example.vault".to_string(),
        window_title: "".to_string(),
        is_private: true,
    })
    .await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.shutdown().await;
    assert_eq!(h.db.list_episodes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn excluded_bundle_is_bypassed() {
    let h = start(0).await;
    h.db.get_or_create_exclusion("com.example.banking").await.unwrap();
    h.db.set_excluded("com.example.banking", true).await.unwrap();

    h.handle.send(context("com.example.banking", "Account")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.shutdown().await;

    assert_eq!(h.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn observations_index_only_added_text() {
    let h = start(0).await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.send(text_at("draft", 0)).await;
    h.handle.send(text_at("draft v2", 50)).await;
    h.handle.shutdown().await;

    let episode = h.db.most_recent_episode().await.unwrap().unwrap();
    let intervals = h.index.intervals_for_episode(episode.id).await.unwrap();
    assert_eq!(intervals.len(), 2);
    assert_eq!(intervals[0].document, "draft");
    assert_eq!(intervals[1].document.trim(), "v2");

    let expander = QueryExpander::disabled();
    let hits = h.index.search("draft", 0, &expander, &h.db).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].episode.id, episode.id);
}

#[tokio::test]
async fn unchanged_observation_indexes_nothing() {
    let h = start(0).await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    h.handle.send(text("stable screen")).await;
    h.handle.send(text("stable screen")).await;
    h.handle.send(text("stable screen")).await;
    h.handle.shutdown().await;

    let episode = h.db.most_recent_episode().await.unwrap().unwrap();
    let intervals = h.index.intervals_for_episode(episode.id).await.unwrap();
    assert_eq!(intervals.len(), 1);
}

#[tokio::test]
async fn straggling_observation_attaches_to_last_episode() {
    let h = start(0).await;
    h.handle.send(context("com.example.editor", "Notes")).await;
    h.handle.send(frame()).await;
    h.handle.send(frame()).await;
    // Close by switching to a private context, then deliver late text.
    h.handle.send(RecorderEvent::ContextChanged {
        bundle: "com.example.vault".to_string(),
        window_title: "".to_string(),
        is_private: true,
    })
    .await;
    h.handle.send(text("late recognition")).await;
    h.handle.shutdown().await;

    let episode = h.db.most_recent_episode().await.unwrap().unwrap();
    assert_eq!(episode.bundle, "com.example.editor");
    let intervals = h.index.intervals_for_episode(episode.id).await.unwrap();
    assert_eq!(intervals.len(), 1);
    assert_eq!(intervals[0].document, "late recognition");
}

#[tokio::test]
async fn observation_with_no_episode_is_dropped() {
    let h = start(0).await;
    h.handle.send(text("orphan text")).await;
    h.handle.shutdown().await;

    let expander = QueryExpander::disabled();
    let hits = h.index.search("orphan", 0, &expander, &h.db).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn recovery_drops_interrupted_episodes() {
    let db = Arc::new(DatabaseManager::new("sqlite::memory:").await.unwrap());
    let index = Arc::new(IntervalIndex::open("sqlite::memory:").await.unwrap());

    // Simulate a crash: an episode left with end_time == start_time.
    let start = Utc::now();
    db.insert_episode(start, "com.example.editor", "interrupted")
        .await
        .unwrap();
    let closed = db
        .insert_episode(start - chrono::Duration::minutes(5), "com.example.editor", "committed")
        .await
        .unwrap();
    db.close_episode(closed, start).await.unwrap();

    let backend = Arc::new(StubBackend {
        opened: Arc::new(AtomicU64::new(0)),
    });
    let config = RecorderConfig::new(PathBuf::from("/nonexistent/episodic"), 0, true);
    let manager = LifecycleManager::new(Arc::clone(&db), index, backend, config);
    manager.recover_unclosed().await.unwrap();

    let episodes = db.list_episodes().await.unwrap();
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0].title, "committed");
}

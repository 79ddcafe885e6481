//! Episode lifecycle: a single task owns all recording state and consumes
//! capture events from a bounded channel. Context changes open and close
//! episodes, frames feed the encoder pipeline, and observed text is diffed
//! against the previous observation before indexing.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cleanup::{self, RetentionConfig};
use crate::config::{RecorderConfig, FILE_TRACKING_MIN_SECS};
use crate::db::{DatabaseManager, Episode};
use crate::error::{RecorderError, Result};
use crate::index::{Interval, IntervalIndex};
use crate::text_diff::added_text;
use crate::video::{
    CapturedFrame, CloseStatus, EncoderBackend, EncoderPipeline, FinalizeTracker, FrameStatus,
};
use crate::video_utils::{episode_title, episode_video_path, recent_files};

/// Events accepted by the recording core. Producers (capture loop, context
/// tracker, text recognizer) stay outside the crate and feed this channel.
pub enum RecorderEvent {
    ContextChanged {
        bundle: String,
        window_title: String,
        /// Privacy flag asserted by the producer (e.g. incognito windows);
        /// combined with the config's own pattern matching.
        is_private: bool,
    },
    Frame(CapturedFrame),
    ObservedText {
        text: String,
        timestamp: DateTime<Utc>,
    },
    Shutdown,
}

/// Page context read from a browser's address bar.
pub struct PageContext {
    pub url: Option<String>,
    pub title: Option<String>,
}

/// Seam for asking a browser what page it is showing. Platform-specific
/// producers implement this; tests stub it.
#[async_trait]
pub trait AddressBarReader: Send + Sync {
    async fn read(&self, bundle: &str) -> Option<PageContext>;
}

enum RecorderState {
    Idle,
    Recording {
        episode: Episode,
        pipeline: EncoderPipeline,
    },
}

/// Owns all mutable recording state. Never shared: [`LifecycleManager::spawn`]
/// moves it into its event loop, so every state transition is serialized by
/// construction.
pub struct LifecycleManager {
    db: Arc<DatabaseManager>,
    index: Arc<IntervalIndex>,
    encoder: Arc<dyn EncoderBackend>,
    address_bar: Option<Arc<dyn AddressBarReader>>,
    finalizer: FinalizeTracker,
    config: RecorderConfig,
    state: RecorderState,
    current_context: String,
    current_is_private: bool,
    current_url: Option<String>,
    current_url_since: Option<DateTime<Utc>>,
    last_observation: String,
    skip_on_next_open: u32,
}

/// Sender half plus the join handle of the event loop.
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderEvent>,
    join: JoinHandle<()>,
}

impl RecorderHandle {
    pub fn sender(&self) -> mpsc::Sender<RecorderEvent> {
        self.tx.clone()
    }

    pub async fn send(&self, event: RecorderEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Closes any open episode and drains pending finalizations.
    pub async fn shutdown(self) {
        let _ = self.tx.send(RecorderEvent::Shutdown).await;
        if let Err(e) = self.join.await {
            warn!("recorder task panicked: {}", e);
        }
    }
}

impl LifecycleManager {
    pub fn new(
        db: Arc<DatabaseManager>,
        index: Arc<IntervalIndex>,
        encoder: Arc<dyn EncoderBackend>,
        config: RecorderConfig,
    ) -> Self {
        Self {
            db,
            index,
            encoder,
            address_bar: None,
            finalizer: FinalizeTracker::new(),
            config,
            state: RecorderState::Idle,
            current_context: String::new(),
            current_is_private: false,
            current_url: None,
            current_url_since: None,
            last_observation: String::new(),
            skip_on_next_open: 0,
        }
    }

    pub fn with_address_bar(mut self, reader: Arc<dyn AddressBarReader>) -> Self {
        self.address_bar = Some(reader);
        self
    }

    /// Startup recovery: an episode whose end still equals its start was
    /// interrupted mid-recording and its video is unplayable, so the whole
    /// episode is dropped.
    pub async fn recover_unclosed(&self) -> Result<()> {
        for episode in self.db.unclosed_episodes().await? {
            info!("removing interrupted episode '{}'", episode.title);
            cleanup::delete_episode(
                &self.db,
                &self.index,
                &self.config.data_dir,
                &episode,
                true,
            )
            .await?;
        }
        Ok(())
    }

    /// Moves the manager into its event loop. `capacity` bounds the event
    /// channel; producers block (or drop frames themselves) when the core
    /// falls behind.
    pub fn spawn(self, capacity: usize) -> RecorderHandle {
        let (tx, rx) = mpsc::channel(capacity);
        let join = tokio::spawn(self.run(rx));
        RecorderHandle { tx, join }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RecorderEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                RecorderEvent::ContextChanged {
                    bundle,
                    window_title,
                    is_private,
                } => {
                    if let Err(e) = self
                        .handle_context_change(bundle, window_title, is_private)
                        .await
                    {
                        warn!("context change failed: {}", e);
                    }
                }
                RecorderEvent::Frame(frame) => self.handle_frame(frame).await,
                RecorderEvent::ObservedText { text, timestamp } => {
                    self.handle_observation(text, timestamp).await
                }
                RecorderEvent::Shutdown => break,
            }
        }
        if let Err(e) = self.close_current().await {
            warn!("failed to close episode on shutdown: {}", e);
        }
        self.finalizer.wait_all().await;
        info!("recorder stopped");
    }

    /// Resolves the effective context (browsers refine to the page's host),
    /// closes the running episode when it changed, and opens a new one unless
    /// the context is bypassed.
    async fn handle_context_change(
        &mut self,
        bundle: String,
        window_title: String,
        is_private: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let mut context = bundle.clone();
        let mut title = window_title;
        let mut private = is_private;
        let mut page_url: Option<String> = None;

        if self.config.is_browser_bundle(&bundle) {
            if let Some(reader) = self.address_bar.clone() {
                if let Some(page) = reader.read(&bundle).await {
                    if let Some(url_str) = page.url.as_deref() {
                        match Url::parse(url_str) {
                            Ok(url) => {
                                if let Some(host) = url.host_str() {
                                    context = host.to_string();
                                }
                            }
                            Err(e) => warn!("unparseable address bar url {}: {}", url_str, e),
                        }
                    }
                    if let Some(page_title) = page.title {
                        if !page_title.trim().is_empty() {
                            title = page_title;
                        }
                    }
                    page_url = page.url;
                }
            }
        }

        if self.config.is_private_context(&context) {
            private = true;
        }

        // Leaving a private context: the next frame may still show the
        // private content (the capture source races the switch), so skip it.
        // A private context never has an open episode, so the skip always
        // waits for the next open.
        if self.current_is_private && !private {
            self.skip_on_next_open = 1;
        }

        if context == self.current_context && private == self.current_is_private {
            // Same episode; a URL change within it still records the
            // previous page's dwell.
            self.note_url(page_url, now).await;
            return Ok(());
        }

        // Closing records the dwell of whatever page was showing against the
        // episode it belongs to; the new page's baseline is seeded only once
        // the new episode is open.
        self.close_current().await?;
        self.current_context = context.clone();
        self.current_is_private = private;

        let exclusion = self.db.get_or_create_exclusion(&context).await?;
        if context == self.config.own_bundle || exclusion.excluded || private {
            info!("bypassing context {}", context);
            return Ok(());
        }

        match self.open_episode(&title, now).await {
            Ok(()) => {
                self.note_url(page_url, now).await;
                Ok(())
            }
            // Not fatal: the recorder keeps consuming events and retries on
            // the next context change.
            Err(RecorderError::RecordingUnavailable(reason)) => {
                warn!("recording unavailable for {}: {}", context, reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Dwell accounting for browser pages: when the address bar moves to a
    /// new URL, the previous one is recorded as a visited document over the
    /// time it was showing. `None` closes out the current dwell without
    /// starting a new one (episode close, or leaving the browser).
    async fn note_url(&mut self, url: Option<String>, now: DateTime<Utc>) {
        if self.current_url == url {
            return;
        }
        if let (Some(previous), Some(since)) = (self.current_url.take(), self.current_url_since) {
            if let RecorderState::Recording { episode, .. } = &self.state {
                if let Err(e) = self
                    .db
                    .insert_document(episode.id, &previous, since, now)
                    .await
                {
                    warn!("failed to record visit to {}: {}", previous, e);
                }
            }
        }
        self.current_url = url;
        self.current_url_since = Some(now);
    }

    async fn open_episode(&mut self, raw_title: &str, start: DateTime<Utc>) -> Result<()> {
        let title = episode_title(raw_title, &self.current_context, start);
        let path = episode_video_path(&self.config.data_dir, start, &title);

        // A clock step backwards can regenerate a path that is still being
        // finalized; wait it out rather than corrupt the file.
        if self.finalizer.is_finalizing(&path).await {
            warn!("output path {} still finalizing, waiting", path.display());
            self.finalizer.wait_for(&path).await;
        }

        let session = self
            .encoder
            .open(
                self.config.capture_width,
                self.config.capture_height,
                &path,
                self.config.seconds_per_frame,
            )
            .await?;

        let id = match self
            .db
            .insert_episode(start, &self.current_context, &title)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // No record, no video: cancel the session we just opened.
                let _ = session.close(u64::MAX, &self.finalizer).await;
                return Err(e);
            }
        };

        info!("recording '{}' ({})", title, self.current_context);
        // The first frame after a context switch often still shows the
        // previous context, so every open starts with at least one skip.
        let skip = 1 + std::mem::take(&mut self.skip_on_next_open);
        self.state = RecorderState::Recording {
            episode: Episode {
                id,
                start_time: start,
                end_time: start,
                bundle: self.current_context.clone(),
                title,
                pinned: false,
            },
            pipeline: EncoderPipeline::new(session, skip),
        };
        Ok(())
    }

    async fn handle_frame(&mut self, frame: CapturedFrame) {
        let RecorderState::Recording { pipeline, .. } = &mut self.state else {
            return;
        };
        match pipeline.push(&frame).await {
            Ok(FrameStatus::Accepted) => {}
            Ok(FrameStatus::Dropped) => debug!("frame at {} dropped", frame.captured_at),
            Err(e) => warn!("failed to push frame: {}", e),
        }
    }

    /// Indexes only the text added since the previous observation, covering
    /// one frame interval. Observations arriving between episodes attach to
    /// the most recent episode (recognition lags capture); with no episode at
    /// all they are dropped.
    async fn handle_observation(&mut self, text: String, timestamp: DateTime<Utc>) {
        let episode_id = match &self.state {
            RecorderState::Recording { episode, .. } => Some(episode.id),
            RecorderState::Idle => match self.db.most_recent_episode().await {
                Ok(Some(episode)) => {
                    debug!("attaching straggling observation to episode {}", episode.id);
                    Some(episode.id)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!("failed to look up episode for observation: {}", e);
                    None
                }
            },
        };
        let Some(episode_id) = episode_id else {
            warn!("no episode for observation at {}, dropping", timestamp);
            return;
        };

        let added = added_text(&self.last_observation, &text);
        if !added.trim().is_empty() {
            let interval = Interval {
                from: timestamp,
                to: timestamp + Duration::seconds(self.config.seconds_per_frame),
                episode_id,
                document: added,
            };
            // A failed write drops this observation; the next diff re-baselines
            // against the full text below, so no stale delta accumulates.
            if let Err(e) = self.index.insert(&interval).await {
                warn!("index write failed, dropping observation: {}", e);
            }
        }
        self.last_observation = text;
    }

    /// Closes the running episode, if any. Too-short episodes are suppressed
    /// (record deleted even if pinned in the meantime); finalized episodes get
    /// their end time committed and, when long enough, a file-tracking scan.
    /// Every close ends with a retention sweep.
    async fn close_current(&mut self) -> Result<()> {
        if matches!(self.state, RecorderState::Idle) {
            return Ok(());
        }
        let now = Utc::now();
        // Close out the dwell on whatever page was showing while the episode
        // is still current, so the row lands on the closing episode.
        self.note_url(None, now).await;

        let previous = std::mem::replace(&mut self.state, RecorderState::Idle);
        let RecorderState::Recording { episode, pipeline } = previous else {
            return Ok(());
        };

        let frame_count = pipeline.frame_count();
        let path = pipeline.output_path().to_path_buf();
        match pipeline
            .close(self.config.min_frame_count, &self.finalizer)
            .await?
        {
            CloseStatus::CancelledTooShort => {
                info!("suppressing short episode for {}", episode.bundle);
                cleanup::delete_episode(
                    &self.db,
                    &self.index,
                    &self.config.data_dir,
                    &episode,
                    true,
                )
                .await?;
            }
            CloseStatus::Finalized { .. } => {
                self.db.close_episode(episode.id, now).await?;
                info!("closed '{}' with {} frames", episode.title, frame_count);
                let recorded_secs = frame_count as i64 * self.config.seconds_per_frame;
                if self.config.track_files && recorded_secs > FILE_TRACKING_MIN_SECS {
                    self.spawn_file_tracking(episode, now, path);
                }
            }
        }

        let retention = RetentionConfig::from_recorder(&self.config);
        match cleanup::run_retention(&self.db, &self.index, &self.config.data_dir, &retention).await
        {
            Ok(stats) if !stats.is_empty() => {
                info!("retention: {} evicted", stats.episodes_deleted)
            }
            Ok(_) => {}
            Err(e) => warn!("retention sweep failed: {}", e),
        }
        Ok(())
    }

    /// Records files modified during a long episode as documents. Runs
    /// detached after the video finalize completes; the scan itself is
    /// blocking directory enumeration.
    fn spawn_file_tracking(&self, episode: Episode, end: DateTime<Utc>, video_path: PathBuf) {
        let Some(root) = self.config.tracked_files_root.clone() else {
            return;
        };
        let db = Arc::clone(&self.db);
        let finalizer = self.finalizer.clone();
        tokio::spawn(async move {
            finalizer.wait_for(&video_path).await;
            debug!("scanning {} for files touched during episode", root.display());
            let start = episode.start_time;
            let files =
                match tokio::task::spawn_blocking(move || recent_files(&root, start, end)).await {
                    Ok(files) => files,
                    Err(e) => {
                        warn!("file tracking scan failed: {}", e);
                        return;
                    }
                };
            for (file, modified) in files {
                if let Err(e) = db
                    .insert_document(
                        episode.id,
                        &file.to_string_lossy(),
                        episode.start_time,
                        modified,
                    )
                    .await
                {
                    warn!("failed to record file {}: {}", file.display(), e);
                    break;
                }
            }
        });
    }
}

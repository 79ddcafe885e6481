//! Encoder pipeline: one video-writing session per episode.
//!
//! The production backend pipes JPEG frames into an ffmpeg child process
//! (`-f image2pipe`). Container timestamps derive from the frame counter and
//! the fixed inter-frame interval, never from wall-clock capture time, so the
//! timeline stays consistent under scheduling jitter.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{RecorderError, Result};

/// One captured frame pushed by the external capture source.
pub struct CapturedFrame {
    pub image: DynamicImage,
    /// Wall-clock capture hint; used for logging only, never for container
    /// timestamps.
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Accepted,
    /// Skipped (mid-skip window) or refused by the writer (backpressure).
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseStatus {
    /// The session is being finalized asynchronously; the caller may proceed
    /// but must not reuse the output path until the tracker drains it.
    Finalized { frame_count: u64 },
    /// Too few accepted frames; the session was cancelled synchronously and
    /// any partial output removed. The caller deletes the episode record.
    CancelledTooShort,
}

/// Factory seam for encoder sessions, selected at construction time.
#[async_trait]
pub trait EncoderBackend: Send + Sync {
    async fn open(
        &self,
        width: u32,
        height: u32,
        output_path: &Path,
        seconds_per_frame: i64,
    ) -> Result<Box<dyn EncoderSession>>;
}

/// A single in-progress video write.
#[async_trait]
pub trait EncoderSession: Send {
    async fn push(&mut self, frame: &CapturedFrame) -> Result<FrameStatus>;

    /// Finalize or cancel. Fewer than `min_frame_count` accepted frames
    /// cancels synchronously; otherwise finalization is handed to `tracker`
    /// and runs detached.
    async fn close(
        self: Box<Self>,
        min_frame_count: u64,
        tracker: &FinalizeTracker,
    ) -> Result<CloseStatus>;

    fn frame_count(&self) -> u64;
    fn output_path(&self) -> &Path;
}

/// Wraps a session with the skip counters scheduled after episode open and
/// after leaving a private context; skips decrement on each attempted push.
pub struct EncoderPipeline {
    session: Box<dyn EncoderSession>,
    skip_frames: u32,
}

impl EncoderPipeline {
    pub fn new(session: Box<dyn EncoderSession>, initial_skip: u32) -> Self {
        Self {
            session,
            skip_frames: initial_skip,
        }
    }

    pub fn schedule_skip(&mut self, frames: u32) {
        self.skip_frames += frames;
    }

    pub async fn push(&mut self, frame: &CapturedFrame) -> Result<FrameStatus> {
        if self.skip_frames > 0 {
            self.skip_frames -= 1;
            debug!("skipping frame, {} skips remaining", self.skip_frames);
            return Ok(FrameStatus::Dropped);
        }
        self.session.push(frame).await
    }

    pub async fn close(
        self,
        min_frame_count: u64,
        tracker: &FinalizeTracker,
    ) -> Result<CloseStatus> {
        self.session.close(min_frame_count, tracker).await
    }

    pub fn frame_count(&self) -> u64 {
        self.session.frame_count()
    }

    pub fn output_path(&self) -> &Path {
        self.session.output_path()
    }
}

/// Tracks in-flight finalizations keyed by output path. A new session must
/// not open against a path that is still finalizing, and shutdown waits for
/// every pending finalize before the process exits.
#[derive(Clone, Default)]
pub struct FinalizeTracker {
    inner: Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>,
}

impl FinalizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track<F>(&self, path: PathBuf, finalize: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = path.clone();
        // The lock is held across spawn and insert so the task's removal
        // cannot run before the entry exists; a fast finalize would otherwise
        // remove nothing and leave the inserted entry stranded forever.
        let mut entries = self.inner.lock().await;
        let handle = tokio::spawn(async move {
            finalize.await;
            inner.lock().await.remove(&key);
        });
        entries.insert(path, handle);
    }

    pub async fn is_finalizing(&self, path: &Path) -> bool {
        self.inner.lock().await.contains_key(path)
    }

    /// Blocks until the finalize for `path` (if any) completes.
    pub async fn wait_for(&self, path: &Path) {
        let handle = self.inner.lock().await.remove(path);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("finalize task for {} panicked: {}", path.display(), e);
            }
        }
    }

    /// Flush-on-shutdown: waits for every pending finalize.
    pub async fn wait_all(&self) {
        loop {
            let next = self.inner.lock().await.keys().next().cloned();
            match next {
                Some(path) => self.wait_for(&path).await,
                None => break,
            }
        }
    }
}

/// Locates the ffmpeg binary: explicit override, common install locations,
/// then PATH resolution at spawn time.
pub fn find_ffmpeg_path() -> PathBuf {
    if let Ok(overridden) = std::env::var("EPISODIC_FFMPEG") {
        return PathBuf::from(overridden);
    }
    for dir in ["/usr/local/bin", "/usr/bin", "/opt/homebrew/bin"] {
        let candidate = Path::new(dir).join("ffmpeg");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("ffmpeg")
}

/// Production backend shelling out to ffmpeg.
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: find_ffmpeg_path(),
        }
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EncoderBackend for FfmpegEncoder {
    async fn open(
        &self,
        width: u32,
        height: u32,
        output_path: &Path,
        seconds_per_frame: i64,
    ) -> Result<Box<dyn EncoderSession>> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // One input frame every `seconds_per_frame` seconds fixes the
        // container timeline at frame_index * interval.
        let framerate = format!("1/{}", seconds_per_frame.max(1));
        let scale = format!("scale={}:{}", width, height);
        let output = output_path
            .to_str()
            .ok_or_else(|| {
                RecorderError::RecordingUnavailable("non-utf8 output path".to_string())
            })?
            .to_string();

        info!("starting ffmpeg for {}", output);
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args([
                "-f",
                "image2pipe",
                "-vcodec",
                "mjpeg",
                "-framerate",
                &framerate,
                "-i",
                "-",
                "-vf",
                &scale,
                "-vcodec",
                "libx264",
                "-preset",
                "ultrafast",
                "-crf",
                "23",
                "-pix_fmt",
                "yuv420p",
                "-y",
                &output,
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| RecorderError::RecordingUnavailable(format!("ffmpeg spawn: {}", e)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            RecorderError::RecordingUnavailable("ffmpeg stdin unavailable".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_ffmpeg_output(BufReader::new(stderr)));
        }

        Ok(Box::new(FfmpegSession {
            child,
            stdin: Some(stdin),
            frame_count: 0,
            output_path: output_path.to_path_buf(),
        }))
    }
}

struct FfmpegSession {
    child: Child,
    stdin: Option<ChildStdin>,
    frame_count: u64,
    output_path: PathBuf,
}

#[async_trait]
impl EncoderSession for FfmpegSession {
    async fn push(&mut self, frame: &CapturedFrame) -> Result<FrameStatus> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(FrameStatus::Dropped);
        };
        let mut buffer = Vec::new();
        if let Err(e) = frame.image.to_rgb8().write_to(
            &mut std::io::Cursor::new(&mut buffer),
            image::ImageFormat::Jpeg,
        ) {
            warn!("failed to encode frame captured at {}: {}", frame.captured_at, e);
            return Ok(FrameStatus::Dropped);
        }
        // Writer backpressure is a transient drop, not an error.
        if let Err(e) = stdin.write_all(&buffer).await {
            warn!("ffmpeg refused frame: {}", e);
            return Ok(FrameStatus::Dropped);
        }
        self.frame_count += 1;
        Ok(FrameStatus::Accepted)
    }

    async fn close(
        mut self: Box<Self>,
        min_frame_count: u64,
        tracker: &FinalizeTracker,
    ) -> Result<CloseStatus> {
        if self.frame_count < min_frame_count.max(1) {
            // Synchronous cancel: kill the writer and drop partial output.
            drop(self.stdin.take());
            if let Err(e) = self.child.kill().await {
                warn!("failed to kill ffmpeg for cancelled session: {}", e);
            }
            match tokio::fs::remove_file(&self.output_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove partial output: {}", e),
            }
            return Ok(CloseStatus::CancelledTooShort);
        }

        // Closing stdin signals ffmpeg to flush and write the trailer; the
        // wait runs detached and is tracked per path.
        drop(self.stdin.take());
        let frame_count = self.frame_count;
        let path = self.output_path.clone();
        let child = self.child;
        tracker
            .track(path.clone(), async move {
                finish_ffmpeg(child, &path).await;
            })
            .await;
        Ok(CloseStatus::Finalized { frame_count })
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }
}

async fn finish_ffmpeg(child: Child, path: &Path) {
    match child.wait_with_output().await {
        Ok(output) => {
            if output.status.success() {
                debug!("finished writing {}", path.display());
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                error!(
                    "ffmpeg exited with {} for {}: {}",
                    output.status,
                    path.display(),
                    stderr
                );
            }
        }
        Err(e) => error!("failed to wait for ffmpeg: {}", e),
    }
}

async fn log_ffmpeg_output(stream: impl AsyncBufReadExt + Unpin) {
    let mut lines = stream.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("ffmpeg: {}", line);
    }
}

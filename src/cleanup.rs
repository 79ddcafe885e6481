//! Retention: periodic eviction of aged, unpinned episodes across video
//! storage, structured records and the interval index.

use std::path::Path;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::RecorderConfig;
use crate::db::{DatabaseManager, Episode};
use crate::error::Result;
use crate::index::IntervalIndex;
use crate::video_utils::episode_video_path;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// 0 means retain forever.
    pub retention_days: u32,
    pub dry_run: bool,
}

impl RetentionConfig {
    pub fn from_recorder(config: &RecorderConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetentionStats {
    pub episodes_deleted: u64,
    pub pinned_skipped: u64,
    pub bytes_freed: u64,
}

impl RetentionStats {
    pub fn is_empty(&self) -> bool {
        self.episodes_deleted == 0 && self.pinned_skipped == 0
    }
}

/// Evicts every unpinned episode older than the cutoff. Invoked after every
/// episode close and explicitly from the CLI. Per-episode failures are logged
/// and retried on the next cycle rather than surfaced.
pub async fn run_retention(
    db: &DatabaseManager,
    index: &IntervalIndex,
    data_dir: &Path,
    config: &RetentionConfig,
) -> Result<RetentionStats> {
    let mut stats = RetentionStats::default();
    if config.retention_days == 0 {
        debug!("retention disabled, keeping everything");
        return Ok(stats);
    }

    let cutoff = Utc::now() - Duration::days(config.retention_days as i64);
    let aged = db.episodes_started_before(cutoff).await?;
    if aged.is_empty() {
        return Ok(stats);
    }
    info!(
        "culling {} episodes older than {}",
        aged.len(),
        cutoff.format("%Y-%m-%d")
    );

    for episode in aged {
        if episode.pinned {
            stats.pinned_skipped += 1;
            continue;
        }
        if config.dry_run {
            stats.episodes_deleted += 1;
            continue;
        }
        match delete_episode(db, index, data_dir, &episode, false).await {
            Ok(Some(bytes)) => {
                stats.episodes_deleted += 1;
                stats.bytes_freed += bytes;
            }
            Ok(None) => stats.pinned_skipped += 1,
            Err(e) => warn!("failed to evict episode '{}': {}", episode.title, e),
        }
    }
    Ok(stats)
}

/// Cascade delete of one episode: video asset, documents, indexed intervals,
/// then the record itself. Returns the bytes freed, or `None` when the
/// episode is pinned and `force` is not set (the suppressed-short-episode
/// path forces deletion of its not-yet-committed record).
pub async fn delete_episode(
    db: &DatabaseManager,
    index: &IntervalIndex,
    data_dir: &Path,
    episode: &Episode,
    force: bool,
) -> Result<Option<u64>> {
    if episode.pinned && !force {
        info!("episode '{}' is pinned, skipping delete", episode.title);
        return Ok(None);
    }

    let video = episode_video_path(data_dir, episode.start_time, &episode.title);
    let bytes = delete_file_if_present(&video).await;

    db.delete_documents_for_episode(episode.id).await?;
    index.delete_by_episode(episode.id).await?;
    db.delete_episode(episode.id).await?;
    debug!("deleted episode '{}'", episode.title);
    Ok(Some(bytes))
}

/// An already-absent video file is not an error; the cascade continues.
async fn delete_file_if_present(path: &Path) -> u64 {
    let bytes = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => {
            debug!("video asset missing, nothing to delete: {}", path.display());
            return 0;
        }
    };
    match tokio::fs::remove_file(path).await {
        Ok(()) => bytes,
        Err(e) => {
            warn!("failed to delete {}: {}", path.display(), e);
            0
        }
    }
}

/// Human-readable sweep summary for the CLI.
pub fn format_retention_stats(stats: &RetentionStats, dry_run: bool) -> String {
    format!(
        "{}deleted {} episodes, skipped {} pinned, freed {:.2} MB",
        if dry_run { "(dry run) " } else { "" },
        stats.episodes_deleted,
        stats.pinned_skipped,
        stats.bytes_freed as f64 / 1024.0 / 1024.0
    )
}

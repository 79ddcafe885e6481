use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::cleanup::{self, format_retention_stats, RetentionConfig};
use crate::config::RecorderConfig;
use crate::core::{LifecycleManager, RecorderEvent, RecorderHandle};
use crate::db::DatabaseManager;
use crate::expand::{HeuristicTagger, QueryExpander, WordEmbeddings};
use crate::index::IntervalIndex;
use crate::video::{CapturedFrame, FfmpegEncoder};

#[derive(Parser)]
#[command(name = "episodic", about = "Episodic screen recorder and search index", version)]
pub struct Cli {
    /// Base directory for records, index and video assets.
    #[arg(long, env = "EPISODIC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the recording core, consuming capture events as JSON lines on
    /// stdin until EOF or ctrl-c.
    Record {
        /// Days of history to keep; 0 retains forever.
        #[arg(long, default_value_t = 30)]
        retention_days: u32,
        /// Capture at the shorter hardware-accelerated frame interval.
        #[arg(long, default_value_t = false)]
        hardware_accelerated: bool,
        /// Record files modified during long episodes as documents.
        #[arg(long, default_value_t = false)]
        track_files: bool,
        /// Additional privacy patterns (regex) that suppress recording.
        #[arg(long = "private")]
        privacy_patterns: Vec<String>,
    },

    /// Search indexed text, newest-first when the term is empty.
    Search {
        #[arg(default_value = "")]
        term: String,
        /// Expand nouns and verbs with up to N embedding neighbors each.
        #[arg(long, default_value_t = 0)]
        expand: usize,
        /// Word2vec-style text file backing query expansion.
        #[arg(long, env = "EPISODIC_EMBEDDINGS")]
        embeddings: Option<PathBuf>,
        /// Emit one JSON object per hit instead of formatted text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Evict episodes older than the retention window.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        retention_days: u32,
        /// Report what would be deleted without touching anything.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Pin an episode so retention never evicts it (or unpin it).
    Pin {
        episode_id: i64,
        #[arg(long, default_value_t = false)]
        unpin: bool,
    },

    /// Exclude a bundle from recording entirely (or re-include it).
    Exclude {
        bundle: String,
        #[arg(long, default_value_t = false)]
        include: bool,
    },
}

/// Wire format for events fed to `record` on stdin. Frames arrive by path so
/// capture sources in any language can drive the recorder.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Context {
        bundle: String,
        #[serde(default)]
        window_title: String,
        #[serde(default)]
        is_private: bool,
    },
    Text {
        text: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Frame {
        path: PathBuf,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

pub struct Paths {
    pub records_db: String,
    pub index_db: String,
    pub videos_dir: PathBuf,
}

impl Paths {
    pub fn new(base_dir: &std::path::Path) -> Self {
        Self {
            records_db: format!("sqlite://{}?mode=rwc", base_dir.join("records.sqlite3").display()),
            index_db: format!("sqlite://{}?mode=rwc", base_dir.join("index.sqlite3").display()),
            videos_dir: base_dir.join("data"),
        }
    }
}

async fn open_stores(paths: &Paths) -> anyhow::Result<(Arc<DatabaseManager>, Arc<IntervalIndex>)> {
    let db = DatabaseManager::new(&paths.records_db)
        .await
        .context("opening record store")?;
    let index = IntervalIndex::open(&paths.index_db)
        .await
        .context("opening interval index")?;
    Ok((Arc::new(db), Arc::new(index)))
}

pub async fn handle_record(
    base_dir: PathBuf,
    retention_days: u32,
    hardware_accelerated: bool,
    track_files: bool,
    privacy_patterns: Vec<String>,
) -> anyhow::Result<()> {
    let paths = Paths::new(&base_dir);
    let (db, index) = open_stores(&paths).await?;

    let mut config = RecorderConfig::new(paths.videos_dir, retention_days, hardware_accelerated)
        .with_file_tracking(track_files);
    if !privacy_patterns.is_empty() {
        config = config.with_privacy_patterns(&privacy_patterns)?;
    }
    let manager = LifecycleManager::new(db, index, Arc::new(FfmpegEncoder::new()), config);
    manager.recover_unclosed().await?;
    let handle = manager.spawn(64);

    info!("recording, feed events on stdin (json lines)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WireEvent>(&line) {
                    Ok(event) => {
                        if !dispatch(&handle, event).await {
                            break;
                        }
                    }
                    Err(e) => warn!("skipping malformed event: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }
    handle.shutdown().await;
    Ok(())
}

async fn dispatch(handle: &RecorderHandle, event: WireEvent) -> bool {
    match event {
        WireEvent::Context {
            bundle,
            window_title,
            is_private,
        } => {
            handle
                .send(RecorderEvent::ContextChanged {
                    bundle,
                    window_title,
                    is_private,
                })
                .await
        }
        WireEvent::Text { text, timestamp } => {
            handle
                .send(RecorderEvent::ObservedText {
                    text,
                    timestamp: timestamp.unwrap_or_else(Utc::now),
                })
                .await
        }
        WireEvent::Frame { path, timestamp } => {
            // Decode off the runtime; a frame that fails to load is skipped.
            let loaded = tokio::task::spawn_blocking(move || image::open(&path)).await;
            match loaded {
                Ok(Ok(image)) => {
                    handle
                        .send(RecorderEvent::Frame(CapturedFrame {
                            image,
                            captured_at: timestamp.unwrap_or_else(Utc::now),
                        }))
                        .await
                }
                Ok(Err(e)) => {
                    warn!("failed to load frame: {}", e);
                    true
                }
                Err(e) => {
                    error!("frame decode task failed: {}", e);
                    true
                }
            }
        }
    }
}

pub async fn handle_search(
    base_dir: PathBuf,
    term: String,
    expand: usize,
    embeddings: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let paths = Paths::new(&base_dir);
    let (db, index) = open_stores(&paths).await?;

    let expander = match embeddings {
        Some(path) if expand > 0 => {
            let embeddings = WordEmbeddings::load(&path)
                .with_context(|| format!("loading embeddings from {}", path.display()))?;
            QueryExpander::new(Box::new(HeuristicTagger::new()), Box::new(embeddings))
        }
        _ => QueryExpander::disabled(),
    };

    let hits = index.search(&term, expand, &expander, &db).await?;
    for hit in &hits {
        if json {
            println!("{}", serde_json::to_string(hit)?);
        } else {
            println!(
                "{}  [{}] {}\n    {}",
                hit.interval.from.format("%Y-%m-%d %H:%M:%S"),
                hit.episode.bundle,
                hit.episode.title,
                if hit.snippet.is_empty() {
                    &hit.interval.document
                } else {
                    &hit.snippet
                }
            );
        }
    }
    if hits.is_empty() && !json {
        println!("no results");
    }
    Ok(())
}

pub async fn handle_cleanup(
    base_dir: PathBuf,
    retention_days: u32,
    dry_run: bool,
) -> anyhow::Result<()> {
    let paths = Paths::new(&base_dir);
    let (db, index) = open_stores(&paths).await?;
    let config = RetentionConfig {
        retention_days,
        dry_run,
    };
    let stats = cleanup::run_retention(&db, &index, &paths.videos_dir, &config).await?;
    println!("{}", format_retention_stats(&stats, dry_run));
    Ok(())
}

pub async fn handle_pin(base_dir: PathBuf, episode_id: i64, unpin: bool) -> anyhow::Result<()> {
    let paths = Paths::new(&base_dir);
    let (db, _) = open_stores(&paths).await?;
    match db.episode_by_id(episode_id).await? {
        Some(episode) => {
            db.set_pinned(episode_id, !unpin).await?;
            println!(
                "{} '{}'",
                if unpin { "unpinned" } else { "pinned" },
                episode.title
            );
            Ok(())
        }
        None => anyhow::bail!("no episode with id {}", episode_id),
    }
}

pub async fn handle_exclude(base_dir: PathBuf, bundle: String, include: bool) -> anyhow::Result<()> {
    let paths = Paths::new(&base_dir);
    let (db, _) = open_stores(&paths).await?;
    db.get_or_create_exclusion(&bundle).await?;
    db.set_excluded(&bundle, !include).await?;
    println!(
        "{} {}",
        if include { "recording" } else { "excluding" },
        bundle
    );
    Ok(())
}

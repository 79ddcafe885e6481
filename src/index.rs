//! Append-only full-text index of time-bounded text intervals.
//!
//! Backed by a SQLite FTS5 virtual table; `from`/`to`/`episode_id` are stored
//! unindexed, `document` is tokenized for search. The schema carries a
//! version in `PRAGMA user_version` with an online migration path: rows are
//! read out, the table is recreated under the new tokenizer configuration and
//! rows are reinserted through the normal insert path.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::{DatabaseManager, Episode};
use crate::error::{RecorderError, Result};
use crate::expand::QueryExpander;

/// Current index schema version. Version 0 was the pre-porter tokenizer
/// table; bump this when the FTS configuration changes.
pub const INDEX_VERSION: i64 = 1;

/// Hard cap on search results.
pub const SEARCH_LIMIT: i64 = 64;

/// A time-bounded incremental text fragment belonging to an episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interval {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub episode_id: i64,
    pub document: String,
}

/// One search result: the interval, its resolved episode and a relevance
/// snippet around the matched tokens.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub interval: Interval,
    pub episode: Episode,
    pub snippet: String,
}

pub struct IntervalIndex {
    pool: SqlitePool,
    // Serializes inserts against the lazy self-heal delete; plain searches
    // run without it.
    write_lock: Mutex<()>,
}

impl IntervalIndex {
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(RecorderError::Store)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let index = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        index.ensure_schema().await?;
        Ok(index)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let exists: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'intervals'",
        )
        .fetch_optional(&self.pool)
        .await?;

        if exists.is_none() {
            self.create_table().await?;
            self.set_version(INDEX_VERSION).await?;
            return Ok(());
        }

        let version = self.version().await?;
        if version < INDEX_VERSION {
            info!("migrating interval index {} -> {}", version, INDEX_VERSION);
            self.migrate().await?;
            info!("interval index migration complete");
        }
        Ok(())
    }

    async fn create_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE VIRTUAL TABLE intervals USING fts5(
                start_time UNINDEXED,
                to_time UNINDEXED,
                episode_id UNINDEXED,
                document,
                tokenize = 'porter'
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn version(&self) -> Result<i64> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn set_version(&self, version: i64) -> Result<()> {
        sqlx::query(&format!("PRAGMA user_version = {}", version))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Full read-out, recreate, reinsert. All-or-nothing from the caller's
    /// perspective: any failure leaves `user_version` unbumped so the
    /// migration reruns on next startup; idempotence against already-migrated
    /// data rests on the version guard alone.
    async fn migrate(&self) -> Result<()> {
        let migration = |e: sqlx::Error| RecorderError::Migration(e.to_string());

        let rows = sqlx::query("SELECT start_time, to_time, episode_id, document FROM intervals")
            .fetch_all(&self.pool)
            .await
            .map_err(migration)?;
        let intervals: Vec<Interval> = rows
            .iter()
            .map(|row| Interval {
                from: millis_to_utc(row.get::<i64, _>(0)),
                to: millis_to_utc(row.get::<i64, _>(1)),
                episode_id: row.get::<i64, _>(2),
                document: row.get::<String, _>(3),
            })
            .collect();

        sqlx::query("DROP TABLE intervals")
            .execute(&self.pool)
            .await
            .map_err(migration)?;
        self.create_table()
            .await
            .map_err(|e| RecorderError::Migration(e.to_string()))?;

        for interval in &intervals {
            self.insert(interval)
                .await
                .map_err(|e| RecorderError::Migration(e.to_string()))?;
        }
        self.set_version(INDEX_VERSION)
            .await
            .map_err(|e| RecorderError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Append-only insert. Intervals are never updated.
    pub async fn insert(&self, interval: &Interval) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO intervals (start_time, to_time, episode_id, document)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(interval.from.timestamp_millis())
        .bind(interval.to.timestamp_millis())
        .bind(interval.episode_id)
        .bind(&interval.document)
        .execute(&self.pool)
        .await
        .map_err(|e| RecorderError::IndexWrite(e.to_string()))?;
        Ok(())
    }

    /// Removes every interval belonging to `episode_id`. Used by cascade
    /// delete and by the lazy self-heal during search.
    pub async fn delete_by_episode(&self, episode_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM intervals WHERE episode_id = ?1")
            .bind(episode_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_for_episode(&self, episode_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM intervals WHERE episode_id = ?1")
                .bind(episode_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn intervals_for_episode(&self, episode_id: i64) -> Result<Vec<Interval>> {
        let rows = sqlx::query(
            "SELECT start_time, to_time, episode_id, document FROM intervals
             WHERE episode_id = ?1 ORDER BY start_time ASC",
        )
        .bind(episode_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Interval {
                from: millis_to_utc(row.get::<i64, _>(0)),
                to: millis_to_utc(row.get::<i64, _>(1)),
                episode_id: row.get::<i64, _>(2),
                document: row.get::<String, _>(3),
            })
            .collect())
    }

    /// Ranked full-text search, at most [`SEARCH_LIMIT`] hits.
    ///
    /// An empty (post-expansion) term returns the most recent intervals
    /// unfiltered. Hits whose episode no longer exists are dangling rows from
    /// a partial delete; they are removed here and excluded from results.
    /// Query failures (for example FTS syntax errors in user input) degrade to
    /// empty results.
    pub async fn search(
        &self,
        term: &str,
        expand_by: usize,
        expander: &QueryExpander,
        db: &DatabaseManager,
    ) -> Result<Vec<SearchHit>> {
        let final_term = expander.expand(term, expand_by);

        let rows = if final_term.trim().is_empty() {
            sqlx::query(
                "SELECT start_time, to_time, episode_id, document, '' FROM intervals
                 ORDER BY rowid DESC LIMIT ?1",
            )
            .bind(SEARCH_LIMIT)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT start_time, to_time, episode_id, document,
                        snippet(intervals, 3, '', '', '', 10)
                 FROM intervals WHERE intervals MATCH ?1
                 ORDER BY bm25(intervals) LIMIT ?2",
            )
            .bind(&final_term)
            .bind(SEARCH_LIMIT)
            .fetch_all(&self.pool)
            .await
        };

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!("search for '{}' failed, returning no results: {}", final_term, e);
                return Ok(Vec::new());
            }
        };

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let interval = Interval {
                from: millis_to_utc(row.get::<i64, _>(0)),
                to: millis_to_utc(row.get::<i64, _>(1)),
                episode_id: row.get::<i64, _>(2),
                document: row.get::<String, _>(3),
            };
            match db.episode_by_id(interval.episode_id).await {
                Ok(Some(episode)) => hits.push(SearchHit {
                    snippet: row.get::<String, _>(4),
                    interval,
                    episode,
                }),
                Ok(None) => {
                    warn!(
                        "dangling interval for episode {}, removing",
                        interval.episode_id
                    );
                    let _guard = self.write_lock.lock().await;
                    if let Err(e) = self.delete_by_episode(interval.episode_id).await {
                        warn!("failed to heal dangling intervals: {}", e);
                    }
                }
                // A record-store failure is not a dangling row: skip the hit
                // without healing and without failing the query.
                Err(e) => warn!(
                    "failed to resolve episode {} for hit, skipping: {}",
                    interval.episode_id, e
                ),
            }
        }
        Ok(hits)
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

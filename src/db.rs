use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::Result;

/// One bounded recording segment tied to a single application/site context.
///
/// `start_time` is the unique human identity; `id` is the surrogate key
/// carried into the interval index. `end_time == start_time` marks an episode
/// that is still open (or was abandoned mid-recording).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Episode {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub bundle: String,
    pub title: String,
    pub pinned: bool,
}

/// A file path (or page URL) touched during an episode's window.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Document {
    pub id: i64,
    pub episode_id: i64,
    pub path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Per-bundle recording opt-out, created on first sight with defaults.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BundleExclusion {
    pub id: i64,
    pub bundle: String,
    pub excluded: bool,
}

/// Structured record store over SQLite. All mutations return `Result` so
/// callers can retry at the operation boundary; nothing in here aborts.
pub struct DatabaseManager {
    pub pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(database_url: &str) -> Result<Self> {
        debug!("opening record store at {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(crate::error::RecorderError::Store)?
            .create_if_missing(true);
        // Single connection: the write path is one serialization domain, and
        // it keeps `sqlite::memory:` coherent in tests.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.create_tables().await?;
        Ok(db)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time TIMESTAMP NOT NULL UNIQUE,
                end_time TIMESTAMP NOT NULL,
                bundle TEXT NOT NULL,
                title TEXT NOT NULL,
                pinned BOOLEAN NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                start_time TIMESTAMP NOT NULL,
                end_time TIMESTAMP NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bundle_exclusions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bundle TEXT NOT NULL UNIQUE,
                excluded BOOLEAN NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_episodes_start ON episodes (start_time)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_episode ON documents (episode_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Creates an open episode (`end_time == start_time`) and returns its id.
    pub async fn insert_episode(
        &self,
        start: DateTime<Utc>,
        bundle: &str,
        title: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO episodes (start_time, end_time, bundle, title, pinned)
             VALUES (?1, ?1, ?2, ?3, 0)",
        )
        .bind(start)
        .bind(bundle)
        .bind(title)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn close_episode(&self, id: i64, end: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE episodes SET end_time = ?1 WHERE id = ?2")
            .bind(end)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_pinned(&self, id: i64, pinned: bool) -> Result<()> {
        sqlx::query("UPDATE episodes SET pinned = ?1 WHERE id = ?2")
            .bind(pinned)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_episode(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM episodes WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn episode_by_id(&self, id: i64) -> Result<Option<Episode>> {
        let episode = sqlx::query_as::<_, Episode>("SELECT * FROM episodes WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(episode)
    }

    pub async fn most_recent_episode(&self) -> Result<Option<Episode>> {
        let episode =
            sqlx::query_as::<_, Episode>("SELECT * FROM episodes ORDER BY start_time DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(episode)
    }

    /// Episodes older than the retention cutoff, pinned included (the caller
    /// decides what to skip).
    pub async fn episodes_started_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Episode>> {
        let episodes = sqlx::query_as::<_, Episode>(
            "SELECT * FROM episodes WHERE start_time < ?1 ORDER BY start_time ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(episodes)
    }

    /// Episodes never closed (`end_time == start_time`), cleaned up on startup.
    pub async fn unclosed_episodes(&self) -> Result<Vec<Episode>> {
        let episodes =
            sqlx::query_as::<_, Episode>("SELECT * FROM episodes WHERE end_time = start_time")
                .fetch_all(&self.pool)
                .await?;
        Ok(episodes)
    }

    pub async fn list_episodes(&self) -> Result<Vec<Episode>> {
        let episodes =
            sqlx::query_as::<_, Episode>("SELECT * FROM episodes ORDER BY start_time DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(episodes)
    }

    pub async fn insert_document(
        &self,
        episode_id: i64,
        path: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO documents (episode_id, path, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(episode_id)
        .bind(path)
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn documents_for_episode(&self, episode_id: i64) -> Result<Vec<Document>> {
        let docs = sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE episode_id = ?1 ORDER BY start_time ASC",
        )
        .bind(episode_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(docs)
    }

    pub async fn delete_documents_for_episode(&self, episode_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM documents WHERE episode_id = ?1")
            .bind(episode_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Returns the exclusion row for `bundle`, creating it with defaults when
    /// the bundle has never been seen.
    pub async fn get_or_create_exclusion(&self, bundle: &str) -> Result<BundleExclusion> {
        if let Some(existing) = sqlx::query_as::<_, BundleExclusion>(
            "SELECT * FROM bundle_exclusions WHERE bundle = ?1",
        )
        .bind(bundle)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(existing);
        }
        let result =
            sqlx::query("INSERT INTO bundle_exclusions (bundle, excluded) VALUES (?1, 0)")
                .bind(bundle)
                .execute(&self.pool)
                .await?;
        Ok(BundleExclusion {
            id: result.last_insert_rowid(),
            bundle: bundle.to_string(),
            excluded: false,
        })
    }

    pub async fn set_excluded(&self, bundle: &str, excluded: bool) -> Result<()> {
        self.get_or_create_exclusion(bundle).await?;
        sqlx::query("UPDATE bundle_exclusions SET excluded = ?1 WHERE bundle = ?2")
            .bind(excluded)
            .bind(bundle)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

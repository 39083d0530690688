//! Append-only event persistence.
//!
//! [`EventStore`] is the seam between the recorder/aggregator and the
//! storage medium. [`SqliteEventStore`] is the production implementation;
//! each append is a single `INSERT`, so readers never see partial rows.

use std::{path::Path, str::FromStr, time::Duration};

use {
    async_trait::async_trait,
    serde::Serialize,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    },
    time::OffsetDateTime,
    tracing::info,
};

use crate::{BlockEvent, BlockReason, Error, RequestEvent, Result};

/// Counts and traffic volume over a time window. Traffic is in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub total_traffic_bytes: u64,
}

/// Storage for request and block events.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_request(&self, event: &RequestEvent) -> Result<()>;
    async fn append_block(&self, event: &BlockEvent) -> Result<()>;
    /// Totals over every event with `timestamp >= since`.
    async fn window_stats(&self, since: OffsetDateTime) -> Result<WindowStats>;
    /// Newest block events first.
    async fn recent_blocks(&self, limit: usize) -> Result<Vec<BlockEvent>>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS requests (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp     INTEGER NOT NULL,
        client_ip     TEXT    NOT NULL,
        method        TEXT    NOT NULL,
        host          TEXT    NOT NULL,
        path          TEXT,
        status_code   INTEGER,
        response_size INTEGER,
        user_agent    TEXT,
        blocked       INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests (timestamp)",
    "CREATE TABLE IF NOT EXISTS blocked_content (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp     INTEGER NOT NULL,
        client_ip     TEXT    NOT NULL,
        url           TEXT    NOT NULL,
        reason        TEXT    NOT NULL,
        matched_value TEXT    NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_blocked_content_timestamp ON blocked_content (timestamp)",
    "CREATE TABLE IF NOT EXISTS settings (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Wrap an existing pool. Call [`SqliteEventStore::init`] first.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file at `path` and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::init(&pool).await?;
        info!(path = %path.display(), "event store ready");
        Ok(Self::new(pool))
    }

    /// Create tables and indexes. Safe to run on every startup.
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append_request(&self, event: &RequestEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO requests
                (timestamp, client_ip, method, host, path, status_code, response_size, user_agent, blocked)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(to_millis(event.timestamp))
        .bind(&event.client_ip)
        .bind(&event.method)
        .bind(&event.host)
        .bind(&event.path)
        .bind(i64::from(event.status_code))
        .bind(to_i64(event.response_size_bytes))
        .bind(event.user_agent.as_deref())
        .bind(event.blocked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_block(&self, event: &BlockEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO blocked_content (timestamp, client_ip, url, reason, matched_value)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(to_millis(event.timestamp))
        .bind(&event.client_ip)
        .bind(&event.url)
        .bind(event.reason.as_str())
        .bind(&event.matched_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn window_stats(&self, since: OffsetDateTime) -> Result<WindowStats> {
        let since = to_millis(since);
        let (total_requests, total_traffic_bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(id), COALESCE(SUM(response_size), 0) FROM requests WHERE timestamp >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        let blocked_requests: i64 =
            sqlx::query_scalar("SELECT COUNT(id) FROM blocked_content WHERE timestamp >= ?")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;

        Ok(WindowStats {
            total_requests: to_u64(total_requests),
            blocked_requests: to_u64(blocked_requests),
            total_traffic_bytes: to_u64(total_traffic_bytes),
        })
    }

    async fn recent_blocks(&self, limit: usize) -> Result<Vec<BlockEvent>> {
        let rows = sqlx::query(
            "SELECT timestamp, client_ip, url, reason, matched_value FROM blocked_content
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(block_from_row).collect()
    }
}

fn block_from_row(row: &SqliteRow) -> Result<BlockEvent> {
    let reason: String = row.try_get("reason")?;
    Ok(BlockEvent {
        timestamp: from_millis(row.try_get("timestamp")?)?,
        client_ip: row.try_get("client_ip")?,
        url: row.try_get("url")?,
        reason: BlockReason::from_str(&reason)?,
        matched_value: row.try_get("matched_value")?,
    })
}

fn to_millis(ts: OffsetDateTime) -> i64 {
    i64::try_from(ts.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| Error::message(format!("stored timestamp out of range: {e}")))
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}

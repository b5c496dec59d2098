use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// One table per cache namespace, all with the same shape.
pub const INIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS search_cache (
    cache_key TEXT PRIMARY KEY,
    tag TEXT,
    payload TEXT NOT NULL,
    written_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS place_details_cache (
    cache_key TEXT PRIMARY KEY,
    tag TEXT,
    payload TEXT NOT NULL,
    written_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS processed_leads (
    cache_key TEXT PRIMARY KEY,
    tag TEXT,
    payload TEXT NOT NULL,
    written_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_search_cache_written_at ON search_cache(written_at);
CREATE INDEX IF NOT EXISTS idx_place_details_cache_written_at ON place_details_cache(written_at);
CREATE INDEX IF NOT EXISTS idx_processed_leads_written_at ON processed_leads(written_at);
CREATE INDEX IF NOT EXISTS idx_processed_leads_tag ON processed_leads(tag);
"#;

pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Opens (creating if missing) the SQLite file behind `database_url`.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::initialize(pool).await
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::initialize(pool).await
    }

    async fn initialize(pool: SqlitePool) -> anyhow::Result<Self> {
        sqlx::raw_sql(INIT_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

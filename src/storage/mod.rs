//! Persistence layer.
//!
//! A [`Store`] owns the SQLite pool. Table DDL is generated from the
//! normalizer's table definitions so the field maps and the stored schema
//! always agree. Upserts live in [`upsert`], resume checkpoints in
//! [`checkpoint`], and the optional JSON run report in [`run_log`].

pub mod checkpoint;
pub mod run_log;
pub mod upsert;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::normalize::schema::{TableSchema, ALL_TABLES};

pub use upsert::{BatchOutcome, CheckpointUpdate, WriteBatch};

/// Busy timeout for the in-memory store.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bookkeeping columns appended to every entity table.
pub const PAYLOAD_COLUMN: &str = "payload";
pub const FIRST_SEEN_COLUMN: &str = "first_seen_at";
pub const UPDATED_COLUMN: &str = "updated_at";

const CHECKPOINT_DDL: &str = "CREATE TABLE IF NOT EXISTS sync_checkpoints (
    entity TEXT PRIMARY KEY NOT NULL,
    next_cursor TEXT,
    pages_completed INTEGER NOT NULL,
    failed_batch INTEGER,
    fingerprint TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// Handle to the relational store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    write_timeout: Duration,
}

impl Store {
    /// Open (creating if needed) the database named by `config.db_url`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.db_url)
            .with_context(|| format!("Invalid database URL: {}", config.db_url))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", config.db_url))?;

        info!(db_url = %config.db_url, "Connected to store");
        Ok(Self {
            pool,
            write_timeout: Duration::from_secs(config.write_timeout_secs),
        })
    }

    /// A private in-memory database. All work goes through one connection
    /// that is never recycled, so the data lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        Ok(Self {
            pool,
            write_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create every table and index that does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ALL_TABLES {
            sqlx::query(&create_table_sql(table))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to create table {}", table.name))?;
            for ddl in create_index_sql(table) {
                sqlx::query(&ddl)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to index table {}", table.name))?;
            }
        }
        sqlx::query(CHECKPOINT_DDL)
            .execute(&mut *tx)
            .await
            .context("Failed to create sync_checkpoints")?;
        tx.commit().await?;

        debug!(tables = ALL_TABLES.len(), "Schema migrated");
        Ok(())
    }

    /// Row counts for every entity table, parents first.
    pub async fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        let mut counts = Vec::with_capacity(ALL_TABLES.len());
        for table in ALL_TABLES {
            let sql = format!("SELECT COUNT(*) FROM {}", table.name);
            let count: i64 = sqlx::query_scalar(&sql)
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("Failed to count {}", table.name))?;
            counts.push((table.name, count));
        }
        Ok(counts)
    }
}

/// `CREATE TABLE IF NOT EXISTS` for one table definition.
pub fn create_table_sql(table: &TableSchema) -> String {
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let null = if c.required { " NOT NULL" } else { "" };
            format!("    {} {}{null}", c.column, c.kind.sql_type())
        })
        .collect();

    lines.push(format!("    {PAYLOAD_COLUMN} TEXT NOT NULL"));
    lines.push(format!("    {FIRST_SEEN_COLUMN} TEXT NOT NULL"));
    lines.push(format!("    {UPDATED_COLUMN} TEXT NOT NULL"));
    lines.push(format!("    PRIMARY KEY ({})", table.key.join(", ")));

    for fk in table.foreign_keys {
        lines.push(format!(
            "    FOREIGN KEY ({}) REFERENCES {} ({})",
            fk.columns.join(", "),
            fk.references,
            fk.ref_columns.join(", ")
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        table.name,
        lines.join(",\n")
    )
}

/// Secondary indexes for one table definition.
pub fn create_index_sql(table: &TableSchema) -> Vec<String> {
    table
        .indexes
        .iter()
        .map(|(name, columns)| {
            format!(
                "CREATE INDEX IF NOT EXISTS {name} ON {} ({})",
                table.name,
                columns.join(", ")
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

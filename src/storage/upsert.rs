//! Batch upserts.
//!
//! Every batch runs in one transaction: roots, then their children, then
//! stale-child pruning, then the checkpoint update. Nothing from a batch
//! is visible unless all of it commits.

use chrono::{SecondsFormat, Utc};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection};
use sqlx::query::Query;
use tracing::{debug, warn};

use super::{checkpoint, Store, FIRST_SEEN_COLUMN, PAYLOAD_COLUMN, UPDATED_COLUMN};
use crate::normalize::schema::TableSchema;
use crate::normalize::{EntityRecord, NormalizedPayload};
use crate::types::{Checkpoint, EntityKind, SqlValue, SyncError};

/// What happens to the entity's checkpoint when a batch commits.
#[derive(Debug, Clone, Copy)]
pub enum CheckpointUpdate<'a> {
    /// Leave it alone (not the last batch of a page).
    Keep,
    /// Store this checkpoint (last batch of a page with more to come).
    Advance(&'a Checkpoint),
    /// Delete it (last batch of the final page).
    Complete,
}

/// One unit of work for [`Store::upsert_batch`].
#[derive(Debug, Clone, Copy)]
pub struct WriteBatch<'a> {
    pub entity: EntityKind,
    pub batch_index: usize,
    pub payloads: &'a [NormalizedPayload],
    pub checkpoint: CheckpointUpdate<'a>,
}

/// Row counts from one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows inserted or changed.
    pub written: u64,
    /// Rows whose stored contents already matched.
    pub unchanged: u64,
    /// Stale child rows deleted.
    pub pruned: u64,
}

impl Store {
    /// Upsert one batch atomically, bounded by the store's write timeout.
    pub async fn upsert_batch(&self, batch: WriteBatch<'_>) -> Result<BatchOutcome, SyncError> {
        let timeout = self.write_timeout;
        match tokio::time::timeout(timeout, self.write_batch(batch)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    entity = %batch.entity,
                    batch = batch.batch_index,
                    "Write transaction timed out, rolled back"
                );
                Err(SyncError::StoreTimeout {
                    entity: batch.entity,
                    batch: batch.batch_index,
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn write_batch(&self, batch: WriteBatch<'_>) -> Result<BatchOutcome, SyncError> {
        let entity = batch.entity;
        let now = timestamp();
        let mut outcome = BatchOutcome::default();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error(entity, &e))?;

        for payload in batch.payloads {
            upsert_record(&mut tx, &batch, &payload.root, &now, &mut outcome).await?;
            for child in &payload.children {
                upsert_record(&mut tx, &batch, child, &now, &mut outcome).await?;
            }
            for table in payload.root.table.child_tables() {
                outcome.pruned += prune_children(&mut tx, &batch, payload, table).await?;
            }
        }

        match batch.checkpoint {
            CheckpointUpdate::Keep => {}
            CheckpointUpdate::Advance(cp) => checkpoint::write(&mut tx, cp, &now)
                .await
                .map_err(|e| store_error(entity, &e))?,
            CheckpointUpdate::Complete => checkpoint::delete(&mut tx, entity)
                .await
                .map_err(|e| store_error(entity, &e))?,
        }

        // Dropping `tx` on any early return above rolls back.
        tx.commit().await.map_err(|e| store_error(entity, &e))?;

        debug!(
            %entity,
            batch = batch.batch_index,
            payloads = batch.payloads.len(),
            written = outcome.written,
            unchanged = outcome.unchanged,
            pruned = outcome.pruned,
            "Batch committed"
        );
        Ok(outcome)
    }
}

async fn upsert_record(
    conn: &mut SqliteConnection,
    batch: &WriteBatch<'_>,
    record: &EntityRecord,
    now: &str,
    outcome: &mut BatchOutcome,
) -> Result<(), SyncError> {
    let sql = upsert_sql(record.table);
    let mut query = sqlx::query(&sql);
    for value in &record.values {
        query = bind_value(query, value);
    }
    let result = query
        .bind(record.payload.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(batch, record.table.name, &record.key_display(), &e))?;

    if result.rows_affected() > 0 {
        outcome.written += 1;
    } else {
        outcome.unchanged += 1;
    }
    Ok(())
}

/// Delete child rows of `payload` that the latest payload no longer lists.
async fn prune_children(
    conn: &mut SqliteConnection,
    batch: &WriteBatch<'_>,
    payload: &NormalizedPayload,
    table: &'static TableSchema,
) -> Result<u64, SyncError> {
    let parent_values = payload.root.key_values();
    let Some(disc) = table.child_discriminator().first().copied() else {
        return Ok(0);
    };
    let keep: Vec<&SqlValue> = payload
        .children
        .iter()
        .filter(|c| c.table.name == table.name)
        .filter_map(|c| c.value(disc))
        .collect();

    let sql = prune_sql(table, keep.len());
    let mut query = sqlx::query(&sql);
    for value in parent_values.iter().chain(keep.iter()) {
        query = bind_value(query, *value);
    }
    let result = query
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(batch, table.name, &payload.root.key_display(), &e))?;
    Ok(result.rows_affected())
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Integer(i) => query.bind(*i),
        SqlValue::Real(r) => query.bind(*r),
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Bool(b) => query.bind(*b),
    }
}

/// `INSERT .. ON CONFLICT DO UPDATE` that only touches rows whose
/// contents differ, so re-running an unchanged batch is a no-op.
pub fn upsert_sql(table: &TableSchema) -> String {
    let mut columns: Vec<&str> = table.columns.iter().map(|c| c.column).collect();
    columns.extend([PAYLOAD_COLUMN, FIRST_SEEN_COLUMN, UPDATED_COLUMN]);
    let placeholders = vec!["?"; columns.len()].join(", ");

    let mut compared: Vec<&str> = table
        .columns
        .iter()
        .map(|c| c.column)
        .filter(|c| !table.key.contains(c))
        .collect();
    compared.push(PAYLOAD_COLUMN);

    let mut assignments: Vec<String> = compared
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    assignments.push(format!("{UPDATED_COLUMN} = excluded.{UPDATED_COLUMN}"));

    let changed: Vec<String> = compared
        .iter()
        .map(|c| format!("{}.{c} IS NOT excluded.{c}", table.name))
        .collect();

    format!(
        "INSERT INTO {table} ({columns}) VALUES ({placeholders}) \
         ON CONFLICT ({key}) DO UPDATE SET {assignments} WHERE {changed}",
        table = table.name,
        columns = columns.join(", "),
        key = table.key.join(", "),
        assignments = assignments.join(", "),
        changed = changed.join(" OR "),
    )
}

/// `DELETE` of a parent's child rows except the `keep` discriminators.
pub fn prune_sql(table: &TableSchema, keep: usize) -> String {
    let parent: Vec<String> = table.parent_key.iter().map(|c| format!("{c} = ?")).collect();
    let mut sql = format!("DELETE FROM {} WHERE {}", table.name, parent.join(" AND "));
    if keep > 0 {
        let disc = table.child_discriminator().join(", ");
        let placeholders = vec!["?"; keep].join(", ");
        sql.push_str(&format!(" AND {disc} NOT IN ({placeholders})"));
    }
    sql
}

pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Map a database error from a record write onto the error taxonomy.
fn classify(
    batch: &WriteBatch<'_>,
    table: &'static str,
    key: &str,
    err: &sqlx::Error,
) -> SyncError {
    if let sqlx::Error::Database(db) = err {
        match db.kind() {
            ErrorKind::ForeignKeyViolation
            | ErrorKind::UniqueViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => {
                return SyncError::IntegrityViolation {
                    entity: batch.entity,
                    table,
                    batch: batch.batch_index,
                    key: key.to_string(),
                    reason: db.message().to_string(),
                };
            }
            _ => {}
        }
    }
    store_error(batch.entity, err)
}

/// Non-constraint database failure. Busy/locked and pool exhaustion are
/// worth retrying; anything else is not.
pub(crate) fn store_error(entity: EntityKind, err: &sqlx::Error) -> SyncError {
    let retryable = match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    };
    SyncError::Store {
        entity,
        message: err.to_string(),
        retryable,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Resume checkpoints, one row per entity type in `sync_checkpoints`.

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::debug;

use super::upsert::{store_error, timestamp};
use super::Store;
use crate::types::{Checkpoint, EntityKind, SyncError};

impl Store {
    pub async fn load_checkpoint(
        &self,
        entity: EntityKind,
    ) -> Result<Option<Checkpoint>, SyncError> {
        let row = sqlx::query(
            "SELECT next_cursor, pages_completed, failed_batch, fingerprint
             FROM sync_checkpoints WHERE entity = ?",
        )
        .bind(entity.endpoint())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error(entity, &e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode = |e: sqlx::Error| store_error(entity, &e);
        let pages_completed: i64 = row.try_get("pages_completed").map_err(decode)?;
        let failed_batch: Option<i64> = row.try_get("failed_batch").map_err(decode)?;

        Ok(Some(Checkpoint {
            entity,
            next_cursor: row.try_get("next_cursor").map_err(decode)?,
            pages_completed: u64::try_from(pages_completed).unwrap_or(0),
            failed_batch: failed_batch.and_then(|b| usize::try_from(b).ok()),
            fingerprint: row.try_get("fingerprint").map_err(decode)?,
        }))
    }

    /// Store a checkpoint outside any batch, e.g. to record a failed batch
    /// or to advance past an empty page.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| store_error(checkpoint.entity, &e))?;
        write(&mut conn, checkpoint, &timestamp())
            .await
            .map_err(|e| store_error(checkpoint.entity, &e))?;
        debug!(
            entity = %checkpoint.entity,
            cursor = checkpoint.next_cursor.as_deref().unwrap_or("<first page>"),
            pages = checkpoint.pages_completed,
            failed_batch = ?checkpoint.failed_batch,
            "Checkpoint saved"
        );
        Ok(())
    }

    pub async fn clear_checkpoint(&self, entity: EntityKind) -> Result<(), SyncError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| store_error(entity, &e))?;
        delete(&mut conn, entity)
            .await
            .map_err(|e| store_error(entity, &e))?;
        Ok(())
    }
}

pub(crate) async fn write(
    conn: &mut SqliteConnection,
    checkpoint: &Checkpoint,
    now: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO sync_checkpoints
             (entity, next_cursor, pages_completed, failed_batch, fingerprint, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (entity) DO UPDATE SET
             next_cursor = excluded.next_cursor,
             pages_completed = excluded.pages_completed,
             failed_batch = excluded.failed_batch,
             fingerprint = excluded.fingerprint,
             updated_at = excluded.updated_at",
    )
    .bind(checkpoint.entity.endpoint())
    .bind(checkpoint.next_cursor.as_deref())
    .bind(i64::try_from(checkpoint.pages_completed).unwrap_or(i64::MAX))
    .bind(checkpoint.failed_batch.and_then(|b| i64::try_from(b).ok()))
    .bind(checkpoint.fingerprint.as_str())
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn delete(
    conn: &mut SqliteConnection,
    entity: EntityKind,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM sync_checkpoints WHERE entity = ?")
        .bind(entity.endpoint())
        .execute(conn)
        .await?;
    Ok(())
}

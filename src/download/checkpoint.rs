//! Resume checkpoints: how far a download got, persisted by download id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::error::DownloadError;
use crate::db::Database;

/// Persisted progress of one download id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    /// Bytes flushed to the output file.
    pub bytes_written: u64,
    /// First HLS segment not yet written.
    pub next_segment_index: Option<usize>,
    /// Declared or estimated total size when the checkpoint was taken.
    pub total_bytes_estimate: Option<u64>,
    /// Mirror the checkpoint belongs to.
    pub mirror_index: usize,
}

/// Key-value store for [`ResumeCheckpoint`]s.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Reads the checkpoint for `id`.
    async fn get(&self, id: &str) -> Result<Option<ResumeCheckpoint>, DownloadError>;

    /// Writes (replacing) the checkpoint for `id`.
    async fn put(&self, id: &str, checkpoint: &ResumeCheckpoint) -> Result<(), DownloadError>;

    /// Removes the checkpoint for `id`; missing ids are ignored.
    async fn remove(&self, id: &str) -> Result<(), DownloadError>;
}

/// Process-local checkpoint store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    entries: Arc<Mutex<HashMap<String, ResumeCheckpoint>>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, id: &str) -> Result<Option<ResumeCheckpoint>, DownloadError> {
        Ok(self.entries.lock().await.get(id).copied())
    }

    async fn put(&self, id: &str, checkpoint: &ResumeCheckpoint) -> Result<(), DownloadError> {
        self.entries
            .lock()
            .await
            .insert(id.to_string(), *checkpoint);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), DownloadError> {
        self.entries.lock().await.remove(id);
        Ok(())
    }
}

/// SQLite-backed checkpoint store using the `resume_checkpoints` table.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    db: Database,
}

impl SqliteCheckpointStore {
    /// Wraps a migrated database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn to_i64(id: &str, field: &str, value: u64) -> Result<i64, DownloadError> {
    i64::try_from(value)
        .map_err(|_| DownloadError::checkpoint(id, format!("{field} out of range: {value}")))
}

fn from_i64(id: &str, field: &str, value: i64) -> Result<u64, DownloadError> {
    u64::try_from(value)
        .map_err(|_| DownloadError::checkpoint(id, format!("{field} is negative: {value}")))
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, id: &str) -> Result<Option<ResumeCheckpoint>, DownloadError> {
        let row = sqlx::query(
            r"SELECT bytes_written, next_segment_index, total_bytes_estimate, mirror_index
              FROM resume_checkpoints
              WHERE download_id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| DownloadError::checkpoint(id, e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let read = |e: sqlx::Error| DownloadError::checkpoint(id, e.to_string());
        let bytes_written: i64 = row.try_get("bytes_written").map_err(read)?;
        let next_segment_index: Option<i64> = row.try_get("next_segment_index").map_err(read)?;
        let total_bytes_estimate: Option<i64> =
            row.try_get("total_bytes_estimate").map_err(read)?;
        let mirror_index: i64 = row.try_get("mirror_index").map_err(read)?;

        let next_segment_index = next_segment_index
            .map(|index| {
                usize::try_from(index).map_err(|_| {
                    DownloadError::checkpoint(id, format!("next_segment_index is invalid: {index}"))
                })
            })
            .transpose()?;
        let mirror_index = usize::try_from(mirror_index).map_err(|_| {
            DownloadError::checkpoint(id, format!("mirror_index is invalid: {mirror_index}"))
        })?;

        Ok(Some(ResumeCheckpoint {
            bytes_written: from_i64(id, "bytes_written", bytes_written)?,
            next_segment_index,
            total_bytes_estimate: total_bytes_estimate
                .map(|total| from_i64(id, "total_bytes_estimate", total))
                .transpose()?,
            mirror_index,
        }))
    }

    #[instrument(level = "debug", skip(self))]
    async fn put(&self, id: &str, checkpoint: &ResumeCheckpoint) -> Result<(), DownloadError> {
        let bytes_written = to_i64(id, "bytes_written", checkpoint.bytes_written)?;
        let next_segment_index = checkpoint
            .next_segment_index
            .map(|index| to_i64(id, "next_segment_index", index as u64))
            .transpose()?;
        let total_bytes_estimate = checkpoint
            .total_bytes_estimate
            .map(|total| to_i64(id, "total_bytes_estimate", total))
            .transpose()?;
        let mirror_index = to_i64(id, "mirror_index", checkpoint.mirror_index as u64)?;

        sqlx::query(
            r"INSERT INTO resume_checkpoints (
                download_id,
                bytes_written,
                next_segment_index,
                total_bytes_estimate,
                mirror_index
              ) VALUES (?, ?, ?, ?, ?)
              ON CONFLICT(download_id) DO UPDATE SET
                bytes_written = excluded.bytes_written,
                next_segment_index = excluded.next_segment_index,
                total_bytes_estimate = excluded.total_bytes_estimate,
                mirror_index = excluded.mirror_index,
                updated_at = datetime('now')",
        )
        .bind(id)
        .bind(bytes_written)
        .bind(next_segment_index)
        .bind(total_bytes_estimate)
        .bind(mirror_index)
        .execute(self.db.pool())
        .await
        .map_err(|e| DownloadError::checkpoint(id, e.to_string()))?;

        debug!(bytes_written, ?next_segment_index, "checkpoint stored");
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn remove(&self, id: &str) -> Result<(), DownloadError> {
        sqlx::query("DELETE FROM resume_checkpoints WHERE download_id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| DownloadError::checkpoint(id, e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> ResumeCheckpoint {
        ResumeCheckpoint {
            bytes_written: 4096,
            next_segment_index: Some(7),
            total_bytes_estimate: Some(1 << 20),
            mirror_index: 1,
        }
    }

    #[tokio::test]
    async fn test_memory_store_put_get_remove() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.put("a", &sample()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(sample()));
        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_store_upserts() {
        let store = SqliteCheckpointStore::new(Database::new_in_memory().await.unwrap());
        store.put("video-1", &sample()).await.unwrap();

        let updated = ResumeCheckpoint {
            bytes_written: 8192,
            next_segment_index: None,
            total_bytes_estimate: None,
            mirror_index: 0,
        };
        store.put("video-1", &updated).await.unwrap();
        assert_eq!(store.get("video-1").await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_sqlite_store_remove_and_missing() {
        let store = SqliteCheckpointStore::new(Database::new_in_memory().await.unwrap());
        assert_eq!(store.get("nope").await.unwrap(), None);
        store.put("video-1", &sample()).await.unwrap();
        store.remove("video-1").await.unwrap();
        store.remove("video-1").await.unwrap();
        assert_eq!(store.get("video-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("checkpoints.db");

        let store = SqliteCheckpointStore::new(Database::new(&path).await.unwrap());
        store.put("video-1", &sample()).await.unwrap();
        drop(store);

        let reopened = SqliteCheckpointStore::new(Database::new(&path).await.unwrap());
        assert_eq!(reopened.get("video-1").await.unwrap(), Some(sample()));
    }
}

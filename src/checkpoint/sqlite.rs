use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ensure_thread, writer_identity, Checkpoint, CheckpointError, CheckpointStore, StoreBackend};
use crate::config::DatabaseConfig;
use crate::workflow::WorkflowState;

const MAX_APPEND_ATTEMPTS: u32 = 5;
const GENERATED_FILES_FIELD: &str = "generated_files";
/// Pending writes older than this belong to a process that died mid-append
const STALE_PENDING_AFTER: chrono::Duration = chrono::Duration::seconds(60);

#[derive(Debug, FromRow)]
struct CheckpointRow {
    thread_id: String,
    sequence: i64,
    state_json: String,
    has_blobs: bool,
    writer: String,
    created_at: String,
}

#[derive(Debug, FromRow)]
struct BlobRow {
    field: String,
    content: String,
}

#[derive(Debug, FromRow)]
struct PendingRow {
    write_id: String,
    thread_id: String,
    created_at: String,
}

/// Durable checkpoint store on SQLite.
///
/// Each append first records a pending write, then commits the snapshot, its
/// blobs and the removal of the pending record in one transaction. Readers only
/// ever see committed snapshots. Several processes may share the database
/// file; sequence allocation happens inside the write transaction and is
/// retried on conflict.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    blob_threshold: usize,
    writer: String,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore")
            .field("blob_threshold", &self.blob_threshold)
            .field("writer", &self.writer)
            .finish()
    }
}

impl SqliteCheckpointStore {
    /// Open (creating if needed) the database and apply migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, CheckpointError> {
        let options = connect_options(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        if config.auto_migrate {
            info!("Running checkpoint store migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Checkpoint store migrations completed");
        }

        Ok(Self {
            pool,
            blob_threshold: config.blob_threshold_bytes,
            writer: writer_identity(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Discard intent records left behind by writers that died before commit.
    ///
    /// An uncommitted append was never visible, so the thread simply resumes
    /// from its previous checkpoint. Returns the number of records discarded.
    pub async fn recover_pending(&self) -> Result<usize, CheckpointError> {
        let rows: Vec<PendingRow> =
            sqlx::query_as("SELECT write_id, thread_id, created_at FROM pending_writes")
                .fetch_all(&self.pool)
                .await?;

        let cutoff = Utc::now() - STALE_PENDING_AFTER;
        let mut discarded = 0;

        for row in rows {
            let created_at = parse_timestamp(&row.created_at).unwrap_or(DateTime::<Utc>::MIN_UTC);
            if created_at > cutoff {
                continue;
            }

            warn!(
                thread_id = %row.thread_id,
                write_id = %row.write_id,
                created_at = %row.created_at,
                "Discarding orphaned pending checkpoint write"
            );
            sqlx::query("DELETE FROM pending_writes WHERE write_id = ?1")
                .bind(&row.write_id)
                .execute(&self.pool)
                .await?;
            discarded += 1;
        }

        Ok(discarded)
    }

    /// Split oversized fields off into blob rows
    fn encode(&self, state: &WorkflowState) -> Result<(String, Option<String>), CheckpointError> {
        let files_json = serde_json::to_string(&state.generated_files)?;
        if files_json.len() <= self.blob_threshold {
            return Ok((serde_json::to_string(state)?, None));
        }

        let mut slim = state.clone();
        slim.generated_files = BTreeMap::new();
        Ok((serde_json::to_string(&slim)?, Some(files_json)))
    }

    async fn try_append(
        &self,
        thread_id: &str,
        state: &WorkflowState,
        state_json: &str,
        blob: Option<&str>,
        write_id: &str,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // The first statement writes, so the write lock is held before the max is read
        let (sequence,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO checkpoints (thread_id, sequence, status, active_stage, state_json, has_blobs, writer, created_at)
            SELECT ?1, COALESCE(MAX(sequence), 0) + 1, ?2, ?3, ?4, ?5, ?6, ?7
            FROM checkpoints WHERE thread_id = ?1
            RETURNING sequence
            "#,
        )
        .bind(thread_id)
        .bind(state.status.as_str())
        .bind(state.active_stage.as_str())
        .bind(state_json)
        .bind(blob.is_some())
        .bind(&self.writer)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&mut *tx)
        .await?;

        if let Some(content) = blob {
            sqlx::query(
                "INSERT INTO checkpoint_blobs (thread_id, sequence, field, content) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(thread_id)
            .bind(sequence)
            .bind(GENERATED_FILES_FIELD)
            .bind(content)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM pending_writes WHERE write_id = ?1")
            .bind(write_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(sequence as u64)
    }

    async fn load(&self, row: CheckpointRow) -> Result<Checkpoint, CheckpointError> {
        let sequence = row.sequence as u64;
        let corrupt = |reason: String| CheckpointError::Corrupt {
            thread_id: row.thread_id.clone(),
            sequence,
            reason,
        };

        let mut state: WorkflowState =
            serde_json::from_str(&row.state_json).map_err(|e| corrupt(e.to_string()))?;

        if row.has_blobs {
            let blobs: Vec<BlobRow> = sqlx::query_as(
                "SELECT field, content FROM checkpoint_blobs WHERE thread_id = ?1 AND sequence = ?2",
            )
            .bind(&row.thread_id)
            .bind(row.sequence)
            .fetch_all(&self.pool)
            .await?;

            let files = blobs
                .into_iter()
                .find(|blob| blob.field == GENERATED_FILES_FIELD)
                .ok_or_else(|| corrupt("generated_files blob is missing".to_string()))?;
            state.generated_files =
                serde_json::from_str(&files.content).map_err(|e| corrupt(e.to_string()))?;
        }

        let created_at = parse_timestamp(&row.created_at)
            .ok_or_else(|| corrupt(format!("bad timestamp {}", row.created_at)))?;

        Ok(Checkpoint {
            thread_id: row.thread_id,
            sequence_number: sequence,
            state,
            created_at,
            writer: row.writer,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn append(&self, thread_id: &str, state: &WorkflowState) -> Result<u64, CheckpointError> {
        ensure_thread(thread_id, state)?;
        let (state_json, blob) = self.encode(state)?;
        let write_id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO pending_writes (write_id, thread_id, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&write_id)
        .bind(thread_id)
        .bind(&state_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_append(thread_id, state, &state_json, blob.as_deref(), &write_id)
                .await
            {
                Ok(sequence) => {
                    debug!(thread_id = %thread_id, sequence, attempt, "Checkpoint committed");
                    return Ok(sequence);
                }
                Err(e) if is_contention(&e) && attempt < MAX_APPEND_ATTEMPTS => {
                    let backoff = Duration::from_millis(rand::rng().random_range(5..50) * attempt as u64);
                    debug!(thread_id = %thread_id, attempt, error = %e, "Checkpoint append contended, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    // Best effort; recover_pending cleans up anything left behind
                    let _ = sqlx::query("DELETE FROM pending_writes WHERE write_id = ?1")
                        .bind(&write_id)
                        .execute(&self.pool)
                        .await;

                    if is_contention(&e) {
                        return Err(CheckpointError::SequenceConflict {
                            thread_id: thread_id.to_string(),
                            attempts: attempt,
                        });
                    }
                    return Err(e.into());
                }
            }
        }
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT thread_id, sequence, state_json, has_blobs, writer, created_at
            FROM checkpoints
            WHERE thread_id = ?1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT thread_id, sequence, state_json, has_blobs, writer, created_at
            FROM checkpoints
            WHERE thread_id = ?1
            ORDER BY sequence ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in rows {
            checkpoints.push(self.load(row).await?);
        }
        Ok(checkpoints)
    }

    async fn prune(&self, thread_id: &str, keep_last: usize) -> Result<usize, CheckpointError> {
        let keep_last = keep_last.max(1) as i64;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM checkpoint_blobs
            WHERE thread_id = ?1 AND sequence NOT IN (
                SELECT sequence FROM checkpoints WHERE thread_id = ?1 ORDER BY sequence DESC LIMIT ?2
            )
            "#,
        )
        .bind(thread_id)
        .bind(keep_last)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM checkpoints
            WHERE thread_id = ?1 AND sequence NOT IN (
                SELECT sequence FROM checkpoints WHERE thread_id = ?1 ORDER BY sequence DESC LIMIT ?2
            )
            "#,
        )
        .bind(thread_id)
        .bind(keep_last)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let removed = deleted.rows_affected() as usize;
        if removed > 0 {
            info!(thread_id = %thread_id, removed, "Pruned old checkpoints");
        }
        Ok(removed)
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Durable
    }

    async fn shutdown(&self) {
        info!("Shutting down checkpoint store connections...");
        self.pool.close().await;
        info!("Checkpoint store connections closed");
    }
}

/// Accepts either a `sqlite:` URL or a plain file path
fn connect_options(url: &str) -> Result<SqliteConnectOptions, CheckpointError> {
    if url.starts_with("sqlite:") {
        return Ok(SqliteConnectOptions::from_str(url)?);
    }

    let path = Path::new(url);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(SqliteConnectOptions::new().filename(path))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Another writer won the race for the same sequence number or the write lock
fn is_contention(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.is_unique_violation()
                || matches!(db.code().as_deref(), Some("5") | Some("517") | Some("6"))
        }
        _ => false,
    }
}

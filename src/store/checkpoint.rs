//! Checkpoint management for tracking pipeline progress.
//!
//! One checkpoint row exists per (mailbox, pipeline). The ingest pipeline
//! stores its watermark in `last_synced_at`; the attachment pipeline stores
//! its scan cursor in `progress_cursor`. The two pipelines share the table
//! but write disjoint fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};

pub const INGEST_PIPELINE: &str = "ingest";
pub const ATTACHMENT_PIPELINE: &str = "download_attachments";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckpointRow {
    pub id: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub progress_cursor: Option<Value>,
}

/// Attachment scan position stored inside `progress_cursor`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AttachmentCursor {
    pub last_message_id: i64,
    pub scanned_messages: i64,
}

impl CheckpointRow {
    /// Decode the attachment cursor, defaulting to the scan origin when the
    /// field is absent or unreadable.
    pub fn attachment_cursor(&self) -> AttachmentCursor {
        self.progress_cursor
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }
}

/// Fetch the checkpoint for (mailbox, pipeline), creating it on first use.
pub async fn get_or_create(
    pool: &PgPool,
    mailbox_id: i64,
    pipeline_name: &str,
) -> Result<CheckpointRow, sqlx::Error> {
    sqlx::query_as(
        r#"INSERT INTO pipeline_checkpoints (mailbox_id, pipeline_name)
           VALUES ($1, $2)
           ON CONFLICT (mailbox_id, pipeline_name)
               DO UPDATE SET pipeline_name = EXCLUDED.pipeline_name
           RETURNING id, last_synced_at, progress_cursor"#,
    )
    .bind(mailbox_id)
    .bind(pipeline_name)
    .fetch_one(pool)
    .await
}

/// Advance the ingest watermark and record the run that produced it.
///
/// `GREATEST` keeps the watermark monotonic: a run can never move it
/// backwards, only forward or leave it unchanged.
pub async fn advance_watermark(
    pool: &PgPool,
    checkpoint_id: i64,
    watermark: DateTime<Utc>,
    run_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"UPDATE pipeline_checkpoints SET
               last_synced_at = GREATEST(COALESCE(last_synced_at, $2), $2),
               last_run_id = $3,
               updated_at = NOW()
           WHERE id = $1"#,
    )
    .bind(checkpoint_id)
    .bind(watermark)
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the run id without touching the watermark (used when a run
/// observed no messages).
pub async fn record_run(
    pool: &PgPool,
    checkpoint_id: i64,
    run_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE pipeline_checkpoints SET last_run_id = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(checkpoint_id)
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Persist the attachment scan cursor. Called inside the batch transaction
/// so the cursor and the batch's row changes commit together.
pub async fn save_cursor(
    conn: &mut PgConnection,
    checkpoint_id: i64,
    cursor: &AttachmentCursor,
) -> Result<(), sqlx::Error> {
    let value = serde_json::to_value(cursor).expect("cursor serializes");
    sqlx::query(
        "UPDATE pipeline_checkpoints SET progress_cursor = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(checkpoint_id)
    .bind(value)
    .execute(conn)
    .await?;

    Ok(())
}

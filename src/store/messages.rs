use crate::models::MessagePayload;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};

/// Message row fields needed by the attachment scan.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageScanRow {
    pub id: i64,
    pub remote_message_id: String,
}

/// Upsert a message by (mailbox, remote message id).
///
/// # Returns
/// `true` when the row was newly inserted (counts toward "processed"),
/// `false` when an existing row was refreshed.
pub async fn upsert_message(
    conn: &mut PgConnection,
    mailbox_id: i64,
    payload: &MessagePayload,
    raw: &Value,
) -> Result<bool, sqlx::Error> {
    let insert = sqlx::query(
        r#"INSERT INTO messages (
               mailbox_id, remote_message_id, remote_folder_id, conversation_id,
               sender, subject, received_at, body_preview, has_attachments, raw_json
           )
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
           ON CONFLICT (mailbox_id, remote_message_id) DO NOTHING"#,
    )
    .bind(mailbox_id)
    .bind(&payload.id)
    .bind(&payload.parent_folder_id)
    .bind(&payload.conversation_id)
    .bind(payload.sender_address())
    .bind(&payload.subject)
    .bind(payload.received_at())
    .bind(&payload.body_preview)
    .bind(payload.has_attachments)
    .bind(raw)
    .execute(&mut *conn)
    .await?;

    if insert.rows_affected() == 1 {
        return Ok(true);
    }

    sqlx::query(
        r#"UPDATE messages SET
               remote_folder_id = $3,
               conversation_id = $4,
               sender = $5,
               subject = $6,
               received_at = $7,
               body_preview = $8,
               has_attachments = $9,
               raw_json = $10,
               updated_at = NOW()
           WHERE mailbox_id = $1 AND remote_message_id = $2"#,
    )
    .bind(mailbox_id)
    .bind(&payload.id)
    .bind(&payload.parent_folder_id)
    .bind(&payload.conversation_id)
    .bind(payload.sender_address())
    .bind(&payload.subject)
    .bind(payload.received_at())
    .bind(&payload.body_preview)
    .bind(payload.has_attachments)
    .bind(raw)
    .execute(conn)
    .await?;

    Ok(false)
}

/// Next batch of attachment-flagged messages strictly after `after_id`,
/// in ascending internal-id order.
pub async fn fetch_attachment_batch(
    pool: &PgPool,
    mailbox_id: i64,
    after_id: i64,
    limit: i64,
) -> Result<Vec<MessageScanRow>, sqlx::Error> {
    sqlx::query_as(
        r#"SELECT id, remote_message_id FROM messages
           WHERE mailbox_id = $1 AND has_attachments AND id > $2
           ORDER BY id ASC
           LIMIT $3"#,
    )
    .bind(mailbox_id)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Total attachment-flagged messages for a mailbox (scan target count).
pub async fn count_attachment_targets(
    pool: &PgPool,
    mailbox_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE mailbox_id = $1 AND has_attachments",
    )
    .bind(mailbox_id)
    .fetch_one(pool)
    .await
}

use crate::models::AttachmentPayload;
use sqlx::PgConnection;

/// Upsert a successfully stored attachment by (mailbox, remote attachment
/// id). Clears any previous error text.
pub async fn upsert_attachment_success(
    conn: &mut PgConnection,
    mailbox_id: i64,
    message_id: i64,
    remote_message_id: &str,
    payload: &AttachmentPayload,
    remote_attachment_id: &str,
    file_path: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO attachments (
               mailbox_id, message_id, remote_attachment_id, remote_message_id,
               name, content_type, size_bytes, file_path, download_status
           )
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'success')
           ON CONFLICT (mailbox_id, remote_attachment_id) DO UPDATE SET
               message_id = EXCLUDED.message_id,
               remote_message_id = EXCLUDED.remote_message_id,
               name = EXCLUDED.name,
               content_type = EXCLUDED.content_type,
               size_bytes = EXCLUDED.size_bytes,
               file_path = EXCLUDED.file_path,
               download_status = 'success',
               error_message = NULL,
               updated_at = NOW()"#,
    )
    .bind(mailbox_id)
    .bind(message_id)
    .bind(remote_attachment_id)
    .bind(remote_message_id)
    .bind(&payload.name)
    .bind(&payload.content_type)
    .bind(payload.size)
    .bind(file_path)
    .execute(conn)
    .await?;

    Ok(())
}

/// Record a failed download attempt.
///
/// Deliberately leaves `file_path` alone so a previously successful file is
/// never clobbered by a later failure; only status and error text change.
pub async fn mark_attachment_failure(
    conn: &mut PgConnection,
    mailbox_id: i64,
    message_id: i64,
    remote_message_id: &str,
    remote_attachment_id: &str,
    name: Option<&str>,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO attachments (
               mailbox_id, message_id, remote_attachment_id, remote_message_id,
               name, download_status, error_message
           )
           VALUES ($1, $2, $3, $4, $5, 'failure', $6)
           ON CONFLICT (mailbox_id, remote_attachment_id) DO UPDATE SET
               message_id = EXCLUDED.message_id,
               download_status = 'failure',
               error_message = EXCLUDED.error_message,
               updated_at = NOW()"#,
    )
    .bind(mailbox_id)
    .bind(message_id)
    .bind(remote_attachment_id)
    .bind(remote_message_id)
    .bind(name)
    .bind(error)
    .execute(conn)
    .await?;

    Ok(())
}

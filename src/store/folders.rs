use crate::crawl::discovery::FolderRecord;
use sqlx::PgConnection;

/// Upsert a discovered folder by (mailbox, remote folder id).
///
/// Path, display name, parent and item count are refreshed in place so the
/// mirrored tree stays current even for folders that are never ingested.
pub async fn upsert_folder(
    conn: &mut PgConnection,
    mailbox_id: i64,
    record: &FolderRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO folders (
               mailbox_id, remote_folder_id, parent_remote_folder_id,
               display_name, path, total_item_count
           )
           VALUES ($1, $2, $3, $4, $5, $6)
           ON CONFLICT (mailbox_id, remote_folder_id) DO UPDATE SET
               parent_remote_folder_id = EXCLUDED.parent_remote_folder_id,
               display_name = EXCLUDED.display_name,
               path = EXCLUDED.path,
               total_item_count = EXCLUDED.total_item_count,
               updated_at = NOW()"#,
    )
    .bind(mailbox_id)
    .bind(&record.remote_id)
    .bind(&record.parent_remote_id)
    .bind(&record.display_name)
    .bind(record.path())
    .bind(record.total_item_count)
    .execute(conn)
    .await?;

    Ok(())
}

//! Attachment synchronization: a resumable, strictly sequential scan over
//! messages flagged as having attachments.
//!
//! The scan walks messages in ascending internal-id order from a persisted
//! cursor, in fixed-size batches. Each batch's row changes commit together
//! with the advanced cursor, so a crash redoes at most one batch.

use crate::config::MailboxConfig;
use crate::crawl::paths;
use crate::crawl::progress::{ProgressSink, StageEvent};
use crate::error::SyncError;
use crate::graph::{GraphClient, page_values};
use crate::models::AttachmentPayload;
use crate::store;
use crate::store::checkpoint::AttachmentCursor;
use crate::store::messages::MessageScanRow;
use sqlx::{PgPool, Postgres, Transaction};
use std::path::PathBuf;
use std::sync::Arc;

const ATTACHMENT_STAGE: &str = "download-attachments";

/// Aggregated result of one attachment-sync pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachmentOutcome {
    /// Attachment files fetched and stored.
    pub processed: i64,
    pub errors: i64,
    /// Messages skipped because they no longer resolve remotely.
    pub skipped: i64,
    /// Messages scanned this run.
    pub scanned: i64,
}

/// Per-mailbox attachment synchronization engine.
pub struct AttachmentEngine {
    client: Arc<GraphClient>,
    pool: PgPool,
    mailbox: MailboxConfig,
    mailbox_id: i64,
    run_id: i64,
    output_root: PathBuf,
    batch_size: i64,
    limit: Option<i64>,
    sink: Arc<dyn ProgressSink>,
}

impl AttachmentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<GraphClient>,
        pool: PgPool,
        mailbox: MailboxConfig,
        mailbox_id: i64,
        run_id: i64,
        output_root: PathBuf,
        batch_size: i64,
        limit: Option<i64>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        AttachmentEngine {
            client,
            pool,
            mailbox,
            mailbox_id,
            run_id,
            output_root,
            batch_size: batch_size.max(1),
            limit,
            sink,
        }
    }

    /// Resume the scan from the persisted cursor and run it to exhaustion
    /// (or until the optional processed-files limit).
    pub async fn run(&self) -> Result<AttachmentOutcome, SyncError> {
        let checkpoint = store::checkpoint::get_or_create(
            &self.pool,
            self.mailbox_id,
            store::checkpoint::ATTACHMENT_PIPELINE,
        )
        .await?;

        let mut last_message_id = checkpoint.attachment_cursor().last_message_id;
        let total_targets =
            store::messages::count_attachment_targets(&self.pool, self.mailbox_id).await?;

        self.sink.emit(StageEvent::AttachmentsStarted {
            mailbox_key: self.mailbox.key.clone(),
            total_messages: total_targets,
            resume_after_message_id: last_message_id,
        });

        let mut outcome = AttachmentOutcome::default();

        loop {
            if let Some(limit) = self.limit {
                if outcome.processed >= limit {
                    break;
                }
            }
            let mut chunk = self.batch_size;
            if let Some(limit) = self.limit {
                chunk = chunk.min((limit - outcome.processed).max(1));
            }

            let batch = store::messages::fetch_attachment_batch(
                &self.pool,
                self.mailbox_id,
                last_message_id,
                chunk,
            )
            .await?;
            if batch.is_empty() {
                break;
            }

            let mut tx = self.pool.begin().await?;
            for message in &batch {
                last_message_id = message.id;
                outcome.scanned += 1;

                match self.sync_message(&mut tx, message, &mut outcome).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {
                        // Message moved or deleted remotely; a skip, not an
                        // error.
                        outcome.skipped += 1;
                    }
                    Err(SyncError::Database(db_err)) => {
                        // A failed statement poisons the batch transaction;
                        // there is no item boundary to contain it.
                        return Err(SyncError::Database(db_err));
                    }
                    Err(err) => {
                        outcome.errors += 1;
                        let payload =
                            serde_json::json!({ "message_id": &message.remote_message_id });
                        let error_text = err.to_string();
                        log::warn!(
                            "attachments for message {} failed: {}",
                            message.remote_message_id,
                            error_text
                        );
                        store::runs::record_pipeline_error(
                            &mut *tx,
                            Some(self.run_id),
                            Some(self.mailbox_id),
                            Some(&message.remote_message_id),
                            ATTACHMENT_STAGE,
                            &error_text,
                            Some(&payload),
                        )
                        .await?;
                        store::dead_letter::record(
                            &mut *tx,
                            Some(self.mailbox_id),
                            ATTACHMENT_STAGE,
                            Some(&payload),
                            &error_text,
                        )
                        .await?;
                    }
                }

                self.sink.emit(StageEvent::AttachmentsProgress {
                    mailbox_key: self.mailbox.key.clone(),
                    processed_files: outcome.processed,
                    errors: outcome.errors,
                    skipped: outcome.skipped,
                    scanned_messages: outcome.scanned,
                });
            }

            let cursor = AttachmentCursor {
                last_message_id,
                scanned_messages: outcome.scanned,
            };
            store::checkpoint::save_cursor(&mut *tx, checkpoint.id, &cursor).await?;
            tx.commit().await?;
        }

        self.sink.emit(StageEvent::AttachmentsComplete {
            mailbox_key: self.mailbox.key.clone(),
            processed_files: outcome.processed,
            errors: outcome.errors,
            skipped: outcome.skipped,
            scanned_messages: outcome.scanned,
        });

        Ok(outcome)
    }

    /// Fetch one message's attachment list and store every inline payload.
    ///
    /// Items without an inline payload (linked or oversized attachments)
    /// are passed over silently. The first failing attachment marks its row
    /// as failed and aborts the message; files stored before it stay
    /// counted.
    async fn sync_message(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &MessageScanRow,
        outcome: &mut AttachmentOutcome,
    ) -> Result<(), SyncError> {
        let path = format!(
            "/users/{}/messages/{}/attachments",
            self.mailbox.user_id, message.remote_message_id
        );
        let listing = self.client.get_json(&path, &[]).await?;

        let dir = paths::message_dir(
            &self.output_root,
            &self.mailbox.key,
            message.id,
            &message.remote_message_id,
        );
        tokio::fs::create_dir_all(&dir).await?;

        for item in page_values(&listing) {
            let payload: AttachmentPayload = match serde_json::from_value(item.clone()) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            let Some(remote_attachment_id) = payload.id.clone() else {
                continue;
            };
            let Some(content) = payload.content_bytes.as_deref() else {
                continue;
            };
            if content.is_empty() {
                continue;
            }

            let file_name =
                paths::attachment_filename(payload.name.as_deref(), &remote_attachment_id);
            let file_path = dir.join(&file_name);

            match self
                .store_attachment(
                    tx,
                    message,
                    &payload,
                    &remote_attachment_id,
                    content,
                    &file_path,
                )
                .await
            {
                Ok(()) => outcome.processed += 1,
                Err(SyncError::Database(db_err)) => return Err(SyncError::Database(db_err)),
                Err(err) => {
                    store::attachments::mark_attachment_failure(
                        &mut **tx,
                        self.mailbox_id,
                        message.id,
                        &message.remote_message_id,
                        &remote_attachment_id,
                        payload.name.as_deref(),
                        &err.to_string(),
                    )
                    .await?;
                    return Err(SyncError::Item(format!(
                        "attachment {} failed: {}",
                        remote_attachment_id, err
                    )));
                }
            }
        }

        Ok(())
    }

    async fn store_attachment(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &MessageScanRow,
        payload: &AttachmentPayload,
        remote_attachment_id: &str,
        content: &str,
        file_path: &std::path::Path,
    ) -> Result<(), SyncError> {
        let bytes = paths::decode_content_bytes(content)
            .map_err(|e| SyncError::Item(format!("invalid inline payload: {}", e)))?;
        tokio::fs::write(file_path, &bytes).await?;

        store::attachments::upsert_attachment_success(
            &mut **tx,
            self.mailbox_id,
            message.id,
            &message.remote_message_id,
            payload,
            remote_attachment_id,
            &file_path.to_string_lossy(),
        )
        .await?;

        Ok(())
    }
}

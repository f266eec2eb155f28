//! Message ingestion: bring persisted message rows up to date with the
//! remote mailbox, incrementally and with bounded concurrency.

use crate::config::MailboxConfig;
use crate::crawl::discovery::{self, FolderRecord, Traversal};
use crate::crawl::progress::{ProgressSink, StageEvent};
use crate::error::SyncError;
use crate::graph::{GraphClient, page_values};
use crate::models::MessagePayload;
use crate::store;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Projection requested from the message listing endpoint.
const SELECT_FIELDS: &str =
    "id,from,subject,receivedDateTime,bodyPreview,hasAttachments,conversationId,parentFolderId";
const PAGE_SIZE: &str = "50";

const MESSAGE_STAGE: &str = "ingest-message";
const FOLDER_STAGE: &str = "ingest-folder";

/// Aggregated result of one ingest pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOutcome {
    /// Newly inserted messages; refreshed rows do not count.
    pub processed: i64,
    pub errors: i64,
    /// Maximum received timestamp observed (the next watermark).
    pub max_received_at: Option<DateTime<Utc>>,
}

/// Per-mailbox message ingestion engine.
pub struct IngestEngine {
    client: Arc<GraphClient>,
    pool: PgPool,
    mailbox: MailboxConfig,
    mailbox_id: i64,
    run_id: i64,
    max_concurrency: usize,
    hard_limit: Option<i64>,
    page_pause: Duration,
    sink: Arc<dyn ProgressSink>,
}

impl IngestEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<GraphClient>,
        pool: PgPool,
        mailbox: MailboxConfig,
        mailbox_id: i64,
        run_id: i64,
        max_concurrency: usize,
        hard_limit: Option<i64>,
        page_pause: Duration,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        IngestEngine {
            client,
            pool,
            mailbox,
            mailbox_id,
            run_id,
            max_concurrency: max_concurrency.max(1),
            hard_limit,
            page_pause,
            sink,
        }
    }

    /// Discover folders, pull messages for every target folder, and advance
    /// the mailbox watermark.
    ///
    /// Folder pulls run concurrently under a semaphore; each task owns an
    /// isolated transaction committed at folder completion, and outcomes
    /// are merged sequentially as tasks finish.
    pub async fn run(&self) -> Result<IngestOutcome, SyncError> {
        let checkpoint = store::checkpoint::get_or_create(
            &self.pool,
            self.mailbox_id,
            store::checkpoint::INGEST_PIPELINE,
        )
        .await?;

        self.sink.emit(StageEvent::DiscoveryStarted {
            mailbox_key: self.mailbox.key.clone(),
        });

        let traversal = Traversal::from_config(&self.mailbox)?;
        let folders = traversal.discover(&self.client, &self.mailbox).await?;

        // The full tree stays mirrored even when only a subset is ingested.
        let mut tx = self.pool.begin().await?;
        for folder in &folders {
            store::folders::upsert_folder(&mut *tx, self.mailbox_id, folder).await?;
        }
        tx.commit().await?;

        let targets: Vec<FolderRecord> = folders
            .iter()
            .filter(|folder| {
                discovery::path_matches(
                    &folder.path_parts,
                    &self.mailbox.include_filters,
                    &self.mailbox.exclude_filters,
                )
            })
            .cloned()
            .collect();

        self.sink.emit(StageEvent::DiscoveryComplete {
            mailbox_key: self.mailbox.key.clone(),
            total_folders: folders.len(),
            target_folders: targets.len(),
        });

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();
        for folder in targets.iter().cloned() {
            let task = FolderTask {
                client: Arc::clone(&self.client),
                pool: self.pool.clone(),
                user_id: self.mailbox.user_id.clone(),
                mailbox_id: self.mailbox_id,
                run_id: self.run_id,
                folder,
                watermark: checkpoint.last_synced_at,
                hard_limit: self.hard_limit,
                page_pause: self.page_pause,
            };
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                task.run().await
            });
        }

        let mut totals = IngestOutcome::default();
        let mut completed = 0usize;

        while let Some(joined) = join_set.join_next().await {
            let FolderTaskResult {
                folder_path,
                result,
            } = match joined {
                Ok(result) => result,
                Err(join_err) => FolderTaskResult {
                    folder_path: "(unknown)".to_string(),
                    result: Err(SyncError::Item(format!(
                        "folder task aborted: {}",
                        join_err
                    ))),
                },
            };
            completed += 1;

            match result {
                Ok(outcome) => {
                    totals.processed += outcome.processed;
                    totals.errors += outcome.errors;
                    totals.max_received_at =
                        max_timestamp(totals.max_received_at, outcome.max_received_at);
                }
                Err(err) => {
                    // A failed folder pull costs only that folder; the
                    // remaining folder tasks keep running.
                    log::error!("folder '{}' pull failed: {}", folder_path, err);
                    totals.errors += 1;
                    let payload = serde_json::json!({ "folder_path": &folder_path });
                    let mut conn = self.pool.acquire().await?;
                    store::runs::record_pipeline_error(
                        &mut *conn,
                        Some(self.run_id),
                        Some(self.mailbox_id),
                        None,
                        FOLDER_STAGE,
                        &err.to_string(),
                        Some(&payload),
                    )
                    .await?;
                    store::dead_letter::record(
                        &mut *conn,
                        Some(self.mailbox_id),
                        FOLDER_STAGE,
                        Some(&payload),
                        &err.to_string(),
                    )
                    .await?;
                }
            }

            self.sink.emit(StageEvent::FolderIngested {
                mailbox_key: self.mailbox.key.clone(),
                completed_folders: completed,
                target_folders: targets.len(),
                processed_messages: totals.processed,
                errors: totals.errors,
                folder_path,
            });
        }

        if let Some(latest) = totals.max_received_at {
            store::checkpoint::advance_watermark(&self.pool, checkpoint.id, latest, self.run_id)
                .await?;
        } else {
            store::checkpoint::record_run(&self.pool, checkpoint.id, self.run_id).await?;
        }

        self.sink.emit(StageEvent::IngestComplete {
            mailbox_key: self.mailbox.key.clone(),
            target_folders: targets.len(),
            processed_messages: totals.processed,
            errors: totals.errors,
        });

        Ok(totals)
    }
}

struct FolderTask {
    client: Arc<GraphClient>,
    pool: PgPool,
    user_id: String,
    mailbox_id: i64,
    run_id: i64,
    folder: FolderRecord,
    watermark: Option<DateTime<Utc>>,
    hard_limit: Option<i64>,
    page_pause: Duration,
}

struct FolderTaskResult {
    folder_path: String,
    result: Result<IngestOutcome, SyncError>,
}

impl FolderTask {
    async fn run(self) -> FolderTaskResult {
        let folder_path = self.folder.path();
        let result = self.pull_messages().await;
        FolderTaskResult {
            folder_path,
            result,
        }
    }

    /// Pull one folder's messages, newest first, bounded by the watermark
    /// and the optional hard cap on newly-processed messages.
    ///
    /// All writes happen on this task's own transaction, committed once the
    /// folder completes (or the cap triggers).
    async fn pull_messages(&self) -> Result<IngestOutcome, SyncError> {
        let mut params: Vec<(String, String)> = vec![
            ("$select".to_string(), SELECT_FIELDS.to_string()),
            ("$top".to_string(), PAGE_SIZE.to_string()),
            ("$orderby".to_string(), "receivedDateTime desc".to_string()),
        ];
        if let Some(watermark) = self.watermark {
            params.push((
                "$filter".to_string(),
                format!(
                    "receivedDateTime ge {}",
                    watermark.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            ));
        }

        let path = format!(
            "/users/{}/mailFolders/{}/messages",
            self.user_id, self.folder.remote_id
        );

        let mut outcome = IngestOutcome {
            processed: 0,
            errors: 0,
            max_received_at: self.watermark,
        };

        let mut tx = self.pool.begin().await?;
        let mut pager = self.client.paged(&path, &params);

        while let Some(page) = pager.next_page().await? {
            for item in page_values(&page) {
                match MessagePayload::from_value(item) {
                    Ok(payload) => {
                        let inserted = store::messages::upsert_message(
                            &mut *tx,
                            self.mailbox_id,
                            &payload,
                            item,
                        )
                        .await?;
                        if inserted {
                            outcome.processed += 1;
                        }
                        outcome.max_received_at =
                            max_timestamp(outcome.max_received_at, payload.received_at());
                    }
                    Err(parse_err) => {
                        // Malformed payload: contained at the item boundary,
                        // the folder pull keeps going.
                        outcome.errors += 1;
                        let remote_id = item.get("id").and_then(Value::as_str);
                        let error_text = format!("malformed message payload: {}", parse_err);
                        log::warn!(
                            "folder '{}': {}",
                            self.folder.path(),
                            error_text
                        );
                        store::runs::record_pipeline_error(
                            &mut *tx,
                            Some(self.run_id),
                            Some(self.mailbox_id),
                            remote_id,
                            MESSAGE_STAGE,
                            &error_text,
                            Some(item),
                        )
                        .await?;
                        store::dead_letter::record(
                            &mut *tx,
                            Some(self.mailbox_id),
                            MESSAGE_STAGE,
                            Some(item),
                            &error_text,
                        )
                        .await?;
                    }
                }

                if let Some(limit) = self.hard_limit {
                    if outcome.processed >= limit {
                        tx.commit().await?;
                        return Ok(outcome);
                    }
                }
            }

            tokio::time::sleep(self.page_pause).await;
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

fn max_timestamp(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (value, None) | (None, value) => value,
    }
}

//! Operation entry points, one per pipeline invocation.
//!
//! A front end (scheduler, admin surface, CLI shell) calls these with an
//! explicit pool and settings value; nothing here reaches for globals.
//! Each operation bootstraps mailbox rows, runs the pipeline per enabled
//! mailbox with its own run record, and contains per-mailbox failures so
//! one broken mailbox never stops the others.

use crate::config::{ConfigError, MailboxConfig, Settings};
use crate::crawl::attachments::AttachmentEngine;
use crate::crawl::ingest::IngestEngine;
use crate::crawl::progress::ProgressSink;
use crate::error::SyncError;
use crate::graph::GraphClient;
use crate::store;
use crate::store::checkpoint::{ATTACHMENT_PIPELINE, INGEST_PIPELINE};
use crate::store::mailboxes::MailboxRow;
use crate::store::runs::RunStatus;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

/// Bootstrap mailbox rows and select the enabled targets, optionally
/// narrowed to one mailbox key.
async fn select_mailboxes(
    pool: &PgPool,
    settings: &Settings,
    mailbox_key: Option<&str>,
) -> Result<(Vec<MailboxConfig>, HashMap<String, MailboxRow>), SyncError> {
    let configs = settings.mailbox_configs()?;
    let rows = store::mailboxes::bootstrap_mailboxes(pool, &configs).await?;

    let selected: Vec<MailboxConfig> = configs
        .into_iter()
        .filter(|config| config.enabled && mailbox_key.is_none_or(|key| config.key == key))
        .collect();

    if mailbox_key.is_some() && selected.is_empty() {
        return Err(SyncError::Config(ConfigError(format!(
            "mailbox key not found or disabled: {}",
            mailbox_key.unwrap_or_default()
        ))));
    }

    Ok((selected, rows))
}

/// Record a run-level failure: one pipeline error and one dead letter at
/// the mailbox stage, and the run marked failed.
async fn record_run_failure(
    pool: &PgPool,
    run_id: i64,
    mailbox_id: i64,
    stage: &str,
    mailbox_key: &str,
    error: &SyncError,
) -> Result<(), SyncError> {
    let payload = serde_json::json!({ "mailbox_key": mailbox_key });
    let error_text = error.to_string();

    let mut conn = pool.acquire().await?;
    store::runs::record_pipeline_error(
        &mut *conn,
        Some(run_id),
        Some(mailbox_id),
        None,
        stage,
        &error_text,
        Some(&payload),
    )
    .await?;
    store::dead_letter::record(
        &mut *conn,
        Some(mailbox_id),
        stage,
        Some(&payload),
        &error_text,
    )
    .await?;
    store::runs::finish_run(pool, run_id, RunStatus::Failed, 0, 1).await?;

    Ok(())
}

/// Run message ingestion for every enabled mailbox.
///
/// # Returns
/// Total newly processed messages across mailboxes.
pub async fn run_ingest(
    pool: &PgPool,
    settings: &Settings,
    limit: Option<i64>,
    mailbox_key: Option<&str>,
    sink: Arc<dyn ProgressSink>,
) -> Result<i64, SyncError> {
    let (selected, rows) = select_mailboxes(pool, settings, mailbox_key).await?;
    let client = Arc::new(GraphClient::new(settings)?);

    let mut total_processed = 0;
    for mailbox in selected {
        let row = &rows[&mailbox.key];
        let run_id = store::runs::start_run(pool, INGEST_PIPELINE, Some(row.id)).await?;
        log::info!("run {}: ingest starting for mailbox '{}'", run_id, mailbox.key);

        let engine = IngestEngine::new(
            Arc::clone(&client),
            pool.clone(),
            mailbox.clone(),
            row.id,
            run_id,
            settings.max_concurrency,
            limit,
            settings.page_pause,
            Arc::clone(&sink),
        );

        match engine.run().await {
            Ok(outcome) => {
                store::runs::finish_run(
                    pool,
                    run_id,
                    RunStatus::from_counts(outcome.errors),
                    outcome.processed,
                    outcome.errors,
                )
                .await?;
                total_processed += outcome.processed;
                log::info!(
                    "run {}: ingest complete, new_msgs={} errors={}",
                    run_id,
                    outcome.processed,
                    outcome.errors
                );
            }
            Err(err) => {
                log::error!("run {}: ingest failed for '{}': {}", run_id, mailbox.key, err);
                record_run_failure(pool, run_id, row.id, "ingest-mailbox", &mailbox.key, &err)
                    .await?;
            }
        }
    }

    Ok(total_processed)
}

/// Run attachment synchronization for every enabled mailbox.
///
/// # Returns
/// Total attachment files stored across mailboxes.
pub async fn run_download_attachments(
    pool: &PgPool,
    settings: &Settings,
    limit: Option<i64>,
    mailbox_key: Option<&str>,
    batch_size: Option<i64>,
    sink: Arc<dyn ProgressSink>,
) -> Result<i64, SyncError> {
    let (selected, rows) = select_mailboxes(pool, settings, mailbox_key).await?;
    let client = Arc::new(GraphClient::new(settings)?);
    let effective_batch_size = batch_size.unwrap_or(settings.attachment_batch_size).max(1);

    let mut total_processed = 0;
    for mailbox in selected {
        let row = &rows[&mailbox.key];
        let run_id = store::runs::start_run(pool, ATTACHMENT_PIPELINE, Some(row.id)).await?;
        log::info!(
            "run {}: attachment sync starting for mailbox '{}'",
            run_id,
            mailbox.key
        );

        let engine = AttachmentEngine::new(
            Arc::clone(&client),
            pool.clone(),
            mailbox.clone(),
            row.id,
            run_id,
            settings.output_root.clone(),
            effective_batch_size,
            limit,
            Arc::clone(&sink),
        );

        match engine.run().await {
            Ok(outcome) => {
                store::runs::finish_run(
                    pool,
                    run_id,
                    RunStatus::from_counts(outcome.errors),
                    outcome.processed,
                    outcome.errors,
                )
                .await?;
                store::runs::set_run_metadata(
                    pool,
                    run_id,
                    &serde_json::json!({
                        "skipped_messages": outcome.skipped,
                        "batch_size": effective_batch_size,
                    }),
                )
                .await?;
                total_processed += outcome.processed;
            }
            Err(err) => {
                log::error!(
                    "run {}: attachment sync failed for '{}': {}",
                    run_id,
                    mailbox.key,
                    err
                );
                record_run_failure(
                    pool,
                    run_id,
                    row.id,
                    "download-attachments-mailbox",
                    &mailbox.key,
                    &err,
                )
                .await?;
            }
        }
    }

    Ok(total_processed)
}

/// Acknowledge unresolved dead letters (optionally one stage, oldest
/// first, bounded). This closes the entries; it does not re-run the work.
pub async fn run_replay_dead_letters(
    pool: &PgPool,
    stage: Option<&str>,
    limit: i64,
) -> Result<u64, SyncError> {
    let acknowledged = store::dead_letter::replay(pool, stage, limit).await?;
    log::info!("acknowledged {} dead letters", acknowledged);
    Ok(acknowledged)
}

/// Rolling failure rates per pipeline plus open dead-letter count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliabilityReport {
    pub ingest_failure_rate: f64,
    pub attachment_failure_rate: f64,
    pub open_dead_letters: i64,
}

pub async fn run_reliability_report(
    pool: &PgPool,
    window: i64,
) -> Result<ReliabilityReport, SyncError> {
    let ingest_failure_rate =
        store::runs::rolling_failure_rate(pool, INGEST_PIPELINE, window).await?;
    let attachment_failure_rate =
        store::runs::rolling_failure_rate(pool, ATTACHMENT_PIPELINE, window).await?;
    let open_dead_letters = store::dead_letter::open_count(pool).await?;

    Ok(ReliabilityReport {
        ingest_failure_rate,
        attachment_failure_rate,
        open_dead_letters,
    })
}

/// Row counts a human checks first when something looks off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditReport {
    pub mailboxes: i64,
    pub open_dead_letters: i64,
    pub pipeline_errors: i64,
}

pub async fn run_audit(pool: &PgPool) -> Result<AuditReport, SyncError> {
    let mailboxes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mailboxes")
        .fetch_one(pool)
        .await?;
    let open_dead_letters = store::dead_letter::open_count(pool).await?;
    let pipeline_errors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pipeline_errors")
        .fetch_one(pool)
        .await?;

    Ok(AuditReport {
        mailboxes,
        open_dead_letters,
        pipeline_errors,
    })
}

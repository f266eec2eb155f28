//! Progress reporting for pipeline consumers.
//!
//! Engines emit a closed set of stage events through a [`ProgressSink`];
//! front ends decide what to do with them. [`LogSink`] mirrors each event
//! to the log, [`NullSink`] discards them.

/// One structured progress event per pipeline stage.
#[derive(Debug, Clone)]
pub enum StageEvent {
    DiscoveryStarted {
        mailbox_key: String,
    },
    DiscoveryComplete {
        mailbox_key: String,
        total_folders: usize,
        target_folders: usize,
    },
    FolderIngested {
        mailbox_key: String,
        completed_folders: usize,
        target_folders: usize,
        processed_messages: i64,
        errors: i64,
        folder_path: String,
    },
    IngestComplete {
        mailbox_key: String,
        target_folders: usize,
        processed_messages: i64,
        errors: i64,
    },
    AttachmentsStarted {
        mailbox_key: String,
        total_messages: i64,
        resume_after_message_id: i64,
    },
    AttachmentsProgress {
        mailbox_key: String,
        processed_files: i64,
        errors: i64,
        skipped: i64,
        scanned_messages: i64,
    },
    AttachmentsComplete {
        mailbox_key: String,
        processed_files: i64,
        errors: i64,
        skipped: i64,
        scanned_messages: i64,
    },
}

/// Receiver for stage events. Implementations must be cheap; engines emit
/// from hot loops.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: StageEvent);
}

/// Discards all events.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: StageEvent) {}
}

/// Writes one log line per event.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, event: StageEvent) {
        match event {
            StageEvent::DiscoveryStarted { mailbox_key } => {
                log::info!("{}: discovering folders", mailbox_key);
            }
            StageEvent::DiscoveryComplete {
                mailbox_key,
                total_folders,
                target_folders,
            } => {
                log::info!(
                    "{}: folders discovered, total={} targeted={}",
                    mailbox_key,
                    total_folders,
                    target_folders
                );
            }
            StageEvent::FolderIngested {
                mailbox_key,
                completed_folders,
                target_folders,
                processed_messages,
                errors,
                folder_path,
            } => {
                log::info!(
                    "{}: ingested '{}' ({}/{}), new_msgs={} errors={}",
                    mailbox_key,
                    folder_path,
                    completed_folders,
                    target_folders,
                    processed_messages,
                    errors
                );
            }
            StageEvent::IngestComplete {
                mailbox_key,
                target_folders,
                processed_messages,
                errors,
            } => {
                log::info!(
                    "{}: ingest complete, folders={} new_msgs={} errors={}",
                    mailbox_key,
                    target_folders,
                    processed_messages,
                    errors
                );
            }
            StageEvent::AttachmentsStarted {
                mailbox_key,
                total_messages,
                resume_after_message_id,
            } => {
                log::info!(
                    "{}: attachment scan starting, targets={} resume_after={}",
                    mailbox_key,
                    total_messages,
                    resume_after_message_id
                );
            }
            StageEvent::AttachmentsProgress {
                mailbox_key,
                processed_files,
                errors,
                skipped,
                scanned_messages,
            } => {
                log::debug!(
                    "{}: attachments files={} errors={} skipped={} scanned={}",
                    mailbox_key,
                    processed_files,
                    errors,
                    skipped,
                    scanned_messages
                );
            }
            StageEvent::AttachmentsComplete {
                mailbox_key,
                processed_files,
                errors,
                skipped,
                scanned_messages,
            } => {
                log::info!(
                    "{}: attachment scan complete, files={} errors={} skipped={} scanned={}",
                    mailbox_key,
                    processed_files,
                    errors,
                    skipped,
                    scanned_messages
                );
            }
        }
    }
}

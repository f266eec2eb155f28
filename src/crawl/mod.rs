//! Mailbox crawling pipelines.
//!
//! Two pipelines share this module, both driven per mailbox and both
//! checkpointed so an interrupted invocation resumes instead of redoing
//! work:
//!
//! - **`ingest`**: brings persisted message rows up to date with the remote
//!   mailbox. Folder discovery materializes the folder tree (`discovery`),
//!   the include/exclude filters select ingestion targets, and folder pulls
//!   run concurrently under a semaphore. Each folder task owns an isolated
//!   transaction committed at folder completion; outcomes are merged
//!   sequentially as tasks finish, and the mailbox checkpoint's watermark
//!   advances to the maximum received timestamp observed (never backwards).
//!
//! - **`attachments`**: a strictly sequential, batched scan over messages
//!   flagged as having attachments, resuming from a persisted cursor.
//!   Attachment files land under a deterministic, filesystem-safe path
//!   (`paths`), and each batch commits its row changes together with the
//!   advanced cursor, bounding crash re-work to one batch.
//!
//! Item-level failures never abort the enclosing folder or batch: they are
//! counted, logged as pipeline errors, and recorded as dead letters, and
//! the loop moves on. Progress is reported through the [`progress`] sink
//! as a closed set of stage events.

pub mod attachments;
pub mod discovery;
pub mod ingest;
pub mod paths;
pub mod progress;

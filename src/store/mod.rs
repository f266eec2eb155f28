//! Persistence layer: upserts, checkpoints, run bookkeeping, dead letters.
//!
//! Everything here speaks plain sqlx against PostgreSQL. Write paths used
//! inside engine transactions take `&mut PgConnection` so callers decide
//! the transaction boundary; read paths and run bookkeeping work off the
//! pool directly.

pub mod attachments;
pub mod checkpoint;
pub mod dead_letter;
pub mod folders;
pub mod mailboxes;
pub mod messages;
pub mod migration;
pub mod runs;

pub use migration::run_migrations;

//! Durable record of failed work items.
//!
//! Dead letters are written whenever an item-level failure is contained,
//! and closed explicitly by replay. Replay is an acknowledgement: it
//! increments the attempt counter and stamps the entry resolved, it does
//! not re-execute the failed work.

use serde_json::Value;
use sqlx::{PgConnection, PgPool};

/// Record a dead letter for a failed work item.
pub async fn record(
    conn: &mut PgConnection,
    mailbox_id: Option<i64>,
    stage: &str,
    payload: Option<&Value>,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO dead_letters (mailbox_id, stage, payload, error_message)
           VALUES ($1, $2, $3, $4)"#,
    )
    .bind(mailbox_id)
    .bind(stage)
    .bind(payload)
    .bind(error)
    .execute(conn)
    .await?;

    Ok(())
}

/// Acknowledge unresolved dead letters, oldest first.
///
/// Optionally filtered by stage, bounded by `limit`. Each selected entry
/// gets its attempt counter incremented and its last-seen/resolved
/// timestamps stamped.
///
/// # Returns
/// Number of entries acknowledged.
pub async fn replay(
    pool: &PgPool,
    stage: Option<&str>,
    limit: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"UPDATE dead_letters SET
               attempts = attempts + 1,
               last_seen_at = NOW(),
               resolved_at = NOW()
           WHERE id IN (
               SELECT id FROM dead_letters
               WHERE resolved_at IS NULL
                 AND ($1::text IS NULL OR stage = $1)
               ORDER BY id ASC
               LIMIT $2
           )"#,
    )
    .bind(stage)
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Count of unresolved dead letters.
pub async fn open_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE resolved_at IS NULL")
        .fetch_one(pool)
        .await
}

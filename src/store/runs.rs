use serde_json::Value;
use sqlx::{PgConnection, PgPool};

/// Terminal state of a pipeline run. Runs start as `running` and move to
/// exactly one of these; there are no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Failed => "failed",
        }
    }

    /// Success when nothing failed, partial success otherwise.
    pub fn from_counts(errors: i64) -> Self {
        if errors == 0 {
            RunStatus::Success
        } else {
            RunStatus::PartialSuccess
        }
    }
}

/// Insert a new run in the `running` state.
///
/// # Returns
/// The run id, referenced by pipeline errors and checkpoints.
pub async fn start_run(
    pool: &PgPool,
    pipeline_name: &str,
    mailbox_id: Option<i64>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"INSERT INTO pipeline_runs (pipeline_name, mailbox_id, status)
           VALUES ($1, $2, 'running')
           RETURNING id"#,
    )
    .bind(pipeline_name)
    .bind(mailbox_id)
    .fetch_one(pool)
    .await
}

/// Move a run to its terminal state with final counts.
pub async fn finish_run(
    pool: &PgPool,
    run_id: i64,
    status: RunStatus,
    processed_count: i64,
    error_count: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"UPDATE pipeline_runs SET
               status = $2,
               processed_count = $3,
               error_count = $4,
               ended_at = NOW()
           WHERE id = $1"#,
    )
    .bind(run_id)
    .bind(status.as_str())
    .bind(processed_count)
    .bind(error_count)
    .execute(pool)
    .await?;

    Ok(())
}

/// Attach free-form metadata to a run (e.g. skipped counts, batch size).
pub async fn set_run_metadata(
    pool: &PgPool,
    run_id: i64,
    metadata: &Value,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE pipeline_runs SET metadata = $2 WHERE id = $1")
        .bind(run_id)
        .bind(metadata)
        .execute(pool)
        .await?;

    Ok(())
}

/// Log a pipeline error for a contained item-level failure.
pub async fn record_pipeline_error(
    conn: &mut PgConnection,
    run_id: Option<i64>,
    mailbox_id: Option<i64>,
    remote_message_id: Option<&str>,
    stage: &str,
    error: &str,
    payload: Option<&Value>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO pipeline_errors (
               run_id, mailbox_id, remote_message_id, stage, error_message, payload
           )
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(run_id)
    .bind(mailbox_id)
    .bind(remote_message_id)
    .bind(stage)
    .bind(error)
    .bind(payload)
    .execute(conn)
    .await?;

    Ok(())
}

/// Share of non-success runs among the most recent `limit` runs of a
/// pipeline. Returns 0.0 when the pipeline has never run.
pub async fn rolling_failure_rate(
    pool: &PgPool,
    pipeline_name: &str,
    limit: i64,
) -> Result<f64, sqlx::Error> {
    let statuses: Vec<(String,)> = sqlx::query_as(
        r#"SELECT status FROM pipeline_runs
           WHERE pipeline_name = $1
           ORDER BY id DESC
           LIMIT $2"#,
    )
    .bind(pipeline_name)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    if statuses.is_empty() {
        return Ok(0.0);
    }

    let failed = statuses
        .iter()
        .filter(|(status,)| status != "success")
        .count();
    Ok(failed as f64 / statuses.len() as f64)
}

use crate::config::MailboxConfig;
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;

/// Persisted mailbox identity, keyed by the configuration key.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MailboxRow {
    pub id: i64,
    pub mailbox_key: String,
    pub user_id: String,
}

/// Upsert mailbox rows from configuration.
///
/// Configuration is the source of truth: existing rows are refreshed in
/// place, new mailboxes are inserted.
///
/// # Returns
/// Map from mailbox key to its persisted row.
pub async fn bootstrap_mailboxes(
    pool: &PgPool,
    configs: &[MailboxConfig],
) -> Result<HashMap<String, MailboxRow>, sqlx::Error> {
    let mut rows = HashMap::with_capacity(configs.len());

    for config in configs {
        let row: MailboxRow = sqlx::query_as(
            r#"INSERT INTO mailboxes (
                   mailbox_key, user_id, root_folder_id,
                   include_filters, exclude_filters, location_filters,
                   traversal_mode, job_folder_pattern, max_folder_depth, is_active
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (mailbox_key) DO UPDATE SET
                   user_id = EXCLUDED.user_id,
                   root_folder_id = EXCLUDED.root_folder_id,
                   include_filters = EXCLUDED.include_filters,
                   exclude_filters = EXCLUDED.exclude_filters,
                   location_filters = EXCLUDED.location_filters,
                   traversal_mode = EXCLUDED.traversal_mode,
                   job_folder_pattern = EXCLUDED.job_folder_pattern,
                   max_folder_depth = EXCLUDED.max_folder_depth,
                   is_active = EXCLUDED.is_active,
                   updated_at = NOW()
               RETURNING id, mailbox_key, user_id"#,
        )
        .bind(&config.key)
        .bind(&config.user_id)
        .bind(&config.root_folder_id)
        .bind(json!(config.include_filters))
        .bind(json!(config.exclude_filters))
        .bind(json!(config.location_filters))
        .bind(config.traversal_mode.as_str())
        .bind(&config.job_folder_pattern)
        .bind(config.max_folder_depth.map(|depth| depth as i32))
        .bind(config.enabled)
        .fetch_one(pool)
        .await?;

        rows.insert(config.key.clone(), row);
    }

    Ok(rows)
}

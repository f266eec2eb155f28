//! Database migration management.
//!
//! Migrations are validated and applied before any pipeline touches the
//! store; drift aborts the invocation instead of running against an
//! unexpected schema.

use sqlx::{PgPool, migrate::Migrator};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Run database migrations.
///
/// Idempotent: already-applied migrations are skipped. Uses sqlx's built-in
/// migration tracking.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("checking database migration state");
    MIGRATOR.run(pool).await?;
    log::info!("database migrations up to date");
    Ok(())
}

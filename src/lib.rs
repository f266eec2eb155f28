//! Mailbox crawling and attachment synchronization pipeline.
//!
//! This crate incrementally pulls folders, messages, and file attachments
//! from a remote paginated mail API into PostgreSQL, surviving partial
//! failures, rate limiting, and process restarts.
//!
//! # Architecture Overview
//!
//! - **`graph`**: authenticated, retrying HTTP/JSON gateway with opaque
//!   continuation pagination. All remote access goes through one shared
//!   client instance per invocation.
//!
//! - **`crawl`**: the two engines. `ingest` runs bounded-concurrency
//!   folder pulls with per-task transactions and advances a monotonic
//!   watermark; `attachments` runs a strictly sequential, batched,
//!   cursor-resumable scan that stores attachment files on disk.
//!
//! - **`store`**: sqlx persistence — upserts keyed on remote identifiers,
//!   checkpoint and dead-letter management, run bookkeeping, migrations.
//!
//! - **`operations`**: per-mailbox orchestration entry points called by
//!   whatever front end drives the system.
//!
//! # Data Flow
//!
//! 1. Discovery enumerates the folder tree and mirrors it into `folders`
//! 2. Include/exclude filters select the ingestion targets
//! 3. Folder pulls upsert messages and track the max received timestamp
//! 4. The mailbox checkpoint's watermark advances, never backwards
//! 5. The attachment engine scans flagged messages from its cursor,
//!    storing files and rows batch by batch
//!
//! Item-level failures are contained where they happen and recorded as
//! pipeline errors plus dead letters; only setup failures mark a whole
//! run as failed.

pub mod config;
pub mod crawl;
pub mod error;
pub mod graph;
pub mod models;
pub mod operations;
pub mod store;

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Initialize env_logger once per process; later calls are no-ops.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    //! Disposable-database harness for integration tests.

    pub use database::{TestDatabase, TestDatabaseError};

    pub mod database {
        use sqlx::postgres::PgPoolOptions;
        use sqlx::{PgPool, migrate::Migrator};
        use testcontainers_modules::postgres::Postgres;
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;

        static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database factory for integration tests.
        ///
        /// Launches a disposable Postgres container, connects a pool, and
        /// applies migrations. Dropping the value tears the container down.
        pub struct TestDatabase {
            pool: PgPool,
            _container: ContainerAsync<Postgres>,
        }

        impl TestDatabase {
            /// Provision a fresh, migrated database.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(&url)
                    .await?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool,
                    _container: container,
                })
            }

            /// Cloneable connection pool bound to the disposable database.
            pub fn pool(&self) -> &PgPool {
                &self.pool
            }

            /// Convenience clone of the pooled connection handle.
            pub fn pool_clone(&self) -> PgPool {
                self.pool.clone()
            }

            /// Re-run migrations (idempotent).
            pub async fn reset(&self) -> Result<(), TestDatabaseError> {
                MIGRATOR.run(&self.pool).await?;
                Ok(())
            }
        }
    }
}

use crate::config::ConfigError;
use crate::graph::GraphError;
use thiserror::Error;

/// Errors surfaced by the crawl pipelines.
///
/// Item-level failures are contained inside the engines (recorded as
/// pipeline errors and dead letters); anything propagating as a `SyncError`
/// has escaped a per-item boundary.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GraphError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A contained per-item failure, carried to the recording site.
    #[error("{0}")]
    Item(String),
}

impl SyncError {
    /// True when the error is a remote 404, which the engines treat as a
    /// skip rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Gateway(err) if err.is_not_found())
    }
}

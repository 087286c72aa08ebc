use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("History store is empty")]
    EmptyStore,

    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Market adapter error: {0}")]
    Adapter(String),

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Failures worth another attempt against the same upstream.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::MalformedResponse(_) | Error::Timeout(_) | Error::Http(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Error type for client setup and facade operations.

use campus_core::{RealtimeError, RequestError, StoreError};
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error("Failed to build HTTP client: {0}")]
    HttpSetup(String),

    #[error("Failed to init tracing: {0}")]
    Telemetry(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpSetup(err.to_string())
    }
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

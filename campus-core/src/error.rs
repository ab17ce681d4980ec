//! Error types for Campus data-sync operations

use serde_json::Value;
use thiserror::Error;

/// Errors produced by a single logical HTTP request.
///
/// This is the structured error handed back to UI code once all local
/// recovery (retry, cache fallback) is exhausted. Callers branch on
/// [`RequestError::status`] instead of matching message strings.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    /// No response was received (DNS, connect, reset, timeout).
    #[error("Network failure: {message}")]
    Network { message: String },

    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        details: Option<Value>,
    },

    /// A 2xx body could not be decoded into the expected type.
    #[error("Failed to decode response: {message}")]
    Decode { message: String },

    /// A request body could not be encoded.
    #[error("Failed to encode request: {message}")]
    Serialize { message: String },
}

impl RequestError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            details: None,
        }
    }

    /// HTTP status carried by this error, if the server responded.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(400..=499))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(500..=599))
    }

    /// 401 or 403 from the data platform.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    /// The server is unreachable or failing; cached data may stand in.
    pub fn is_transient(&self) -> bool {
        self.is_network() || self.is_server_error()
    }

    /// Errors that belong to the global error handler rather than to the
    /// calling view: network failures and 5xx.
    pub fn is_reportable(&self) -> bool {
        self.is_transient()
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode {
            message: err.to_string(),
        }
    }
}

/// Errors raised by a key-value backend of the local cache store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Storage quota exceeded: needed {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Storage IO error: {reason}")]
    Io { reason: String },

    #[error("Storage serialization error: {reason}")]
    Serde { reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde {
            reason: err.to_string(),
        }
    }
}

/// Errors raised by a realtime change transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("Realtime connect failed: {reason}")]
    Connect { reason: String },

    #[error("Realtime protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Realtime decode error: {reason}")]
    Decode { reason: String },

    #[error("Realtime channel closed")]
    Closed,
}

/// Filter or key validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown filter field: {field}")]
    UnknownField { field: String },

    #[error("Invalid row filter '{filter}': {reason}")]
    InvalidRowFilter { filter: String, reason: String },
}

/// Result type alias for request operations.
pub type RequestResult<T> = Result<T, RequestError>;

// =============================================================================
// TESTS
// =============================================================================

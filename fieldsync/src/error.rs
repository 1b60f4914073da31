//! Error types for the sync engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sync operation failed: {0}")]
    SyncFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Transient failures are retried on the next trigger instead of surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::HttpStatus { .. })
    }

    /// The server refused the request itself; resending it unchanged will not help.
    /// Auth, timeout and rate-limit statuses are excluded since they clear on their own.
    pub fn is_rejection(&self) -> bool {
        match self {
            SyncError::HttpStatus { status, .. } => {
                (400..500).contains(status) && !matches!(status, 401 | 403 | 408 | 429)
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::InvalidConfig(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Serialization(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> SyncError {
        SyncError::HttpStatus {
            status,
            url: "http://localhost/quotes/mutations".into(),
        }
    }

    #[test]
    fn test_rejection_statuses() {
        assert!(status(400).is_rejection());
        assert!(status(422).is_rejection());
        assert!(status(404).is_rejection());
        assert!(!status(401).is_rejection());
        assert!(!status(429).is_rejection());
        assert!(!status(503).is_rejection());
        assert!(!SyncError::Network("timeout".into()).is_rejection());
    }
}

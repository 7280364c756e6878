//! Error types for metacoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Path Errors ===
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    // === Node Errors ===
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Node {path} payload of {size} bytes exceeds the {limit} byte limit")]
    NodeTooLarge {
        path: String,
        size: usize,
        limit: usize,
    },

    #[error("Version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Corrupted data at {path}: {reason}")]
    Corrupted { path: String, reason: String },

    // === Lock Errors ===
    #[error("Lock {path} is held by '{owner}'")]
    AlreadyLocked { path: String, owner: String },

    // === Connection Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Session closed")]
    SessionClosed,

    // === Backend Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ConnectionFailed(_))
    }

    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupted(path: &str, reason: impl Into<String>) -> Self {
        Error::Corrupted {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("Blocking task failed: {}", e))
    }
}

//! Error types for brd core

use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a download attempt
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid task options: {0}")]
    InvalidOptions(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Response status was: {status}")]
    Protocol { status: u16 },

    #[error("Response ended early: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("Redirect status {status} without a usable Location header")]
    Redirect { status: u16 },

    #[error("Too many redirects (limit {limit})")]
    TooManyRedirects { limit: u32 },

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Rate limiter write failed: {0}")]
    Limiter(#[source] std::io::Error),

    #[error("No free filename for {filename} after {limit} attempts")]
    NameExhausted { filename: String, limit: u32 },

    #[error("Download was cancelled")]
    Cancelled,
}

impl EngineError {
    /// Transport and protocol failures restart the attempt; filesystem
    /// failures and redirect problems are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_) | EngineError::Protocol { .. } | EngineError::Truncated { .. }
        )
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by the worker supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker channel error: {0}")]
    Channel(#[from] std::io::Error),

    #[error("Worker {pid} failed: {reason}")]
    Process { pid: u32, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while loading or saving settings
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No configuration directory available")]
    NoConfigDir,

    #[error("Unknown setting: {0}")]
    UnknownKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(EngineError::Protocol { status: 503 }.is_retryable());
        assert!(EngineError::Truncated {
            expected: 10,
            received: 4
        }
        .is_retryable());
        assert!(!EngineError::Redirect { status: 302 }.is_retryable());
        assert!(!EngineError::TooManyRedirects { limit: 3 }.is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(!EngineError::fs("/tmp/x", io).is_retryable());
    }

    #[test]
    fn test_protocol_error_message() {
        let err = EngineError::Protocol { status: 404 };
        assert_eq!(err.to_string(), "Response status was: 404");
    }
}

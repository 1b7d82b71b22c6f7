//! Error types for the sync engine.

use std::io;

use thiserror::Error;

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during a sync session.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid or missing configuration. Fatal before any network I/O.
    #[error("config error: {0}")]
    Config(String),

    /// Network or transport fault.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried after a reconnect.
        retryable: bool,
    },

    /// Remote scan did not reach the sentinel before the poll timeout.
    #[error("remote scan did not finish within {timeout_secs}s (polled {polls} times)")]
    ScanTimeout {
        /// Poll timeout that was exceeded.
        timeout_secs: u64,
        /// Number of polls performed.
        polls: u32,
    },

    /// Remote command returned a non-zero exit code.
    #[error("remote command exited {code}: {command}\nstderr: {stderr}")]
    Remote {
        /// The command that failed.
        command: String,
        /// Exit code.
        code: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// Local I/O fault.
    #[error("local I/O error: {0}")]
    Local(#[from] io::Error),

    /// State or progress file unreadable.
    #[error("state corruption: {0}")]
    StateCorruption(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if retrying after a reconnect may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::ScanTimeout { .. } => true,
            _ => false,
        }
    }
}

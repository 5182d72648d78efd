//! Error taxonomy for the synchronization pipeline
//!
//! Only [`SyncError::Connection`] (and cancellation or broken configuration)
//! ends a run. Transfer, parse and validation failures are accumulated per
//! file, per row or per record and surfaced in the run summary or the
//! [`ImportResult`](crate::commit::ImportResult).

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for sync operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Server unreachable, login rejected, or no session established
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single file failed to download after exhausting retries
    #[error("Transfer of '{path}' failed after {attempts} attempt(s): {message}")]
    Transfer {
        path: String,
        attempts: u32,
        message: String,
    },

    /// A row could not be parsed into the expected shape
    #[error("Parse error at row {row}: {message}")]
    Parse { row: usize, message: String },

    /// A staged record failed type or required-field checks
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another run holds a fresh lock token
    #[error("Another sync run is active (lock held by {holder} since {acquired_at})")]
    LockConflict {
        holder: String,
        acquired_at: DateTime<Utc>,
    },

    #[error("Unknown import: {0}")]
    UnknownImport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SyncError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether this error aborts the whole run rather than a single item
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_) | SyncError::Cancelled | SyncError::Config(_)
        )
    }
}

impl From<assessor_common::AssessorError> for SyncError {
    fn from(err: assessor_common::AssessorError) -> Self {
        match err {
            assessor_common::AssessorError::Io(e) => SyncError::Io(e),
            assessor_common::AssessorError::Serialization(e) => SyncError::Serialization(e),
            assessor_common::AssessorError::Config(msg) => SyncError::Config(msg),
            assessor_common::AssessorError::Parse(msg) => SyncError::Config(msg),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_class_errors_are_fatal() {
        assert!(SyncError::connection("refused").is_fatal());
        assert!(SyncError::Cancelled.is_fatal());
        assert!(!SyncError::Transfer {
            path: "/a.csv".into(),
            attempts: 3,
            message: "timeout".into()
        }
        .is_fatal());
        assert!(!SyncError::Parse {
            row: 3,
            message: "bad".into()
        }
        .is_fatal());
        assert!(!SyncError::validation("missing key").is_fatal());
    }

    #[test]
    fn test_transfer_message_names_file_and_attempts() {
        let err = SyncError::Transfer {
            path: "/pub/parcel.csv".into(),
            attempts: 3,
            message: "timed out".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/pub/parcel.csv"));
        assert!(text.contains("3 attempt"));
    }
}

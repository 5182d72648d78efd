//! Error types for the assessor CLI
//!
//! Messages are user-facing: they say what failed and what to check.

use assessor_sync::SyncError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// The file server rejected or never answered the connection
    #[error("{0}. Check FTP_HOST, FTP_PORT, FTP_USERNAME and FTP_PASSWORD.")]
    Connection(String),

    /// Settings are missing or invalid
    #[error("{0}. Check your .env file or environment variables.")]
    Config(String),

    #[error("Import '{0}' not found. Run 'assessor staged' to list staged imports.")]
    UnknownImport(String),

    #[error("Cannot tell which entity '{0}' holds. Pass --entity (known: {1}).")]
    UnknownEntity(String, String),

    /// A run ended with status `failed`
    #[error("Run {run_id} failed: {reason}")]
    RunFailed { run_id: String, reason: String },

    #[error(transparent)]
    Sync(SyncError),

    #[error("File operation failed: {0}. Check file permissions and paths.")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<SyncError> for CliError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Connection(msg) => CliError::Connection(format!("Connection error: {}", msg)),
            SyncError::Config(msg) => CliError::Config(format!("Configuration error: {}", msg)),
            SyncError::UnknownImport(id) => CliError::UnknownImport(id),
            other => CliError::Sync(other),
        }
    }
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            _ => 1,
        }
    }
}

//! Sync configuration
//!
//! Loaded once per process from `.env` and the environment, validated
//! before anything touches the network or the lock token.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::transfer::retry::RetryPolicy;

// ============================================================================
// Defaults
// ============================================================================

/// County file server host.
pub const DEFAULT_FTP_HOST: &str = "ftp.spatialest.com";

/// Standard FTP control port.
pub const DEFAULT_FTP_PORT: u16 = 21;

/// Remote directory listed by a run.
pub const DEFAULT_REMOTE_PATH: &str = "/";

/// Local directory that receives downloaded files.
pub const DEFAULT_DATA_DIR: &str = "./data/benton-county";

/// Directory holding the lock token, schedule state and run logs.
pub const DEFAULT_STATE_DIR: &str = "./data/state";

/// Age after which a lock token is presumed abandoned (6 hours).
pub const DEFAULT_LOCK_STALE_SECS: u64 = 6 * 60 * 60;

/// Download attempts per file.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles on every further attempt.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound on a single backoff delay.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Timeout applied to each individual download attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 300;

/// Error descriptions kept in an import result or run summary.
pub const DEFAULT_MAX_REPORTED_ERRORS: usize = 50;

/// File name keywords that mark a candidate download.
pub const DEFAULT_KEYWORDS: &[&str] = &["property", "parcel", "assessment", "tax"];

/// Extensions a candidate download must carry.
pub const DEFAULT_EXTENSIONS: &[&str] = &["csv", "txt", "dat"];

/// Which matching remote files a run downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileSelection {
    /// Every matching file, newest first
    #[default]
    All,
    /// Only the newest matching file in each listed directory
    MostRecent,
}

impl FromStr for FileSelection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "all" => Ok(FileSelection::All),
            "most_recent" | "latest" => Ok(FileSelection::MostRecent),
            other => Err(SyncError::config(format!(
                "Invalid file selection '{}': expected 'all' or 'most_recent'",
                other
            ))),
        }
    }
}

/// Connection settings for the county file server
#[derive(Clone, Serialize, Deserialize)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Upgrade the control channel to TLS (explicit FTPS)
    pub secure: bool,
    /// Passive data connections; active mode otherwise
    pub passive: bool,
}

impl std::fmt::Debug for FtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("secure", &self.secure)
            .field("passive", &self.passive)
            .finish()
    }
}

impl Default for FtpSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_FTP_HOST.to_string(),
            port: DEFAULT_FTP_PORT,
            username: String::new(),
            password: String::new(),
            secure: false,
            passive: true,
        }
    }
}

impl FtpSettings {
    /// `host:port` string for the control connection
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fail before connecting when credentials were never supplied
    pub fn require_credentials(&self) -> SyncResult<()> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(SyncError::config(
                "FTP credentials not found: set FTP_USERNAME and FTP_PASSWORD",
            ));
        }
        Ok(())
    }
}

/// Retry settings for downloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            attempt_timeout_secs: DEFAULT_ATTEMPT_TIMEOUT_SECS,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }
}

/// Full sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub ftp: FtpSettings,
    pub remote_path: String,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Lock token location; must be visible to every process that runs syncs
    pub lock_path: PathBuf,
    pub lock_stale_secs: u64,
    pub retry: RetrySettings,
    pub selection: FileSelection,
    pub recursive: bool,
    pub delete_local: bool,
    pub keywords: Vec<String>,
    pub extensions: Vec<String>,
    /// Commit staged records straight after staging during a run
    pub auto_commit: bool,
    /// TOML entity catalog; the built-in catalog is used when unset
    pub mapping_file: Option<PathBuf>,
    pub database_url: String,
    pub max_reported_errors: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let state_dir = PathBuf::from(DEFAULT_STATE_DIR);
        Self {
            ftp: FtpSettings::default(),
            remote_path: DEFAULT_REMOTE_PATH.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            lock_path: state_dir.join("sync.lock"),
            database_url: format!("sqlite://{}", state_dir.join("assessor.db").display()),
            state_dir,
            lock_stale_secs: DEFAULT_LOCK_STALE_SECS,
            retry: RetrySettings::default(),
            selection: FileSelection::All,
            recursive: false,
            delete_local: false,
            keywords: DEFAULT_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            auto_commit: true,
            mapping_file: None,
            max_reported_errors: DEFAULT_MAX_REPORTED_ERRORS,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> SyncResult<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let state_dir = env_or("SYNC_STATE_DIR", defaults.state_dir)?;
        let lock_path = env_or("SYNC_LOCK_PATH", state_dir.join("sync.lock"))?;
        let database_url = env_or(
            "SYNC_DATABASE_URL",
            format!("sqlite://{}", state_dir.join("assessor.db").display()),
        )?;

        let config = Self {
            ftp: FtpSettings {
                host: env_or("FTP_HOST", defaults.ftp.host)?,
                port: env_or("FTP_PORT", defaults.ftp.port)?,
                username: env_or("FTP_USERNAME", String::new())?,
                password: env_or("FTP_PASSWORD", String::new())?,
                secure: env_or("FTP_SECURE", defaults.ftp.secure)?,
                passive: env_or("FTP_PASSIVE", defaults.ftp.passive)?,
            },
            remote_path: env_or("FTP_REMOTE_PATH", defaults.remote_path)?,
            data_dir: env_or("SYNC_DATA_DIR", defaults.data_dir)?,
            state_dir,
            lock_path,
            lock_stale_secs: env_or("SYNC_LOCK_STALE_SECS", defaults.lock_stale_secs)?,
            retry: RetrySettings {
                max_attempts: env_or("SYNC_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                base_delay_ms: env_or("SYNC_RETRY_BASE_DELAY_MS", defaults.retry.base_delay_ms)?,
                max_delay_ms: env_or("SYNC_RETRY_MAX_DELAY_MS", defaults.retry.max_delay_ms)?,
                attempt_timeout_secs: env_or(
                    "SYNC_ATTEMPT_TIMEOUT_SECS",
                    defaults.retry.attempt_timeout_secs,
                )?,
            },
            selection: env_or("SYNC_FILE_SELECTION", defaults.selection)?,
            recursive: env_or("SYNC_RECURSIVE", defaults.recursive)?,
            delete_local: env_or("SYNC_DELETE_LOCAL", defaults.delete_local)?,
            keywords: env_list("SYNC_KEYWORDS").unwrap_or(defaults.keywords),
            extensions: env_list("SYNC_EXTENSIONS").unwrap_or(defaults.extensions),
            auto_commit: env_or("SYNC_AUTO_COMMIT", defaults.auto_commit)?,
            mapping_file: std::env::var("SYNC_MAPPING_FILE").ok().map(PathBuf::from),
            database_url,
            max_reported_errors: env_or(
                "SYNC_MAX_REPORTED_ERRORS",
                defaults.max_reported_errors,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> SyncResult<()> {
        if self.ftp.host.trim().is_empty() {
            return Err(SyncError::config("FTP_HOST must not be empty"));
        }
        if self.ftp.port == 0 {
            return Err(SyncError::config("FTP_PORT must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::config(
                "SYNC_RETRY_MAX_ATTEMPTS must be greater than 0",
            ));
        }
        if self.retry.attempt_timeout_secs == 0 {
            return Err(SyncError::config(
                "SYNC_ATTEMPT_TIMEOUT_SECS must be greater than 0",
            ));
        }
        if self.lock_stale_secs == 0 {
            return Err(SyncError::config("SYNC_LOCK_STALE_SECS must be greater than 0"));
        }
        if self.extensions.is_empty() {
            return Err(SyncError::config("SYNC_EXTENSIONS must list at least one extension"));
        }
        if self.keywords.is_empty() {
            return Err(SyncError::config("SYNC_KEYWORDS must list at least one keyword"));
        }
        if !self.remote_path.starts_with('/') {
            return Err(SyncError::config(format!(
                "FTP_REMOTE_PATH must be absolute, got '{}'",
                self.remote_path
            )));
        }
        Ok(())
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    /// Directory of per-run JSON-lines logs
    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn schedule_path(&self) -> PathBuf {
        self.state_dir.join("schedule.json")
    }

    pub fn last_run_path(&self) -> PathBuf {
        self.state_dir.join("last_run.json")
    }
}

fn env_or<T>(key: &str, default: T) -> SyncResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| SyncError::config(format!("Invalid value for {}: {}", key, e))),
        _ => Ok(default),
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().trim_start_matches('.').to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

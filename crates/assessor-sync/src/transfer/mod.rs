//! Transfer client for the county file server
//!
//! [`TransferClient`] drives a [`FileTransport`] (FTP in production, fakes
//! in tests): it lists remote directories, downloads single files under a
//! [`RetryPolicy`], and mirrors a directory of candidate files into a local
//! target while keeping per-file failures out of the control flow.
//!
//! # Examples
//!
//! ```rust,ignore
//! use assessor_sync::transfer::{FtpTransport, SyncOptions, TransferClient};
//!
//! let mut client = TransferClient::new(FtpTransport::new(), config.retry.policy());
//! client.connect(&config.ftp).await?;
//! let result = client
//!     .sync_directory("/", &config.data_dir, &SyncOptions::from_config(&config), &cancel)
//!     .await;
//! client.disconnect().await;
//! ```

pub mod ftp;
pub mod listing;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FileSelection, FtpSettings, SyncConfig};
use crate::error::{SyncError, SyncResult};

pub use ftp::FtpTransport;
pub use retry::{Attempted, RetryFailure, RetryPolicy};

/// Manifest written next to downloaded files after a directory sync
pub const MANIFEST_FILE: &str = "metadata.json";

/// Kind of a remote directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    File,
    Directory,
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    /// Absolute remote path
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub kind: RemoteKind,
}

impl RemoteFile {
    pub fn is_dir(&self) -> bool {
        self.kind == RemoteKind::Directory
    }
}

/// Low-level access to a remote file server
///
/// Methods take `&self` so a retried operation can borrow the transport
/// for every attempt; implementations keep their session behind interior
/// mutability. A failed operation may drop the session, in which case the
/// next call re-establishes it from the settings given to `connect`.
#[async_trait]
pub trait FileTransport: Send + Sync {
    async fn connect(&self, settings: &FtpSettings) -> anyhow::Result<()>;

    async fn list(&self, path: &str) -> anyhow::Result<Vec<RemoteFile>>;

    async fn retrieve(&self, path: &str) -> anyhow::Result<Vec<u8>>;

    /// Close the session; never fails
    async fn disconnect(&self);
}

/// Counters accumulated over the life of a [`TransferClient`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub files_listed: u64,
    pub files_downloaded: u64,
    pub bytes_transferred: u64,
    pub attempts: u64,
    pub retries: u64,
    pub failures: u64,
}

/// Case-insensitive naming convention for candidate files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    pub keywords: Vec<String>,
    pub extensions: Vec<String>,
}

impl FileFilter {
    pub fn new(keywords: Vec<String>, extensions: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// A name matches when it carries one of the extensions and contains
    /// at least one keyword
    pub fn matches(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        let extension_ok = Path::new(&lower)
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|allowed| allowed == ext))
            .unwrap_or(false);

        extension_ok && self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

/// Options for [`TransferClient::sync_directory`]
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub recursive: bool,
    /// Remove local files that are no longer remote candidates
    pub delete_local: bool,
    pub selection: FileSelection,
    pub filter: FileFilter,
    /// Overrides the client's retry policy for this sync
    pub retry: Option<RetryPolicy>,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            recursive: config.recursive,
            delete_local: config.delete_local,
            selection: config.selection,
            filter: FileFilter::new(config.keywords.clone(), config.extensions.clone()),
            retry: Some(config.retry.policy()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTransfer {
    pub remote_path: String,
    pub attempts: u32,
    pub error: String,
}

/// Aggregate outcome of a directory sync
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncDirectoryResult {
    /// In processing order
    pub files_downloaded: Vec<DownloadedFile>,
    /// Remote paths that did not match the naming convention or selection
    pub skipped_files: Vec<String>,
    pub failed_files: Vec<FailedTransfer>,
    pub total_size_bytes: u64,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    source_host: &'a str,
    remote_path: &'a str,
    downloaded_at: DateTime<Utc>,
    files: Vec<ManifestEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    name: String,
    remote_path: &'a str,
    size: u64,
}

/// A candidate chosen for download, with its local destination
struct Candidate {
    remote: RemoteFile,
    local_path: PathBuf,
}

/// Session-aware client over a [`FileTransport`]
pub struct TransferClient<T: FileTransport> {
    transport: T,
    settings: Option<FtpSettings>,
    policy: RetryPolicy,
    stats: TransferStats,
}

impl<T: FileTransport> TransferClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            settings: None,
            policy,
            stats: TransferStats::default(),
        }
    }

    /// Establish a session
    ///
    /// Authentication and network failures surface as
    /// [`SyncError::Connection`]; the client stays disconnected.
    pub async fn connect(&mut self, settings: &FtpSettings) -> SyncResult<()> {
        info!(host = %settings.host, port = settings.port, secure = settings.secure, "Connecting to file server");
        self.transport
            .connect(settings)
            .await
            .map_err(|e| SyncError::connection(format!("{}: {:#}", settings.address(), e)))?;
        self.settings = Some(settings.clone());
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.settings.is_some()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::connection("not connected: call connect() first"))
        }
    }

    /// List a remote directory
    pub async fn list_files(&mut self, remote_path: &str) -> SyncResult<Vec<RemoteFile>> {
        self.ensure_connected()?;
        let policy = self.policy.clone();
        let entries = self
            .list_with(remote_path, &policy, &CancellationToken::new())
            .await
            .map_err(|failure| match failure {
                RetryFailure::Exhausted { last_error, .. } => {
                    SyncError::connection(format!("listing '{}' failed: {}", remote_path, last_error))
                },
                RetryFailure::Cancelled { .. } => SyncError::Cancelled,
            })?;
        Ok(entries)
    }

    async fn list_with(
        &mut self,
        remote_path: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteFile>, RetryFailure> {
        let transport = &self.transport;
        let outcome = policy
            .run("list", cancel, |_| transport.list(remote_path))
            .await;

        let attempts = match &outcome {
            Ok(done) => done.attempts,
            Err(failure) => failure.attempts(),
        };
        self.record_attempts(attempts);

        let listed = outcome?.value;
        self.stats.files_listed += listed.iter().filter(|f| !f.is_dir()).count() as u64;
        debug!(path = remote_path, entries = listed.len(), "Listed remote directory");
        Ok(listed)
    }

    /// Download one file to `local_path` under the client's retry policy
    ///
    /// The file is written to a `.part` sibling and renamed into place, so
    /// an interrupted download never leaves a truncated file under the
    /// final name.
    pub async fn download_file(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        cancel: &CancellationToken,
    ) -> SyncResult<DownloadedFile> {
        self.ensure_connected()?;
        let policy = self.policy.clone();
        self.download_with(remote_path, local_path, &policy, cancel).await
    }

    async fn download_with(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> SyncResult<DownloadedFile> {
        let transport = &self.transport;
        let outcome = policy
            .run("download", cancel, |_| transport.retrieve(remote_path))
            .await;

        let (data, attempts) = match outcome {
            Ok(done) => {
                self.record_attempts(done.attempts);
                (done.value, done.attempts)
            },
            Err(RetryFailure::Cancelled { attempts }) => {
                self.record_attempts(attempts);
                return Err(SyncError::Cancelled);
            },
            Err(RetryFailure::Exhausted {
                attempts,
                last_error,
            }) => {
                self.record_attempts(attempts);
                self.stats.failures += 1;
                return Err(SyncError::Transfer {
                    path: remote_path.to_string(),
                    attempts,
                    message: last_error,
                });
            },
        };

        if let Err(e) = write_atomically(local_path, &data).await {
            self.stats.failures += 1;
            return Err(SyncError::Transfer {
                path: remote_path.to_string(),
                attempts,
                message: format!("writing {}: {}", local_path.display(), e),
            });
        }

        let size = data.len() as u64;
        self.stats.files_downloaded += 1;
        self.stats.bytes_transferred += size;
        info!(remote = remote_path, local = %local_path.display(), bytes = size, attempts, "Downloaded file");

        Ok(DownloadedFile {
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            size,
            attempts,
        })
    }

    fn record_attempts(&mut self, attempts: u32) {
        self.stats.attempts += attempts as u64;
        self.stats.retries += attempts.saturating_sub(1) as u64;
    }

    /// Mirror matching files of `remote_path` into `local_dir`
    ///
    /// Candidates are processed newest first. A file that exhausts its
    /// retries, or a subdirectory that cannot be listed, is recorded in
    /// `failed_files` and the sync moves on. Only a failure to list
    /// `remote_path` itself, or cancellation, is returned as an error.
    pub async fn sync_directory(
        &mut self,
        remote_path: &str,
        local_dir: &Path,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncDirectoryResult> {
        self.ensure_connected()?;
        let policy = options.retry.clone().unwrap_or_else(|| self.policy.clone());
        let mut result = SyncDirectoryResult::default();

        let candidates = self
            .collect_candidates(remote_path, local_dir, options, &policy, cancel, &mut result)
            .await?;

        info!(
            remote = remote_path,
            candidates = candidates.len(),
            skipped = result.skipped_files.len(),
            "Selected files for download"
        );

        for candidate in &candidates {
            if cancel.is_cancelled() {
                warn!(remote = remote_path, "Sync cancelled before next file");
                return Err(SyncError::Cancelled);
            }

            match self
                .download_with(&candidate.remote.path, &candidate.local_path, &policy, cancel)
                .await
            {
                Ok(file) => {
                    result.total_size_bytes += file.size;
                    result.files_downloaded.push(file);
                },
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(SyncError::Transfer {
                    path,
                    attempts,
                    message,
                }) => {
                    warn!(remote = %path, attempts, error = %message, "File transfer failed, continuing");
                    result.failed_files.push(FailedTransfer {
                        remote_path: path,
                        attempts,
                        error: message,
                    });
                },
                Err(other) => {
                    warn!(remote = %candidate.remote.path, error = %other, "File transfer failed, continuing");
                    result.failed_files.push(FailedTransfer {
                        remote_path: candidate.remote.path.clone(),
                        attempts: 0,
                        error: other.to_string(),
                    });
                },
            }
        }

        if options.delete_local {
            remove_stale_local_files(local_dir, &candidates).await;
        }

        if let Err(e) = self.write_manifest(remote_path, local_dir, &result).await {
            warn!(dir = %local_dir.display(), error = %e, "Failed to write download manifest");
        }

        Ok(result)
    }

    async fn collect_candidates(
        &mut self,
        remote_root: &str,
        local_root: &Path,
        options: &SyncOptions,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        result: &mut SyncDirectoryResult,
    ) -> SyncResult<Vec<Candidate>> {
        let mut pending = vec![(remote_root.to_string(), local_root.to_path_buf())];
        let mut candidates = Vec::new();
        let mut is_root = true;

        while let Some((remote_dir, local_dir)) = pending.pop() {
            let entries = match self.list_with(&remote_dir, policy, cancel).await {
                Ok(entries) => entries,
                Err(RetryFailure::Cancelled { .. }) => return Err(SyncError::Cancelled),
                Err(RetryFailure::Exhausted {
                    attempts,
                    last_error,
                }) if is_root => {
                    return Err(SyncError::connection(format!(
                        "listing '{}' failed after {} attempt(s): {}",
                        remote_dir, attempts, last_error
                    )));
                },
                Err(RetryFailure::Exhausted {
                    attempts,
                    last_error,
                }) => {
                    warn!(remote = %remote_dir, error = %last_error, "Subdirectory listing failed, continuing");
                    result.failed_files.push(FailedTransfer {
                        remote_path: remote_dir,
                        attempts,
                        error: last_error,
                    });
                    continue;
                },
            };
            is_root = false;

            let mut matching = Vec::new();
            let mut subdirs = Vec::new();
            for entry in entries {
                if entry.is_dir() {
                    if options.recursive {
                        subdirs.push(entry);
                    }
                } else if options.filter.matches(&entry.name) {
                    matching.push(entry);
                } else {
                    debug!(remote = %entry.path, "Skipping file outside naming convention");
                    result.skipped_files.push(entry.path);
                }
            }

            // Newest first; entries without a timestamp go last in listing order.
            matching.sort_by(|a, b| b.modified.cmp(&a.modified));
            if options.selection == FileSelection::MostRecent && matching.len() > 1 {
                for older in matching.split_off(1) {
                    debug!(remote = %older.path, "Skipping older file under most-recent selection");
                    result.skipped_files.push(older.path);
                }
            }

            candidates.extend(matching.into_iter().map(|remote| Candidate {
                local_path: local_dir.join(&remote.name),
                remote,
            }));

            // Reverse so the stack visits subdirectories in listing order.
            for dir in subdirs.into_iter().rev() {
                pending.push((dir.path.clone(), local_dir.join(&dir.name)));
            }
        }

        Ok(candidates)
    }

    async fn write_manifest(
        &self,
        remote_path: &str,
        local_dir: &Path,
        result: &SyncDirectoryResult,
    ) -> anyhow::Result<()> {
        let manifest = Manifest {
            source_host: self.settings.as_ref().map(|s| s.host.as_str()).unwrap_or_default(),
            remote_path,
            downloaded_at: Utc::now(),
            files: result
                .files_downloaded
                .iter()
                .map(|f| ManifestEntry {
                    name: f
                        .local_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    remote_path: &f.remote_path,
                    size: f.size,
                })
                .collect(),
        };

        tokio::fs::create_dir_all(local_dir).await?;
        let body = serde_json::to_vec_pretty(&manifest)?;
        tokio::fs::write(local_dir.join(MANIFEST_FILE), body).await?;
        Ok(())
    }

    /// Close the session; safe to call when never connected
    pub async fn disconnect(&mut self) {
        if self.settings.take().is_some() {
            self.transport.disconnect().await;
            debug!(
                downloaded = self.stats.files_downloaded,
                bytes = self.stats.bytes_transferred,
                retries = self.stats.retries,
                "Disconnected from file server"
            );
        }
    }
}

async fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    tokio::fs::write(&part, data).await?;
    tokio::fs::rename(&part, path).await
}

/// Remove files directly under `local_dir` that no candidate maps to
async fn remove_stale_local_files(local_dir: &Path, candidates: &[Candidate]) {
    let keep: HashSet<&Path> = candidates.iter().map(|c| c.local_path.as_path()).collect();

    let mut entries = match tokio::fs::read_dir(local_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %local_dir.display(), error = %e, "Cannot scan local directory for cleanup");
            return;
        },
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file || entry.file_name() == MANIFEST_FILE || keep.contains(path.as_path()) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(file = %path.display(), "Removed local file no longer on server"),
            Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove stale local file"),
        }
    }
}

//! The synchronization run
//!
//! One run connects to the file server, syncs the configured directory,
//! then stages (and, with auto-commit, commits) every downloaded file
//! whose name maps to a catalog entity. Only a connection failure or
//! cancellation ends the run early; everything else is reported.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::commit::CommitEngine;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::run_log::{RunLogger, RunReport};
use crate::scheduler::RunJob;
use crate::transfer::{DownloadedFile, FileTransport, SyncOptions, TransferClient};

/// Builds a fresh transport for each run
pub trait TransportFactory: Send + Sync {
    type Transport: FileTransport;

    fn create(&self) -> Self::Transport;
}

impl<T, F> TransportFactory for F
where
    T: FileTransport,
    F: Fn() -> T + Send + Sync,
{
    type Transport = T;

    fn create(&self) -> T {
        self()
    }
}

pub struct SyncPipeline<F: TransportFactory> {
    config: SyncConfig,
    engine: Arc<CommitEngine>,
    transports: F,
}

impl<F: TransportFactory> SyncPipeline<F> {
    pub fn new(config: SyncConfig, engine: Arc<CommitEngine>, transports: F) -> Self {
        Self {
            config,
            engine,
            transports,
        }
    }

    pub fn engine(&self) -> &Arc<CommitEngine> {
        &self.engine
    }

    async fn import_file(
        &self,
        file: &DownloadedFile,
        log: &RunLogger,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> SyncResult<()> {
        let name = file_name(&file.local_path);

        let Some(entity) = self.engine.catalog().detect(&name) else {
            log.warn("no entity type matches file; skipped", json!({ "file": name }));
            report.errors.push(format!("{}: no entity type matches; file skipped", name));
            return Ok(());
        };
        let entity = entity.name.clone();

        let bytes = match tokio::fs::read(&file.local_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log.error("cannot read downloaded file", json!({ "file": name, "error": e.to_string() }));
                report.errors.push(format!("{}: cannot read downloaded file: {}", name, e));
                return Ok(());
            },
        };

        let batch = match self.engine.stage_bytes(&bytes, &entity, &file.remote_path).await {
            Ok(batch) => batch,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log.error("staging failed", json!({ "file": name, "error": e.to_string() }));
                report.errors.push(format!("{}: staging failed: {}", name, e));
                return Ok(());
            },
        };
        report.records_staged += batch.row_count as u64;
        report.import_ids.push(batch.import_id.clone());
        log.info(
            "file staged",
            json!({
                "file": name,
                "entity": entity,
                "import_id": batch.import_id,
                "rows": batch.row_count,
                "invalid": batch.invalid_count,
            }),
        );

        if !self.config.auto_commit {
            report.records_failed += batch.invalid_count as u64;
            return Ok(());
        }

        match self.engine.commit_import(&batch.import_id, cancel).await {
            Ok(result) => {
                for failure in &result.failures {
                    log.warn(
                        "record rejected",
                        json!({
                            "file": name,
                            "import_id": batch.import_id,
                            "row": failure.row,
                            "record_id": failure.record_id,
                            "error": failure.message,
                        }),
                    );
                }
                report.records_committed += result.success_count as u64;
                report.records_failed += result.failure_count as u64;
                let hidden = result.total_errors.saturating_sub(result.errors.len());
                report
                    .errors
                    .extend(result.errors.iter().map(|e| format!("{}: {}", name, e)));
                if hidden > 0 {
                    report.errors.push(format!("{}: {} more record error(s)", name, hidden));
                }
                log.info(
                    "file committed",
                    json!({
                        "file": name,
                        "import_id": batch.import_id,
                        "committed": result.success_count,
                        "inserted": result.inserted,
                        "updated": result.updated,
                        "failed": result.failure_count,
                    }),
                );
                Ok(())
            },
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log.error("commit failed", json!({ "file": name, "error": e.to_string() }));
                report.errors.push(format!("{}: commit failed: {}", name, e));
                Ok(())
            },
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[async_trait]
impl<F: TransportFactory> RunJob for SyncPipeline<F> {
    async fn execute(&self, log: &RunLogger, cancel: &CancellationToken) -> SyncResult<RunReport> {
        self.config.ftp.require_credentials()?;

        let mut client = TransferClient::new(self.transports.create(), self.config.retry.policy());
        if let Err(e) = client.connect(&self.config.ftp).await {
            log.error(
                "connection failed",
                json!({ "host": self.config.ftp.host, "port": self.config.ftp.port, "error": e.to_string() }),
            );
            return Err(e);
        }
        log.info(
            "connected",
            json!({ "host": self.config.ftp.host, "remote_path": self.config.remote_path }),
        );

        let options = SyncOptions::from_config(&self.config);
        // The session is closed even if syncing panics; the panic then
        // carries on to the scheduler.
        let synced = AssertUnwindSafe(client.sync_directory(
            &self.config.remote_path,
            &self.config.data_dir,
            &options,
            cancel,
        ))
        .catch_unwind()
        .await;
        let stats = client.stats().clone();
        client.disconnect().await;
        let synced = synced.unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;

        let mut report = RunReport {
            files_processed: (synced.files_downloaded.len() + synced.failed_files.len()) as u64,
            files_downloaded: synced.files_downloaded.len() as u64,
            bytes_transferred: synced.total_size_bytes,
            ..RunReport::default()
        };
        for failed in &synced.failed_files {
            log.warn(
                "file transfer failed",
                json!({ "file": failed.remote_path, "attempts": failed.attempts, "error": failed.error }),
            );
            report.errors.push(
                SyncError::Transfer {
                    path: failed.remote_path.clone(),
                    attempts: failed.attempts,
                    message: failed.error.clone(),
                }
                .to_string(),
            );
        }
        log.info(
            "directory synced",
            json!({
                "downloaded": synced.files_downloaded.len(),
                "skipped": synced.skipped_files.len(),
                "failed": synced.failed_files.len(),
                "bytes": synced.total_size_bytes,
                "retries": stats.retries,
            }),
        );

        for file in &synced.files_downloaded {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.import_file(file, log, cancel, &mut report).await?;
        }

        Ok(report)
    }
}

//! Production wiring
//!
//! [`SyncService`] builds the full stack from a [`SyncConfig`]: entity
//! catalog, SQLite staging and production stores, file lock, and a
//! scheduler whose runs go through the real FTP transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commit::CommitEngine;
use crate::config::SyncConfig;
use crate::db;
use crate::error::{SyncError, SyncResult};
use crate::import::EntityCatalog;
use crate::lock::LockCoordinator;
use crate::pipeline::SyncPipeline;
use crate::production::SqliteProductionStore;
use crate::scheduler::{StatePaths, SyncScheduler};
use crate::staging::SqliteStagingStore;
use crate::transfer::{DownloadedFile, FtpTransport, RemoteFile, TransferClient};

pub type FtpPipeline = SyncPipeline<fn() -> FtpTransport>;

pub struct SyncService {
    config: SyncConfig,
    engine: Arc<CommitEngine>,
    scheduler: SyncScheduler<FtpPipeline>,
}

impl SyncService {
    pub async fn from_config(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.state_dir)?;
        if let Some(parent) = config.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let catalog = match &config.mapping_file {
            Some(path) => {
                info!(path = %path.display(), "Loading entity catalog");
                EntityCatalog::load(path)?
            },
            None => EntityCatalog::builtin(),
        };

        let pool = db::connect(&config.database_url).await?;
        let staging = SqliteStagingStore::new(pool.clone()).await?;
        let production = SqliteProductionStore::new(pool).await?;
        let engine = Arc::new(
            CommitEngine::new(Arc::new(catalog), Arc::new(staging), Arc::new(production))
                .with_max_reported_errors(config.max_reported_errors),
        );

        let transports: fn() -> FtpTransport = FtpTransport::new;
        let pipeline = SyncPipeline::new(config.clone(), engine.clone(), transports);
        let locks = LockCoordinator::file(config.lock_path.clone(), config.lock_stale_after());
        let scheduler = SyncScheduler::new(pipeline, locks, StatePaths::from_config(&config))
            .with_max_reported_errors(config.max_reported_errors);

        Ok(Self {
            config,
            engine,
            scheduler,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn engine(&self) -> &CommitEngine {
        &self.engine
    }

    pub fn scheduler(&self) -> &SyncScheduler<FtpPipeline> {
        &self.scheduler
    }

    async fn connected_client(&self) -> SyncResult<TransferClient<FtpTransport>> {
        self.config.ftp.require_credentials()?;
        let mut client = TransferClient::new(FtpTransport::new(), self.config.retry.policy());
        client.connect(&self.config.ftp).await?;
        Ok(client)
    }

    /// List one remote directory
    pub async fn list(&self, remote_path: &str) -> SyncResult<Vec<RemoteFile>> {
        let mut client = self.connected_client().await?;
        let listed = client.list_files(remote_path).await;
        client.disconnect().await;
        listed
    }

    /// Download one remote file into `output_dir` (the data directory by default)
    pub async fn download(
        &self,
        remote_path: &str,
        output_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> SyncResult<DownloadedFile> {
        let local_path = local_target(remote_path, output_dir.unwrap_or(&self.config.data_dir))?;
        let mut client = self.connected_client().await?;
        let downloaded = client.download_file(remote_path, &local_path, cancel).await;
        client.disconnect().await;
        downloaded
    }
}

fn local_target(remote_path: &str, dir: &Path) -> SyncResult<PathBuf> {
    let name = remote_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .ok_or_else(|| SyncError::config(format!("'{}' does not name a file", remote_path)))?;
    Ok(dir.join(name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerState;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> SyncConfig {
        let state_dir = dir.path().join("state");
        SyncConfig {
            lock_path: state_dir.join("sync.lock"),
            database_url: format!("sqlite://{}", state_dir.join("assessor.db").display()),
            data_dir: dir.path().join("data"),
            state_dir,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_local_target_uses_remote_file_name() {
        let dir = Path::new("/tmp/out");
        assert_eq!(
            local_target("/pub/exports/parcel_2024.csv", dir).unwrap(),
            dir.join("parcel_2024.csv")
        );
        assert!(local_target("/pub/..", dir).is_err());
        assert!(local_target("/", dir).is_err());
    }

    #[tokio::test]
    async fn test_service_builds_from_config() {
        let dir = TempDir::new().unwrap();
        let service = SyncService::from_config(config(&dir)).await.unwrap();

        assert!(dir.path().join("state/assessor.db").exists());
        assert_eq!(service.engine().catalog().entities().len(), 3);

        let status = service.scheduler().status().unwrap();
        assert_eq!(status.state, SchedulerState::Idle);
        assert!(status.last_run.is_none());
    }

    #[tokio::test]
    async fn test_run_without_credentials_fails_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let lock_path = config.lock_path.clone();
        let service = SyncService::from_config(config).await.unwrap();

        let run = service
            .scheduler()
            .run_once(crate::run_log::RunTrigger::Manual, &CancellationToken::new())
            .await;

        assert_eq!(run.status, crate::run_log::RunStatus::Failed);
        assert!(run.errors[0].contains("FTP credentials"));
        assert!(!lock_path.exists());
    }
}

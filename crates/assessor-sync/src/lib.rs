//! Assessor Sync
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Pulls county assessment exports from a remote file server, stages the
//! parsed records for review, and commits accepted records to the
//! production store.
//!
//! - **Transfer**: [`transfer::TransferClient`] over a [`transfer::FileTransport`]
//!   (FTP/FTPS via [`transfer::FtpTransport`]), with bounded retries
//! - **Run control**: [`scheduler::SyncScheduler`] and the cross-process
//!   [`lock::LockCoordinator`]
//! - **Import**: [`import`] parsers and mapper, [`staging`] stores,
//!   [`commit::CommitEngine`] and the [`production::ProductionStore`] contract
//! - **Reporting**: [`run_log::RunLogger`] per-run JSON-lines logs and summaries
//!
//! # Example
//!
//! ```no_run
//! use assessor_sync::{RunTrigger, SyncConfig, SyncService};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> assessor_sync::SyncResult<()> {
//! let service = SyncService::from_config(SyncConfig::from_env()?).await?;
//! let run = service
//!     .scheduler()
//!     .run_once(RunTrigger::Manual, &CancellationToken::new())
//!     .await;
//! println!("{}", run.summary_line());
//! # Ok(())
//! # }
//! ```

pub mod commit;
pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod lock;
pub mod pipeline;
pub mod production;
pub mod run_log;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod staging;
pub mod transfer;

pub use commit::{CommitEngine, ImportResult, RecordFailure};
pub use config::{FileSelection, FtpSettings, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use import::EntityCatalog;
pub use lock::{LockCoordinator, LockToken};
pub use pipeline::SyncPipeline;
pub use production::{EntityRecord, ProductionStore, WriteOutcome};
pub use run_log::{RunReport, RunStatus, RunTrigger, SyncRun};
pub use schedule::{Recurrence, ScheduleState};
pub use scheduler::{RunJob, SchedulerState, SyncScheduler};
pub use service::SyncService;
pub use staging::{ImportBatch, StagedRecord, StagingStore, ValidationStatus};
pub use transfer::{FileTransport, RemoteFile, TransferClient};

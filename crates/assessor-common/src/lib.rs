//! Assessor Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging setup for the assessor sync workspace.
//!
//! - **Error Handling**: [`AssessorError`] and the [`Result`] alias
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]
//! - **State files**: atomic JSON documents shared between processes
//!
//! # Example
//!
//! ```no_run
//! use assessor_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("started");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod state;

pub use error::{AssessorError, Result};

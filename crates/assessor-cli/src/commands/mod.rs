//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod commit;
pub mod disable;
pub mod download;
pub mod list;
pub mod run_once;
pub mod schedule;
pub mod stage;
pub mod staged;
pub mod status;

use assessor_sync::{RunStatus, SyncConfig, SyncService};
use colored::{ColoredString, Colorize};

use crate::error::Result;

/// Build the service from `.env` and the environment
pub async fn service() -> Result<SyncService> {
    let config = SyncConfig::from_env()?;
    Ok(SyncService::from_config(config).await?)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

pub fn colored_status(status: RunStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        RunStatus::Succeeded => text.green().bold(),
        RunStatus::Skipped => text.yellow().bold(),
        RunStatus::Failed => text.red().bold(),
        RunStatus::Running => text.cyan(),
    }
}

/// Print a capped error sample with the hidden remainder
pub fn print_errors(errors: &[String], total: usize) {
    if errors.is_empty() {
        return;
    }
    println!("{}", "Errors:".red().bold());
    for error in errors {
        println!("  - {}", error);
    }
    if total > errors.len() {
        println!("  ... and {} more", total - errors.len());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 + 512 * 1024), "5.50 MB");
    }

    #[test]
    fn test_colored_status_keeps_text() {
        colored::control::set_override(false);
        assert_eq!(colored_status(RunStatus::Skipped).to_string(), "skipped");
        assert_eq!(colored_status(RunStatus::Failed).to_string(), "failed");
    }
}

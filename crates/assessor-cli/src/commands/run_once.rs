//! `assessor run-once` command implementation

use assessor_sync::{RunStatus, RunTrigger, SyncRun};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use super::{colored_status, format_bytes, print_errors, service};
use crate::error::{CliError, Result};

/// Run one synchronization; `skipped` counts as success
pub async fn run(cancel: &CancellationToken) -> Result<()> {
    let service = service().await?;
    let run = service.scheduler().run_once(RunTrigger::Manual, cancel).await;
    print_run(&run);
    outcome(&run)
}

pub fn print_run(run: &SyncRun) {
    println!("{} {}", "Run".cyan().bold(), run.run_id);
    println!("  Status:      {}", colored_status(run.status));
    if run.status == RunStatus::Skipped {
        println!("  Another run holds the lock; nothing was done.");
        return;
    }
    println!("  Files:       {} processed, {} downloaded", run.files_processed, run.files_downloaded);
    println!("  Transferred: {}", format_bytes(run.bytes_transferred));
    println!(
        "  Records:     {} staged, {} committed, {} failed",
        run.records_staged, run.records_committed, run.records_failed
    );
    if let Some(duration) = run.duration() {
        println!("  Duration:    {:.1}s", duration.num_milliseconds() as f64 / 1000.0);
    }
    for import_id in &run.import_ids {
        println!("  Import:      {}", import_id);
    }
    print_errors(&run.errors, run.total_errors);
}

fn outcome(run: &SyncRun) -> Result<()> {
    if run.status.is_success() {
        return Ok(());
    }
    Err(CliError::RunFailed {
        run_id: run.run_id.to_string(),
        reason: run
            .errors
            .first()
            .cloned()
            .unwrap_or_else(|| "see the run log for details".to_string()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_only_failed_runs_are_errors() {
        let mut skipped = SyncRun::start(RunTrigger::Manual);
        skipped.finish(RunStatus::Skipped);
        assert!(outcome(&skipped).is_ok());

        let mut ok = SyncRun::start(RunTrigger::Manual);
        ok.finish(RunStatus::Succeeded);
        assert!(outcome(&ok).is_ok());

        let mut failed = SyncRun::start(RunTrigger::Manual);
        failed.push_error("Connection error: refused", 10);
        failed.finish(RunStatus::Failed);
        let err = outcome(&failed).unwrap_err();
        assert!(err.to_string().contains("refused"));
        assert_eq!(err.exit_code(), 1);
    }
}

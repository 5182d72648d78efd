//! `assessor schedule` command implementation

use assessor_sync::Recurrence;
use chrono::Utc;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use super::service;
use crate::error::Result;

const PREVIEW_FIRES: usize = 3;

/// Persist the schedule, then run the scheduler loop unless `no_wait`
pub async fn run(expression: &str, no_wait: bool, cancel: &CancellationToken) -> Result<()> {
    let service = service().await?;
    let state = service.scheduler().schedule(expression)?;
    let recurrence = Recurrence::parse(expression)?;

    println!(
        "{} {}",
        "✓".green().bold(),
        format!("Schedule set: {}", state.expression.as_deref().unwrap_or(expression)).bold()
    );
    println!("  Next runs (UTC):");
    for at in recurrence.upcoming(Utc::now(), PREVIEW_FIRES) {
        println!("    {}", at.format("%Y-%m-%d %H:%M:%S"));
    }

    if no_wait {
        println!();
        println!("Saved only. Run {} again without --no-wait to start the scheduler.", "assessor schedule".cyan());
        return Ok(());
    }

    println!();
    println!("{}", "Scheduler running; press Ctrl-C to stop.".dimmed());
    service.scheduler().run_scheduled(cancel).await?;
    println!("{}", "Scheduler stopped.".yellow());
    Ok(())
}

//! `assessor status` command implementation

use assessor_sync::scheduler::{SchedulerState, SchedulerStatus};
use colored::Colorize;

use super::{colored_status, service};
use crate::error::Result;

pub async fn run(json: bool) -> Result<()> {
    let service = service().await?;
    let status = service.scheduler().status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &SchedulerStatus) {
    println!("{}", "Scheduler".cyan().bold());
    let state = match &status.state {
        SchedulerState::Idle => "idle".to_string(),
        SchedulerState::AcquiringLock => "acquiring lock".to_string(),
        SchedulerState::Running { run_id, .. } => format!("running ({})", run_id),
    };
    println!("  State:    {}", state);

    match (&status.schedule.expression, status.schedule.enabled) {
        (Some(expression), true) => println!("  Schedule: {} {}", expression, "(enabled)".green()),
        (Some(expression), false) => println!("  Schedule: {} {}", expression, "(disabled)".yellow()),
        (None, _) => println!("  Schedule: {}", "none".dimmed()),
    }
    if let Some(next) = status.next_fire {
        println!("  Next run: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    println!();
    println!("{}", "Run lock".cyan().bold());
    println!("  Location: {}", status.lock.location);
    match &status.lock.token {
        Some(token) => {
            let age = status.lock.age_secs.map(|s| format!("{}s", s)).unwrap_or_default();
            let label = if status.lock.stale {
                "stale".yellow()
            } else {
                "held".red()
            };
            println!("  Status:   {} by {} ({} ago)", label, token.holder(), age);
        },
        None if status.lock.corrupt => println!("  Status:   {}", "corrupt (will be reclaimed)".yellow()),
        None => println!("  Status:   {}", "free".green()),
    }

    println!();
    println!("{}", "Last run".cyan().bold());
    match &status.last_run {
        Some(run) => {
            println!("  Run:      {}", run.run_id);
            println!("  Status:   {}", colored_status(run.status));
            println!("  Started:  {}", run.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!(
                "  Records:  {} committed, {} failed",
                run.records_committed, run.records_failed
            );
            if run.total_errors > 0 {
                println!("  Errors:   {}", run.total_errors);
            }
        },
        None => println!("  {}", "No runs recorded yet.".dimmed()),
    }
}

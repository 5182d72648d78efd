//! `assessor disable` command implementation

use colored::Colorize;

use super::service;
use crate::error::Result;

pub async fn run() -> Result<()> {
    let service = service().await?;
    let state = service.scheduler().disable()?;

    match state.expression {
        Some(expression) => println!(
            "{} Schedule '{}' disabled. A run already in progress is not interrupted.",
            "✓".green().bold(),
            expression
        ),
        None => println!("{}", "No schedule was configured; nothing to disable.".yellow()),
    }
    Ok(())
}

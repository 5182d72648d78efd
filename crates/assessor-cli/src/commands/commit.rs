//! `assessor commit` command implementation

use assessor_sync::ImportResult;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use super::{print_errors, service};
use crate::error::Result;

pub async fn run(import_id: &str, cancel: &CancellationToken) -> Result<()> {
    let service = service().await?;
    let result = service.engine().commit_import(import_id, cancel).await?;
    print_result(import_id, &result);
    Ok(())
}

fn print_result(import_id: &str, result: &ImportResult) {
    let marker = if result.failure_count == 0 {
        "✓".green().bold()
    } else {
        "!".yellow().bold()
    };
    println!("{} Committed import {}", marker, import_id.bold());
    println!("  Records:   {}", result.total);
    println!("  Committed: {}", result.success_count.to_string().green());
    println!("    inserted {}, updated {}", result.inserted, result.updated);
    if result.failure_count > 0 {
        println!("  Failed:    {}", result.failure_count.to_string().red());
    }
    print_errors(&result.errors, result.total_errors);
}

//! `assessor staged` command implementation

use assessor_sync::{ImportBatch, StagedRecord, ValidationStatus};
use colored::Colorize;

use super::{service, stage::print_batch};
use crate::error::Result;

/// Without an id, list imports newest first; with one, show its records
pub async fn run(import_id: Option<&str>, invalid_only: bool) -> Result<()> {
    let service = service().await?;
    let engine = service.engine();

    let Some(import_id) = import_id else {
        let batches = engine.list_batches().await?;
        print_batches(&batches);
        return Ok(());
    };

    let batch = engine.get_batch(import_id).await?;
    let records = engine.get_staged_records(import_id).await?;
    print_batch(&batch);
    println!();

    let shown: Vec<&StagedRecord> = records
        .iter()
        .filter(|r| !invalid_only || r.status == ValidationStatus::Invalid)
        .collect();
    if shown.is_empty() {
        println!("{}", "No matching records.".dimmed());
        return Ok(());
    }
    for record in shown {
        print_record(record);
    }
    Ok(())
}

fn print_batches(batches: &[ImportBatch]) {
    if batches.is_empty() {
        println!("{}", "No staged imports.".yellow());
        return;
    }
    println!(
        "{:<38} {:<12} {:>6} {:>6} {:>8}  {}",
        "IMPORT".bold(),
        "ENTITY".bold(),
        "ROWS".bold(),
        "VALID".bold(),
        "INVALID".bold(),
        "SOURCE".bold()
    );
    for batch in batches {
        let invalid = if batch.invalid_count > 0 {
            batch.invalid_count.to_string().red()
        } else {
            batch.invalid_count.to_string().normal()
        };
        println!(
            "{:<38} {:<12} {:>6} {:>6} {:>8}  {}",
            batch.import_id, batch.entity_type, batch.row_count, batch.valid_count, invalid, batch.source_name
        );
    }
}

fn print_record(record: &StagedRecord) {
    let status = match record.status {
        ValidationStatus::Valid => "valid".green(),
        ValidationStatus::Invalid => "invalid".red(),
        ValidationStatus::Pending => "pending".yellow(),
    };
    let committed = if record.committed_at.is_some() {
        " (committed)".dimmed().to_string()
    } else {
        String::new()
    };
    println!("Row {} [{}]{}", record.row_number, status, committed);
    for (name, value) in &record.fields {
        println!("    {:<20} {}", name, value);
    }
    for error in &record.errors {
        println!("    {} {}", "!".red().bold(), error);
    }
}

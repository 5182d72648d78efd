//! `assessor stage` command implementation

use assessor_sync::{EntityCatalog, ImportBatch};
use colored::Colorize;
use std::path::Path;

use super::service;
use crate::error::{CliError, Result};

/// Stage a local file for review; nothing is committed
pub async fn run(file: &Path, entity: Option<&str>) -> Result<()> {
    let service = service().await?;
    let engine = service.engine();
    let entity = resolve_entity(engine.catalog(), file, entity)?;

    let source = file.display().to_string();
    let reader = tokio::fs::File::open(file).await?;
    let batch = engine.stage_import(reader, &entity, &source).await?;

    print_batch(&batch);
    println!();
    println!(
        "Review with {} and commit with {}",
        format!("assessor staged {}", batch.import_id).cyan(),
        format!("assessor commit {}", batch.import_id).cyan()
    );
    Ok(())
}

/// Explicit entity if known, otherwise detected from the file name
fn resolve_entity(catalog: &EntityCatalog, file: &Path, entity: Option<&str>) -> Result<String> {
    let known = || {
        catalog
            .entities()
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let label = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());

    let spec = match entity {
        Some(name) => catalog.get(name),
        None => catalog.detect(&label),
    };
    spec.map(|s| s.name.clone())
        .ok_or_else(|| CliError::UnknownEntity(entity.map(str::to_string).unwrap_or(label), known()))
}

pub fn print_batch(batch: &ImportBatch) {
    println!("{} {}", "Staged".green().bold(), batch.import_id.bold());
    println!("  Entity:  {}", batch.entity_type);
    println!("  Source:  {}", batch.source_name);
    println!("  Rows:    {}", batch.row_count);
    println!("  Valid:   {}", batch.valid_count.to_string().green());
    if batch.invalid_count > 0 {
        println!("  Invalid: {}", batch.invalid_count.to_string().red());
    } else {
        println!("  Invalid: 0");
    }
}

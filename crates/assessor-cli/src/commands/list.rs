//! `assessor list` command implementation

use colored::Colorize;

use super::{format_bytes, service};
use crate::error::Result;

pub async fn run(remote_path: &str) -> Result<()> {
    let service = service().await?;
    let mut entries = service.list(remote_path).await?;

    if entries.is_empty() {
        println!("{}", format!("{} is empty.", remote_path).yellow());
        return Ok(());
    }

    // Directories first, then by name
    entries.sort_by(|a, b| b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name)));

    println!("{} {}", "Listing".cyan().bold(), remote_path);
    for entry in &entries {
        let modified = entry
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        if entry.is_dir() {
            println!("  {:>10}  {:16}  {}/", "<dir>", modified, entry.name.blue().bold());
        } else {
            println!("  {:>10}  {:16}  {}", format_bytes(entry.size), modified, entry.name);
        }
    }
    println!();
    println!("{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
    Ok(())
}

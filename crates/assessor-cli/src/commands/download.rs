//! `assessor download` command implementation

use colored::Colorize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::{format_bytes, service};
use crate::error::Result;

pub async fn run(remote_path: &str, output: Option<&Path>, cancel: &CancellationToken) -> Result<()> {
    let service = service().await?;
    let file = service.download(remote_path, output, cancel).await?;

    println!(
        "{} Downloaded {} ({}) to {}",
        "✓".green().bold(),
        file.remote_path,
        format_bytes(file.size),
        file.local_path.display()
    );
    if file.attempts > 1 {
        println!("  Took {} attempts", file.attempts);
    }
    Ok(())
}

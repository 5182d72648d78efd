//! Assessor CLI - Main entry point

use assessor_cli::{Cli, Commands};
use assessor_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use clap::Parser;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Verbose mode logs debug to the console; otherwise only warnings
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    };
    let defaults = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("assessor")
        .build();

    // Environment variables take precedence
    let log_config = defaults.clone().merge_env().unwrap_or(defaults);
    let _guard = init_logging(&log_config).ok();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            on_signal.cancel();
        }
    });

    if let Err(e) = execute_command(&cli, &cancel).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

async fn execute_command(cli: &Cli, cancel: &CancellationToken) -> assessor_cli::Result<()> {
    use assessor_cli::commands;

    match &cli.command {
        Commands::RunOnce => commands::run_once::run(cancel).await,

        Commands::Schedule {
            expression,
            no_wait,
        } => commands::schedule::run(expression, *no_wait, cancel).await,

        Commands::Disable => commands::disable::run().await,

        Commands::Status { json } => commands::status::run(*json).await,

        Commands::List { remote_path } => commands::list::run(remote_path).await,

        Commands::Download {
            remote_path,
            output,
        } => commands::download::run(remote_path, output.as_deref(), cancel).await,

        Commands::Stage { file, entity } => commands::stage::run(file, entity.as_deref()).await,

        Commands::Staged { import_id, invalid } => {
            commands::staged::run(import_id.as_deref(), *invalid).await
        },

        Commands::Commit { import_id } => commands::commit::run(import_id, cancel).await,
    }
}

//! Relay CLI - Main entry point

use std::process;

use clap::Parser;
use relay_cli::commands;
use relay_cli::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use relay_cli::{load_config, Cli, Commands};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        })
        .output(LogOutput::Console)
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().with_env().unwrap_or(log_config);

    // The CLI still works without logging
    let _ = init_logging(&log_config);

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> relay_cli::Result<()> {
    match cli.command {
        Commands::Status { json } => commands::status::run(load_config(cli, false)?, json).await,

        Commands::Close { all } => commands::close::run(load_config(cli, false)?, all).await,

        Commands::ResetFailed => commands::reset_failed::run(load_config(cli, false)?).await,

        Commands::Sweep => commands::sweep::run(load_config(cli, false)?).await,

        Commands::Clear { yes } => commands::clear::run(load_config(cli, false)?, yes).await,

        Commands::Maintain => commands::maintain::run(load_config(cli, false)?).await,

        Commands::Destinations => commands::destinations::run(load_config(cli, false)?).await,

        Commands::Run { interval, once } => {
            commands::run::run(load_config(cli, !once)?, interval, once).await
        },
    }
}

use anyhow::Result;
use clap::Parser;
use imap_taskengine::cli::{Cli, CliHandler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set log level based on debug flag
    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // Logs go to stderr so command output stays clean
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(log_level)
        .init();

    if cli.debug {
        tracing::debug!("Debug mode enabled - verbose logging active");
    }

    let handler = CliHandler::new(&cli.config)?;
    handler.handle_command(cli.command, cli.dry_run).await
}

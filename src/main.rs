//! stepforge CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level
    let cli = stepforge::cli::parse_cli();

    // Console priority: RUST_LOG env var > --log-level CLI arg > default "info".
    // Run log files are always written at debug.
    let router = stepforge::observability::init_logging(&cli.log_level);

    stepforge::cli::run_with_cli(cli, router).await
}

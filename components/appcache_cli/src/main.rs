//! `appcache` command-line tool
//!
//! Parses arguments, installs logging and delegates to the Runtime.

use appcache_cli::{Cli, CliResult, Runtime};
use clap::Parser as ClapParser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> CliResult<()> {
    let runtime = Runtime::open(cli).await?;
    runtime.execute(&cli.command).await
}

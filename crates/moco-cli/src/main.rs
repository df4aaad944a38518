//! `moco` binary.
//!
//! Loads `.env` and the configuration file, sets up tracing, and dispatches
//! the subcommands defined in [`cli`].

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing("info", cli.json);

    let config = commands::load_config(&cli.config)?;
    match cli.command {
        Commands::CheckInput { text } => commands::check_input(&config, &text),
        Commands::CheckTool { name, args } => commands::check_tool(&config, &name, &args),
        Commands::Checkpoints { action } => commands::checkpoints(&config, action).await,
        Commands::Mcp { action } => commands::mcp(&config, action).await,
        Commands::Agents => commands::agents(&config),
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` overrides `default_level`.
fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    parley_runtime::init_logging();

    // Parse CLI args
    let cli = Cli::parse();

    match cli.command {
        // Doesn't need config
        Commands::Init { path } => commands::init::run_init(&path)?,
        Commands::Chat { session } => {
            let config = config::load_config(cli.config.as_deref())?;
            commands::chat::execute(session, &config).await?;
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::debug;

use forge_devcontainer::cli::{self, Cli};
use forge_devcontainer::config::Settings;
use forge_devcontainer::monitoring;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::new().context("Failed to load settings")?;

    let level = cli.log_level.clone().unwrap_or_else(|| settings.log_level.clone());
    monitoring::init_tracing(&level)?;
    debug!(?settings, "Settings loaded");

    cli::run(cli, settings).await
}

pub mod cli;
pub mod commands;
pub mod output;

use anyhow::{anyhow, Result};
use cli::Cli;
use kbchat_core::{AppContext, ClientConfig};

/// Resolve configuration, build the context and run one command.
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = ClientConfig::load().map_err(|err| anyhow!(err.user_message()))?;
    if let Some(url) = &cli.api_url {
        config = config
            .with_base_url(url)
            .map_err(|err| anyhow!(err.user_message()))?;
    }
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    tracing::debug!(base_url = %config.base_url, data_dir = %config.data_dir.display(), "configuration resolved");

    let ctx = AppContext::new(config)?;
    commands::execute(&ctx, cli.command).await
}

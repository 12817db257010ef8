use clap::Parser;
use kbchat::cli::Cli;
use kbchat_core::telemetry;
use tokio::runtime::Runtime;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(telemetry::default_filter(cli.verbose))?;

    let runtime = Runtime::new()?;
    runtime.block_on(kbchat::run(cli))
}

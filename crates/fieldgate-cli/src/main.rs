mod cli;
mod commands;
mod observability;
mod output;

use anyhow::Result;
use clap::Parser;
use fieldgate::AuthorizerConfig;

use cli::{Cli, Commands};
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    observability::init_tracing_with_level(&cli.log_level);

    let format = cli.format.unwrap_or_default();
    let config = AuthorizerConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Check(args) => commands::check::check(config, args, format).await?,
        Commands::Watch(args) => commands::watch::watch(config, args, format).await?,
        Commands::Validate(args) => commands::validate::validate(config, args).await?,
    }

    Ok(())
}

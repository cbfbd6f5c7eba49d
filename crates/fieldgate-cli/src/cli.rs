use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "fieldgate")]
#[command(about = "fieldgate CLI: evaluate field-level access policies")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (overrides FIELDGATE_CONFIG env var)
    #[arg(short, long, global = true, env = "FIELDGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Table,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check which fields a user may read or write on a resource
    Check(CheckArgs),
    /// Keep the policy refreshed and report statistics until Ctrl-C
    Watch(WatchArgs),
    /// Load the configuration and compile the policy once
    Validate(ValidateArgs),
}

#[derive(clap::Args)]
pub struct CheckArgs {
    /// Authenticated user id
    #[arg(short, long)]
    pub uid: String,
    /// Resource name (e.g. agents)
    #[arg(short, long)]
    pub resource: String,
    /// Check write access instead of read access
    #[arg(short, long)]
    pub write: bool,
    /// Give up waiting for the first policy after this many seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,
}

#[derive(clap::Args)]
pub struct WatchArgs {
    /// Seconds between statistics reports
    #[arg(long, default_value_t = 30)]
    pub report_every: u64,
}

#[derive(clap::Args)]
pub struct ValidateArgs {
    /// Give up waiting for the first policy after this many seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,
    /// Print the effective configuration as TOML
    #[arg(long)]
    pub print: bool,
}

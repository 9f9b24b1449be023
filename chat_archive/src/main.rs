use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chat_archive::{config, runner};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let level = if cli.debug {
        "debug"
    } else if cfg.logging_enabled {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    runner::run(&cli, cfg).await
}

use anyhow::Result;
use clap::Parser;
use shelfkeep_mgmt::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(config = ?cli.config, data = ?cli.data, "shelfkeep starting");
    cli.run().await
}

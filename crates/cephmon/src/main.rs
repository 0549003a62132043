use anyhow::Result;
use cephmon::cli::Cli;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (json, text) = if cli.log_json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_writer(std::io::stderr)))
    };
    tracing_subscriber::registry()
        .with(json)
        .with(text)
        .with(filter)
        .init();

    tracing::debug!("cephmon {} starting", env!("CARGO_PKG_VERSION"));
    cli.run().await
}

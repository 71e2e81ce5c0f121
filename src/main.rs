use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use remote_pull::{
    config::{read_settings, Environment},
    services::push_image::push_image,
    Remote,
};

/// Copy a local Docker image to a remote host and load it there
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Skip pulling the image locally before transfer
    #[arg(long)]
    skip_pull: bool,

    /// Settings file
    #[arg(short, long, env = "REMOTE_PULL_CONFIG")]
    config: Option<PathBuf>,

    image: String,

    /// Target as user@host, where host may be an alias from ~/.ssh/config
    server: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let settings = read_settings(cli.config).context("could not load settings")?;
    debug!(?settings, "Settings loaded");

    let remote = Remote::new(settings, Environment::from_process());

    push_image(&remote, &cli.image, &cli.server, cli.skip_pull).await
}

//! Standalone entry point: loads a YAML config, installs the tracing
//! subscriber, and runs the router until Ctrl-C.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use routerd::config::RawConfig;
use routerd::{logging, Router};

#[derive(Parser, Debug)]
#[command(name = "routerd", about = "Userspace multi-protocol traffic router")]
struct Args {
    /// Path to the YAML config file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = Args::parse();
    let config = RawConfig::from_path(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    let router = Router::from_config(config).context("building router from config")?;

    tracing::info!(config = %args.config.display(), "routerd starting");
    router
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
}

//! Client daemon entry point.

use anyhow::Context;
use bauta_core::config::ClientConfig;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bauta-client", about = "Bauta VPN client")]
struct Args {
    /// Path to the client TOML configuration.
    #[arg(short, long, default_value = "client.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = ClientConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let root = CancellationToken::new();
    tokio::spawn(bauta_daemon::signals::cancel_on_shutdown(root.clone()));

    bauta_daemon::client::run_with_backoff(cfg, root).await?;
    info!("shutdown complete");
    Ok(())
}

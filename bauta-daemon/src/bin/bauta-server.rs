//! Server daemon entry point.

use anyhow::Context;
use bauta_core::config::ServerConfig;
use bauta_daemon::registry::{FileRegistry, MemoryRegistry};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bauta-server", about = "Bauta VPN server")]
struct Args {
    /// Path to the server TOML configuration.
    #[arg(short, long, default_value = "server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = ServerConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry: Arc<dyn bauta_daemon::registry::ClientRegistry> = match &cfg.registry_file {
        Some(path) => Arc::new(
            FileRegistry::load(path).with_context(|| format!("loading {}", path.display()))?,
        ),
        None => {
            warn!("no registry_file configured, no client will be admitted");
            Arc::new(MemoryRegistry::default())
        }
    };

    let root = CancellationToken::new();
    tokio::spawn(bauta_daemon::signals::cancel_on_shutdown(root.clone()));

    bauta_daemon::server::run(cfg, registry, root).await?;
    info!("shutdown complete");
    Ok(())
}

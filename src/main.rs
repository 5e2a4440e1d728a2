use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use medral_service::models::ModelRegistry;
use medral_service::{server, AppContext, Config};

/// Gateway serving triage, reports, scribe, translator and polypharmacy workflows
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file (default: ~/.medral/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind, overriding the config
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overriding the config
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    let mut config = Config::load(&config_path)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("Invalid configuration")?;

    info!("Medral gateway starting...");
    info!("Config: {:?}", config_path);
    info!(
        "Vision model: {} at {}",
        config.models.vision.model_name, config.models.vision.base_url
    );
    if config.models.text.enabled {
        info!(
            "Text model: {} at {}",
            config.models.text.model_name, config.models.text.base_url
        );
    }

    let registry = ModelRegistry::from_config(&config.models)?;
    let ctx = AppContext::new(config, registry)?;
    server::serve(Arc::new(ctx)).await
}

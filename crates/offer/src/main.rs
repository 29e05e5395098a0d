//! tapevault daemon.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::sync::Arc;
use tapevault_core::config::AppConfig;
use tapevault_offer::{LibraryDevices, OfferMetrics, TapeOffer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// tapevault - tape library storage offer
#[derive(Parser, Debug)]
#[command(name = "tapevaultd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "TAPEVAULT_CONFIG",
        default_value = "config/tapevault.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("tapevault v{}", env!("CARGO_PKG_VERSION"));

    // The file is optional; TAPEVAULT_* variables override it.
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::warn!(
            config_path = %args.config,
            "No config file found, using defaults and environment"
        );
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("TAPEVAULT_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;

    let metrics = Arc::new(OfferMetrics::new().context("failed to register metrics")?);

    let store = tapevault_metadata::from_config(&config.metadata)
        .await
        .context("failed to open metadata store")?;
    store
        .migrate()
        .await
        .context("failed to migrate metadata store")?;
    tracing::info!("Metadata store initialized");

    let devices = LibraryDevices::from_config(&config.library);
    match &devices {
        Some(devices) => tracing::info!(drives = devices.drives.len(), "Tape library configured"),
        None => tracing::warn!("No tape robot configured, orders will wait in the queue"),
    }

    let offer = TapeOffer::start(&config, store, devices, metrics)
        .await
        .context("failed to start tape offer")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");
    offer.shutdown().await;
    Ok(())
}

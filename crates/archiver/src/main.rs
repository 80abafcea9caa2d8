//! hoard archiver binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use hoard_archiver::{Archiver, HttpOrigin};
use hoard_core::config::ArchiverAppConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// hoard archiver: fetch origin content into shared storage
#[derive(Parser, Debug)]
#[command(name = "hoard-archiver")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "HOARD_CONFIG",
        default_value = "config/archiver.toml"
    )]
    config: String,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
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

    tracing::info!("hoard archiver v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    let storage = hoard_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage initialized");

    let manifest = hoard_manifest::from_config(&config.manifest)
        .await
        .context("failed to open manifest")?;
    manifest
        .health_check()
        .await
        .context("manifest health check failed")?;
    tracing::info!("Manifest opened");

    let origin = HttpOrigin::new(&config.origin).context("failed to build origin client")?;
    tracing::info!(base_url = %config.origin.base_url, "Origin client ready");

    let archiver = Archiver::new(manifest, storage, Arc::new(origin), &config);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let interval = config.archiver.pass_interval();
    loop {
        let result = archiver.run_pass(&cancel).await;
        if args.once {
            result.context("archive pass failed")?;
            break;
        }
        if let Err(e) = result {
            tracing::error!(error = %e, "Archive pass failed, retrying after interval");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::info!("Archiver stopped");
    Ok(())
}

/// Load configuration from an optional TOML file overlaid with `HOARD_`
/// environment variables.
fn load_config(path: &str) -> Result<ArchiverAppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}, using defaults and environment", path);
    }

    let config: ArchiverAppConfig = figment
        .merge(Env::prefixed("HOARD_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown requested, finishing in-flight items");
    token.cancel();
}

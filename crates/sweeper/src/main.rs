//! hoard sweeper binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use hoard_core::config::SweeperAppConfig;
use hoard_sweeper::Sweeper;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// hoard sweeper: reclaim orphaned and expired files on shared storage
#[derive(Parser, Debug)]
#[command(name = "hoard-sweeper")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "HOARD_CONFIG",
        default_value = "config/sweeper.toml"
    )]
    config: String,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,

    /// Report what would be removed without changing anything
    #[arg(long)]
    dry_run: bool,
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

    tracing::info!("hoard sweeper v{}", env!("CARGO_PKG_VERSION"));

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

    let dry_run = args.dry_run || config.sweeper.dry_run;
    if dry_run {
        tracing::warn!("Dry-run mode: nothing will be deleted or tombstoned");
    }
    let sweeper = Sweeper::new(manifest, storage, &config).with_dry_run(dry_run);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let interval = config.sweeper.interval();
    loop {
        let result = sweeper.run(&cancel).await;
        if args.once {
            result.context("sweep failed")?;
            break;
        }
        if let Err(e) = result {
            tracing::error!(error = %e, "Sweep failed, retrying after interval");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::info!("Sweeper stopped");
    Ok(())
}

/// Load configuration from an optional TOML file overlaid with `HOARD_`
/// environment variables.
fn load_config(path: &str) -> Result<SweeperAppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}, using defaults and environment", path);
    }

    let config: SweeperAppConfig = figment
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
    tracing::info!("Shutdown requested, stopping after the current item");
    token.cancel();
}

//! Image registry server
//!
//! ```bash
//! registry-server --config registry.toml
//! RUST_LOG=image_registry=debug registry-server --bind 0.0.0.0:9292
//! ```

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use image_registry::{Registry, RegistryConfig, router};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Disk image registry server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(short, long)]
    bind: Option<std::net::SocketAddr>,
}

async fn load_config(path: Option<&Utf8PathBuf>) -> eyre::Result<RegistryConfig> {
    let Some(path) = path else {
        return Ok(RegistryConfig::default());
    };

    let text = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading configuration from {path}"))?;
    toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing configuration from {path}"))
}

async fn scrub(registry: Registry, interval: std::time::Duration) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        match registry.scrub().await {
            Ok(scrubbed) if !scrubbed.is_empty() => {
                tracing::info!(count = scrubbed.len(), "Scrubbed deleted images")
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "Scrubber pass failed"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_ref()).await?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let registry = config
        .builder()
        .await
        .wrap_err("configuring storage")?
        .registry();

    if config.delayed_delete {
        tokio::spawn(scrub(registry.clone(), config.scrub_interval()));
    }

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .wrap_err_with(|| format!("binding to {}", config.bind))?;
    tracing::info!(
        driver = registry.storage().name(),
        "Image registry listening on http://{}",
        config.bind
    );

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("serving registry")?;

    Ok(())
}

#![deny(clippy::disallowed_methods)]

pub mod batch;
pub mod boot;
pub mod cleanup;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod fs;
pub mod guest;
pub mod keyfile;
pub mod pipeline;
pub mod preflight;
pub mod types;

use anyhow::{Context, Result};
use clap::Parser as _;
use cmd::IntoCommand as _;
use shadow_rs::shadow;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

shadow!(build);

pub async fn run() -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::Cli::parse();

    if args.verbose {
        reload_handle
            .modify(|filter| {
                *filter = tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into())
            })
            .context("Failed to update log level to DEBUG")?;
    }
    crate::fs::set_verbose(tracing::enabled!(target: "imgcrypt", tracing::Level::DEBUG)).await;

    tracing::debug!(
        "imgcrypt version: v{}  commit: {}  buildtime: {}",
        build::PKG_VERSION,
        build::COMMIT_HASH,
        build::BUILD_TIME
    );
    tracing::debug!("Using config file {:?}", args.config);

    args.into_command().run().await?;

    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;

    #[ctor::ctor]
    fn init() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "debug".into());
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    }
}

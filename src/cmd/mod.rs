use std::path::Path;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

use crate::config::{ImageConfig, Settings};

pub mod batch;
pub mod encrypt;
pub mod inspect;
pub mod keygen;

#[async_trait]
pub trait Command {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self) -> Box<dyn Command>;
}

impl IntoCommand for crate::cli::Cli {
    fn into_command(self) -> Box<dyn Command> {
        let config = self.config;
        match self.command {
            crate::cli::GlobalSubcommand::Encrypt(encrypt_args) => {
                Box::new(encrypt::EncryptCommand {
                    config,
                    encrypt_args,
                })
            }
            crate::cli::GlobalSubcommand::Batch(batch_args) => {
                Box::new(batch::BatchCommand { config, batch_args })
            }
            crate::cli::GlobalSubcommand::Keygen(keygen_options) => {
                Box::new(keygen::KeygenCommand { keygen_options })
            }
            crate::cli::GlobalSubcommand::Inspect(inspect_options) => {
                Box::new(inspect::InspectCommand { inspect_options })
            }
        }
    }
}

async fn load_settings(
    config: Option<&Path>,
    options: &crate::cli::EncryptOptions,
) -> Result<Settings> {
    let file = ImageConfig::load(config).await?;
    let settings = Settings::resolve(file, options);
    tracing::debug!(?settings, "Settings resolved");
    Ok(settings)
}

/// A token cancelled on the first SIGINT or SIGTERM.
fn cancel_on_signal() -> Result<CancellationToken> {
    let mut sigint = tokio::signal::unix::signal(SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::warn!("Interrupted, releasing resources");
            }
            _ = sigterm.recv() => {
                tracing::warn!("Terminated, releasing resources");
            }
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(cancel)
}

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::{
    cli::EncryptArgs,
    error::PipelineError,
    fs::luks2,
    keyfile::{Keyfile, KeyfileGenerator},
    pipeline::{Pipeline, Unit},
    preflight,
};

pub struct EncryptCommand {
    pub config: Option<PathBuf>,
    pub encrypt_args: EncryptArgs,
}

/// `<stem>-encrypted.img` next to the source.
pub fn default_output(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_owned());
    source.with_file_name(format!("{stem}-encrypted.img"))
}

#[async_trait]
impl super::Command for EncryptCommand {
    async fn run(&self) -> Result<()> {
        let settings =
            super::load_settings(self.config.as_deref(), &self.encrypt_args.options).await?;
        let source = &self.encrypt_args.image;
        let output = self
            .encrypt_args
            .output
            .clone()
            .unwrap_or_else(|| default_output(source));

        preflight::check_all(&settings, source, &[&output], 1)
            .map_err(PipelineError::Precondition)?;

        let (keyfile, generated) = match &settings.keyfile {
            Some(path) => (Keyfile::load(path).await?, false),
            None => (
                KeyfileGenerator::new(&settings.key_dir).generate().await?,
                true,
            ),
        };
        tracing::info!("Using keyfile {:?}", keyfile.path());

        let passphrase = if settings.passphrase {
            Some(luks2::prompt_passphrase().await?)
        } else {
            None
        };

        let keep_original = settings.keep_original;
        let unit = Unit {
            source: source.clone(),
            output,
            keyfile,
            passphrase,
            settings: Arc::new(settings),
        };

        let cancel = super::cancel_on_signal()?;
        let result = Pipeline::default().run(&unit, &cancel).await;
        cancel.cancel();

        let report = match result {
            Ok(report) => report,
            Err(error) => {
                if generated {
                    if let Err(e) = tokio::fs::remove_file(unit.keyfile.path()).await {
                        tracing::warn!(
                            "Failed to remove unused keyfile {:?}: {e}",
                            unit.keyfile.path()
                        );
                    }
                }
                return Err(error.into());
            }
        };

        if !keep_original {
            tokio::fs::remove_file(source)
                .await
                .with_context(|| format!("Failed to remove source image {source:?}"))?;
            tracing::info!("Removed source image {source:?}");
        }

        println!("image:   {}", report.output.display());
        println!("keyfile: {}", unit.keyfile.path().display());
        println!("uuid:    {}", unit.keyfile.id());
        Ok(())
    }
}

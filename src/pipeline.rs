//! The single-image encryption pipeline.
//!
//! A run copies the source image, attaches the copy, backs up its root
//! filesystem, turns the root partition into a LUKS2 container, restores the
//! content into it and rewrites the boot chain. Every resource goes onto the
//! run's [`ResourceStack`], which is unwound once on every exit path. A failed
//! or interrupted run deletes its output image.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rand::RngCore as _;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{
    boot::{self, BootTarget},
    cleanup::{Resource, ResourceReleaser, ResourceStack, SystemReleaser},
    config::Settings,
    error::PipelineError,
    fs::{
        cmd::CheckCommandOutput as _,
        loopdev::{self, LoopAttachment},
        luks2,
        mkfs::ROOT_LABEL,
        mount, rsync,
    },
    keyfile::Keyfile,
    types::{KdfTuning, MakeFsType, Passphrase},
};

/// The system operations a run is made of.
#[async_trait]
pub trait ImageOps: Send + Sync {
    async fn copy_image(&self, source: &Path, output: &Path) -> Result<()>;

    /// Attach `image` with partition scanning, returning the loop device.
    async fn attach(&self, image: &Path) -> Result<PathBuf>;

    async fn partition(&self, device: &Path, index: u32) -> Result<PathBuf>;

    async fn partuuid(&self, partition: &Path) -> Result<Option<String>>;

    async fn is_luks(&self, partition: &Path) -> Result<bool>;

    async fn mount(&self, device: &Path, target: &Path, read_only: bool) -> Result<()>;

    async fn mirror(&self, source: &Path, target: &Path) -> Result<()>;

    async fn format(&self, partition: &Path, keyfile: &Keyfile, settings: &Settings)
        -> Result<()>;

    async fn add_passphrase(
        &self,
        partition: &Path,
        keyfile: &Keyfile,
        passphrase: &Passphrase,
        kdf: &KdfTuning,
    ) -> Result<()>;

    /// Open the container as `name`, returning the mapped device.
    async fn open(&self, partition: &Path, name: &str, keyfile: &Keyfile) -> Result<PathBuf>;

    async fn mkfs(&self, device: &Path, fs_type: MakeFsType) -> Result<()>;

    async fn rewrite_boot(&self, target: &BootTarget<'_>, stack: &mut ResourceStack)
        -> Result<()>;
}

/// Runs everything against the host.
#[derive(Debug, Default)]
pub struct SystemOps;

#[async_trait]
impl ImageOps for SystemOps {
    async fn copy_image(&self, source: &Path, output: &Path) -> Result<()> {
        tokio::fs::copy(source, output)
            .await
            .with_context(|| format!("Failed to copy {source:?} to {output:?}"))?;
        Ok(())
    }

    async fn attach(&self, image: &Path) -> Result<PathBuf> {
        Ok(LoopAttachment::attach(image, false).await?.path().to_path_buf())
    }

    async fn partition(&self, device: &Path, index: u32) -> Result<PathBuf> {
        loopdev::resolve_partition(device, index).await
    }

    async fn partuuid(&self, partition: &Path) -> Result<Option<String>> {
        Command::new("blkid")
            .args(["-s", "PARTUUID", "-o", "value"])
            .arg(partition)
            .run_with_status_checker(|output| match output.code {
                0 => {
                    let partuuid = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                    Ok((!partuuid.is_empty()).then_some(partuuid))
                }
                // no such tag
                2 => Ok(None),
                _ => anyhow::bail!("Bad exit code"),
            })
            .await
            .with_context(|| format!("Failed to read PARTUUID of {partition:?}"))
    }

    async fn is_luks(&self, partition: &Path) -> Result<bool> {
        luks2::is_luks(partition).await
    }

    async fn mount(&self, device: &Path, target: &Path, read_only: bool) -> Result<()> {
        mount::mount(device, target, read_only).await
    }

    async fn mirror(&self, source: &Path, target: &Path) -> Result<()> {
        rsync::mirror(source, target).await
    }

    async fn format(
        &self,
        partition: &Path,
        keyfile: &Keyfile,
        settings: &Settings,
    ) -> Result<()> {
        luks2::format(partition, keyfile.path(), settings.crypto, &settings.kdf).await
    }

    async fn add_passphrase(
        &self,
        partition: &Path,
        keyfile: &Keyfile,
        passphrase: &Passphrase,
        kdf: &KdfTuning,
    ) -> Result<()> {
        luks2::add_passphrase(partition, keyfile.path(), passphrase, kdf).await
    }

    async fn open(&self, partition: &Path, name: &str, keyfile: &Keyfile) -> Result<PathBuf> {
        luks2::open(partition, name, keyfile.path()).await?;
        Ok(luks2::mapper_path(name))
    }

    async fn mkfs(&self, device: &Path, fs_type: MakeFsType) -> Result<()> {
        fs_type.mkfs(device, ROOT_LABEL).await
    }

    async fn rewrite_boot(
        &self,
        target: &BootTarget<'_>,
        stack: &mut ResourceStack,
    ) -> Result<()> {
        boot::rewrite(target, stack).await
    }
}

/// One image to produce.
pub struct Unit {
    pub source: PathBuf,
    pub output: PathBuf,
    pub keyfile: Keyfile,
    pub passphrase: Option<Passphrase>,
    pub settings: Arc<Settings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub output: PathBuf,
    pub size: u64,
}

pub struct Pipeline {
    ops: Arc<dyn ImageOps>,
    releaser: Arc<dyn ResourceReleaser>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Arc::new(SystemOps), Arc::new(SystemReleaser))
    }
}

/// Device-mapper name of a run on the host. The pid and a random token keep
/// concurrent runs and leftovers from earlier runs apart.
pub fn host_mapping_name(mapper: &str) -> String {
    let mut token = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut token);
    format!("{mapper}_{}_{}", std::process::id(), hex::encode(token))
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Interrupted);
    }
    Ok(())
}

impl Pipeline {
    pub fn new(ops: Arc<dyn ImageOps>, releaser: Arc<dyn ResourceReleaser>) -> Self {
        Self { ops, releaser }
    }

    pub async fn run(
        &self,
        unit: &Unit,
        cancel: &CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        // never overwrite, and never delete on failure, a file this run did not create
        if tokio::fs::try_exists(&unit.output).await.unwrap_or(true) {
            return Err(PipelineError::Precondition(anyhow::anyhow!(
                "Output image {:?} already exists",
                unit.output
            )));
        }

        let mut stack = ResourceStack::new(self.releaser.clone());

        // operations are never abandoned mid-flight, a cancelled run stops at
        // the next checkpoint
        let result = self.stages(unit, cancel, &mut stack).await;

        let summary = stack.unwind().await;
        tracing::debug!(
            released = summary.released,
            failed = summary.failed,
            "Resources unwound"
        );

        let result = match result {
            Ok(()) => self.verify_size(unit).await,
            Err(e) => Err(e),
        };

        if let Err(error) = &result {
            tracing::error!(
                category = error.category(),
                "Run failed, discarding {:?}",
                unit.output
            );
            match tokio::fs::remove_file(&unit.output).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {:?}: {e}", unit.output),
            }
        }

        result
    }

    async fn verify_size(&self, unit: &Unit) -> Result<RunReport, PipelineError> {
        let sizes = async {
            let expected = tokio::fs::metadata(&unit.source).await?.len();
            let actual = tokio::fs::metadata(&unit.output).await?.len();
            Ok::<_, std::io::Error>((expected, actual))
        }
        .await
        .context("Failed to stat images")
        .map_err(PipelineError::ResourceAcquisition)?;

        match sizes {
            (expected, actual) if expected != actual => {
                Err(PipelineError::SizeMismatch { expected, actual })
            }
            (_, size) => Ok(RunReport {
                output: unit.output.clone(),
                size,
            }),
        }
    }

    async fn stages(
        &self,
        unit: &Unit,
        cancel: &CancellationToken,
        stack: &mut ResourceStack,
    ) -> Result<(), PipelineError> {
        let ops = &*self.ops;
        let settings = &*unit.settings;

        // working directory and image copy
        let workdir = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("imgcrypt-");
            match &settings.work_dir {
                Some(parent) => builder.tempdir_in(parent),
                None => builder.tempdir(),
            }
            .context("Failed to create working directory")
            .map_err(PipelineError::ResourceAcquisition)?
            .keep()
        };
        stack.push(Resource::TempDir(workdir.clone()));

        tracing::info!("Copying {:?} to {:?}", unit.source, unit.output);
        ops.copy_image(&unit.source, &unit.output)
            .await
            .map_err(PipelineError::ResourceAcquisition)?;
        checkpoint(cancel)?;

        // attach
        let (boot_dev, root_dev, partuuid) = async {
            let device = ops.attach(&unit.output).await?;
            stack.push(Resource::Loop(device.clone()));
            let boot_dev = ops.partition(&device, settings.boot_partition).await?;
            let root_dev = ops.partition(&device, settings.root_partition).await?;
            let partuuid = ops.partuuid(&root_dev).await?;
            Ok::<_, anyhow::Error>((boot_dev, root_dev, partuuid))
        }
        .await
        .map_err(PipelineError::ResourceAcquisition)?;
        tracing::info!(?partuuid, "Root partition is {root_dev:?}, boot partition is {boot_dev:?}");

        if ops
            .is_luks(&root_dev)
            .await
            .map_err(PipelineError::Precondition)?
        {
            return Err(PipelineError::Precondition(anyhow::anyhow!(
                "Root partition {root_dev:?} is already a LUKS volume"
            )));
        }
        checkpoint(cancel)?;

        // backup
        let original = workdir.join("orig");
        let staging = workdir.join("staging");
        let original_mount = stack.push(Resource::Mount(original.clone()));
        ops.mount(&root_dev, &original, true)
            .await
            .map_err(PipelineError::ResourceAcquisition)?;

        tracing::info!("Backing up root filesystem to {staging:?}");
        async {
            ops.mirror(&original, &staging).await?;
            stack.release(original_mount).await
        }
        .await
        .map_err(PipelineError::Backup)?;
        checkpoint(cancel)?;

        // encrypted container
        let mapping = host_mapping_name(&settings.mapper);
        let mapped = async {
            ops.format(&root_dev, &unit.keyfile, settings).await?;
            if let Some(passphrase) = &unit.passphrase {
                ops.add_passphrase(&root_dev, &unit.keyfile, passphrase, &settings.kdf)
                    .await?;
            }
            stack.push(Resource::Mapping(mapping.clone()));
            let mapped = ops.open(&root_dev, &mapping, &unit.keyfile).await?;
            ops.mkfs(&mapped, settings.makefs).await?;
            Ok::<_, anyhow::Error>(mapped)
        }
        .await
        .map_err(PipelineError::Container)?;
        checkpoint(cancel)?;

        // restore
        let root = workdir.join("root");
        stack.push(Resource::Mount(root.clone()));
        ops.mount(&mapped, &root, false)
            .await
            .map_err(PipelineError::ResourceAcquisition)?;

        tracing::info!("Restoring root filesystem into the encrypted container");
        if let Err(source) = ops.mirror(&staging, &root).await {
            tracing::error!(
                "Restore from {staging:?} failed, the container is incomplete and the output is discarded. The source image is untouched"
            );
            return Err(PipelineError::Restore { staging, source });
        }
        checkpoint(cancel)?;

        // boot configuration
        let boot = workdir.join("boot");
        stack.push(Resource::Mount(boot.clone()));
        ops.mount(&boot_dev, &boot, false)
            .await
            .map_err(PipelineError::ResourceAcquisition)?;

        tracing::info!("Rewriting boot configuration");
        let target = BootTarget {
            root: &root,
            boot: &boot,
            partuuid: partuuid.as_deref(),
            keyfile: &unit.keyfile,
            settings,
        };
        ops.rewrite_boot(&target, stack)
            .await
            .map_err(PipelineError::BootConfig)?;
        checkpoint(cancel)?;

        tracing::info!("Encrypted image written to {:?}", unit.output);
        Ok(())
    }
}

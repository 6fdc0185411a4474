//! Resource tracking for a single pipeline run.
//!
//! Every OS resource a run acquires (temp dirs, loop devices, mounts, open
//! mappings, files dropped into the guest) is pushed onto a [`ResourceStack`]
//! as soon as it exists. [`ResourceStack::unwind`] releases whatever is still
//! held in reverse acquisition order, exactly once, and never fails.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Working directory holding mount points and the staging copy.
    TempDir(PathBuf),
    /// Attached loop device, e.g. `/dev/loop3`.
    Loop(PathBuf),
    /// Open LUKS mapping below `/dev/mapper/`.
    Mapping(String),
    /// Filesystem mounted at the given target.
    Mount(PathBuf),
    /// Pseudo filesystem or partition bind-mounted into the guest root.
    BindMount(PathBuf),
    /// Host file copied into the guest only for the duration of the run.
    File(PathBuf),
}

impl Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::TempDir(path) => write!(f, "temp dir {path:?}"),
            Resource::Loop(dev) => write!(f, "loop device {dev:?}"),
            Resource::Mapping(name) => write!(f, "mapping {name:?}"),
            Resource::Mount(target) => write!(f, "mount {target:?}"),
            Resource::BindMount(target) => write!(f, "bind mount {target:?}"),
            Resource::File(path) => write!(f, "file {path:?}"),
        }
    }
}

#[async_trait]
pub trait ResourceReleaser: Send + Sync {
    /// Release one resource. Must succeed when the resource is already gone.
    async fn release(&self, resource: &Resource) -> Result<()>;
}

/// Releases resources against the running system.
#[derive(Debug, Default)]
pub struct SystemReleaser;

#[async_trait]
impl ResourceReleaser for SystemReleaser {
    async fn release(&self, resource: &Resource) -> Result<()> {
        match resource {
            Resource::Mount(target) | Resource::BindMount(target) => {
                crate::fs::mount::unmount(target).await
            }
            Resource::Mapping(name) => crate::fs::luks2::close(name).await,
            Resource::Loop(dev) => crate::fs::loopdev::detach(dev).await,
            Resource::TempDir(path) => {
                let mounted = crate::fs::mount::mounted_under(path).await?;
                if !mounted.is_empty() {
                    bail!("Refusing to remove {path:?}, still mounted below it: {mounted:?}");
                }
                remove_ignoring_missing(path, true).await
            }
            Resource::File(path) => remove_ignoring_missing(path, false).await,
        }
    }
}

async fn remove_ignoring_missing(path: &Path, dir: bool) -> Result<()> {
    let res = if dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {path:?}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceId(usize);

#[derive(Debug)]
struct Entry {
    resource: Resource,
    released: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnwindSummary {
    pub released: usize,
    pub failed: usize,
}

pub struct ResourceStack {
    releaser: Arc<dyn ResourceReleaser>,
    entries: Vec<Entry>,
    unwound: bool,
}

impl Default for ResourceStack {
    fn default() -> Self {
        Self::new(Arc::new(SystemReleaser))
    }
}

impl ResourceStack {
    pub fn new(releaser: Arc<dyn ResourceReleaser>) -> Self {
        Self {
            releaser,
            entries: vec![],
            unwound: false,
        }
    }

    /// Record a freshly acquired resource.
    pub fn push(&mut self, resource: Resource) -> ResourceId {
        tracing::debug!("Acquired {resource}");
        self.entries.push(Entry {
            resource,
            released: false,
        });
        ResourceId(self.entries.len() - 1)
    }

    /// Release one resource ahead of the final unwind. Unlike the unwind, a
    /// failure here is returned to the caller and the resource stays tracked.
    pub async fn release(&mut self, id: ResourceId) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id.0)
            .with_context(|| format!("Unknown resource id {}", id.0))?;
        if entry.released {
            return Ok(());
        }

        self.releaser
            .release(&entry.resource)
            .await
            .with_context(|| format!("Failed to release {}", entry.resource))?;
        tracing::debug!("Released {}", entry.resource);
        entry.released = true;
        Ok(())
    }

    /// Resources still held, oldest first.
    pub fn held(&self) -> Vec<Resource> {
        self.entries
            .iter()
            .filter(|entry| !entry.released)
            .map(|entry| entry.resource.clone())
            .collect()
    }

    /// Release everything still held, newest first. Runs at most once; every
    /// step is attempted even if an earlier one failed.
    pub async fn unwind(&mut self) -> UnwindSummary {
        let mut summary = UnwindSummary::default();
        if self.unwound {
            tracing::trace!("Resources already unwound, nothing to do");
            return summary;
        }
        self.unwound = true;

        // mounts that failed to go away; nothing containing them may be removed
        let mut stuck: Vec<PathBuf> = vec![];
        for entry in self.entries.iter_mut().rev() {
            if entry.released {
                continue;
            }
            if let Resource::TempDir(dir) | Resource::File(dir) = &entry.resource {
                if let Some(mount) = stuck.iter().find(|mount| mount.starts_with(dir)) {
                    tracing::error!(
                        "Keeping {}, {mount:?} is still mounted below it and needs manual cleanup",
                        entry.resource
                    );
                    summary.failed += 1;
                    continue;
                }
            }
            match self.releaser.release(&entry.resource).await {
                Ok(()) => {
                    tracing::debug!("Released {}", entry.resource);
                    entry.released = true;
                    summary.released += 1;
                }
                Err(error) => {
                    tracing::warn!(?error, "Failed to release {}", entry.resource);
                    if let Resource::Mount(target) | Resource::BindMount(target) = &entry.resource {
                        stuck.push(target.clone());
                    }
                    summary.failed += 1;
                }
            }
        }

        if summary.failed != 0 {
            tracing::warn!(
                "{} resource(s) could not be released, manual cleanup may be required",
                summary.failed
            );
        }
        summary
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if self.unwound || self.entries.iter().all(|entry| entry.released) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| {
                    handle.block_on(async {
                        self.unwind().await;
                    })
                });
            }
            _ => {
                tracing::error!(
                    held = ?self.held(),
                    "Resource stack dropped without unwinding outside a multi-thread runtime"
                );
            }
        }
    }
}

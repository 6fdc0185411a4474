use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tokio::process::Command;

use super::cmd::CheckCommandOutput as _;

/// Mount `dev` on `target`, creating the target directory when missing.
pub async fn mount(dev: impl AsRef<Path>, target: impl AsRef<Path>, read_only: bool) -> Result<()> {
    let dev = dev.as_ref();
    let target = target.as_ref();

    tokio::fs::create_dir_all(target)
        .await
        .with_context(|| format!("Failed to create mount point {target:?}"))?;

    let mut cmd = Command::new("mount");
    if read_only {
        cmd.args(["-o", "ro"]);
    }
    cmd.arg(dev)
        .arg(target)
        .run()
        .await
        .with_context(|| format!("Failed to mount {dev:?} on {target:?}"))?;

    Ok(())
}

/// Bind-mount `source` on `target`. Directories and files are both accepted.
pub async fn bind_mount(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
    let source = source.as_ref();
    let target = target.as_ref();

    if tokio::fs::metadata(source).await?.is_dir() {
        tokio::fs::create_dir_all(target).await?;
    } else if !target.exists() {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, b"").await?;
    }

    Command::new("mount")
        .arg("--bind")
        .arg(source)
        .arg(target)
        .run()
        .await
        .with_context(|| format!("Failed to bind mount {source:?} on {target:?}"))?;

    Ok(())
}

/// Unmount `target`. Succeeds when nothing is mounted there; falls back to a
/// lazy unmount when the filesystem is still busy.
pub async fn unmount(target: impl AsRef<Path>) -> Result<()> {
    let target = target.as_ref();

    if !is_mounted(target).await? {
        tracing::trace!("{target:?} is not mounted, nothing to do");
        return Ok(());
    }

    let Err(error) = Command::new("umount").arg(target).run().await else {
        return Ok(());
    };

    if !is_mounted(target).await? {
        return Ok(());
    }

    tracing::warn!(?error, "Failed to unmount {target:?}, retrying with lazy unmount");
    Command::new("umount")
        .arg("--lazy")
        .arg(target)
        .run()
        .await
        .with_context(|| format!("Failed to unmount {target:?}"))?;

    Ok(())
}

pub async fn is_mounted(target: impl AsRef<Path>) -> Result<bool> {
    let target = target.as_ref();
    // a target that vanished can't be a mount point
    let target = match tokio::fs::canonicalize(target).await {
        Ok(target) => target,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("Failed to resolve {target:?}")),
    };

    Ok(mount_targets()?.contains(&target))
}

/// Mount points at or below `dir`.
pub async fn mounted_under(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let dir = match tokio::fs::canonicalize(dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).with_context(|| format!("Failed to resolve {dir:?}")),
    };

    Ok(mount_targets()?
        .into_iter()
        .filter(|target| target.starts_with(&dir))
        .collect())
}

fn mount_targets() -> Result<Vec<PathBuf>> {
    let targets = mnt::MountIter::new_from_proc()
        .context("Failed to read the mount table")?
        .filter_map(|item| item.ok())
        .map(|item| item.file)
        .collect();
    Ok(targets)
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[tokio::test]
    async fn test_missing_path_is_not_mounted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(!is_mounted(dir.path().join("nope")).await?);
        assert!(!is_mounted(dir.path()).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_proc_is_mounted() -> Result<()> {
        assert!(is_mounted("/proc").await?);
        assert!(mounted_under("/").await?.contains(&PathBuf::from("/proc")));
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_mounted_under_fresh_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("root/proc"))?;
        assert!(mounted_under(dir.path()).await?.is_empty());
        assert!(mounted_under(dir.path().join("gone")).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unmount_of_unmounted_dir_is_ok() -> Result<()> {
        let dir = tempfile::tempdir()?;
        unmount(dir.path()).await?;
        Ok(())
    }
}

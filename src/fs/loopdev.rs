use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use again::RetryPolicy;
use anyhow::{bail, Context as _, Result};
use loopdev::{LoopControl, LoopDevice};
use tokio::process::Command;

use super::cmd::CheckCommandOutput as _;

/// How long to wait for udev to create partition nodes before asking the
/// kernel to re-read the partition table.
const SETTLE_POLLS: u32 = 10;
const SETTLE_INTERVAL: Duration = Duration::from_millis(200);
const REREAD_DELAY: Duration = Duration::from_secs(1);

/// An image file attached as a partitioned block device.
///
/// The attachment does not detach itself: the owner registers the device on
/// its [`crate::cleanup::ResourceStack`] right after [`LoopAttachment::attach`]
/// returns.
#[derive(Debug)]
pub struct LoopAttachment {
    device: PathBuf,
}

impl LoopAttachment {
    pub async fn attach(image: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let image = image.as_ref();
        if !image.exists() {
            bail!("Disk image {image:?} does not exist");
        }

        let lc = LoopControl::open()
            .context("Failed to open loop control, maybe forgot to run 'sudo modprobe loop'?")?;
        // Concurrent workers race for the same free device, so retry
        let ld = RetryPolicy::exponential(Duration::from_millis(1))
            .with_max_retries(200)
            .with_max_delay(Duration::from_millis(1000))
            .retry(|| async {
                let ld = lc.next_free()?;
                ld.with()
                    .part_scan(true)
                    .read_only(read_only)
                    .attach(image)?;
                Ok::<_, anyhow::Error>(ld)
            })
            .await
            .with_context(|| format!("Failed to attach {image:?} to a loop device"))?;

        let device = ld.path().context("Unknown loop device path")?;
        tracing::debug!("Attached {image:?} to {device:?}");

        Ok(Self { device })
    }

    pub fn path(&self) -> &Path {
        &self.device
    }

    /// Resolve the device node of partition `index` (1-based).
    pub async fn partition(&self, index: u32) -> Result<PathBuf> {
        resolve_partition(&self.device, index).await
    }
}

/// Both naming schemes in use for partitions of a whole-disk node.
pub fn partition_candidates(device: &Path, index: u32) -> [PathBuf; 2] {
    let device = device.to_string_lossy();
    [
        PathBuf::from(format!("{device}p{index}")),
        PathBuf::from(format!("{device}{index}")),
    ]
}

fn find_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|path| path.exists()).cloned()
}

pub async fn resolve_partition(device: &Path, index: u32) -> Result<PathBuf> {
    let candidates = partition_candidates(device, index);

    for _ in 0..SETTLE_POLLS {
        if let Some(found) = find_existing(&candidates) {
            return Ok(found);
        }
        tokio::time::sleep(SETTLE_INTERVAL).await;
    }

    tracing::debug!("Partition {index} of {device:?} did not show up, re-reading partition table");
    if let Err(error) = reread_partition_table(device).await {
        tracing::debug!(?error, "Failed to re-read partition table of {device:?}");
    }
    tokio::time::sleep(REREAD_DELAY).await;

    match find_existing(&candidates) {
        Some(found) => Ok(found),
        None => bail!(
            "partition {index} not found on {device:?} (looked for {:?} and {:?})",
            candidates[0],
            candidates[1]
        ),
    }
}

async fn reread_partition_table(device: &Path) -> Result<()> {
    if which::which("partprobe").is_ok() {
        Command::new("partprobe").arg(device).run().await?;
    } else {
        Command::new("blockdev")
            .arg("--rereadpt")
            .arg(device)
            .run()
            .await?;
    }
    Ok(())
}

/// Whether `device` currently has a backing file.
pub fn is_attached(device: &Path) -> bool {
    let Some(name) = device.file_name() else {
        return false;
    };
    Path::new("/sys/block")
        .join(name)
        .join("loop/backing_file")
        .exists()
}

/// Detach a loop device. Detaching a device that is already free succeeds.
pub async fn detach(device: &Path) -> Result<()> {
    if !is_attached(device) {
        tracing::trace!("{device:?} is not attached, nothing to do");
        return Ok(());
    }

    let device = device.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let ld = match LoopDevice::open(&device) {
            Ok(ld) => ld,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open loop device {device:?}"))
            }
        };
        match ld.detach() {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to detach loop device {device:?}")),
        }
    })
    .await
    .context("background task failed")?
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    fn test_partition_candidates() {
        let [a, b] = partition_candidates(Path::new("/dev/loop12"), 2);
        assert_eq!(a, PathBuf::from("/dev/loop12p2"));
        assert_eq!(b, PathBuf::from("/dev/loop12p2".replace("p2", "2")));
    }

    #[test]
    fn test_find_existing_prefers_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first = dir.path().join("loop0p1");
        let second = dir.path().join("loop01");
        std::fs::write(&second, b"")?;
        assert_eq!(find_existing(&[first.clone(), second.clone()]), Some(second.clone()));
        std::fs::write(&first, b"")?;
        assert_eq!(find_existing(&[first.clone(), second]), Some(first));
        Ok(())
    }

    #[tokio::test]
    async fn test_detach_unattached_is_ok() -> Result<()> {
        detach(Path::new("/dev/loop-that-does-not-exist")).await?;
        Ok(())
    }

    #[test]
    fn test_missing_device_is_not_attached() {
        assert!(!is_attached(Path::new("/dev/loop-that-does-not-exist")));
    }
}

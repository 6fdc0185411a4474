use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{fs::cmd::CheckCommandOutput as _, types::MakeFsType};

pub const ROOT_LABEL: &str = "rootfs";

impl MakeFsType {
    pub fn mkfs_tool(&self) -> &'static str {
        match self {
            MakeFsType::Ext4 => "mkfs.ext4",
            MakeFsType::Xfs => "mkfs.xfs",
            MakeFsType::Btrfs => "mkfs.btrfs",
        }
    }

    fn force_flag(&self) -> &'static str {
        match self {
            MakeFsType::Ext4 => "-F",
            MakeFsType::Xfs | MakeFsType::Btrfs => "-f",
        }
    }

    /// Create a filesystem on `device_path`, overwriting whatever is there.
    pub async fn mkfs(&self, device_path: impl AsRef<Path>, label: &str) -> Result<()> {
        let device_path = device_path.as_ref();
        tracing::info!("Creating {self} filesystem on {device_path:?}");

        Command::new(self.mkfs_tool())
            .arg(self.force_flag())
            .arg("-L")
            .arg(label)
            .arg(device_path)
            .run()
            .await
            .with_context(|| format!("Failed to create {self} filesystem on {device_path:?}"))?;
        Ok(())
    }
}

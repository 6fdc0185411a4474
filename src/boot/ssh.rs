//! Remote unlock over SSH from the initramfs (dropbear).

use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};

use crate::{
    boot::{agent::in_root, edit_cmdline, initramfs},
    guest::GuestExec,
};

pub const PACKAGE: &str = "dropbear-initramfs";

/// Current dropbear-initramfs reads keys from `/etc/dropbear/initramfs`,
/// older releases from `/etc/dropbear-initramfs`.
pub fn authorized_keys_path(root: &Path) -> PathBuf {
    let legacy = in_root(root, "/etc/dropbear-initramfs");
    if legacy.is_dir() && !in_root(root, "/etc/dropbear/initramfs").is_dir() {
        legacy.join("authorized_keys")
    } else {
        in_root(root, "/etc/dropbear/initramfs/authorized_keys")
    }
}

pub async fn enable(guest: &dyn GuestExec, authorized_keys: &Path, cmdline: &Path) -> Result<()> {
    initramfs::install_packages(guest, &[PACKAGE]).await?;
    initramfs::verify_packages(guest, &[PACKAGE]).await?;

    let dest = authorized_keys_path(guest.root());
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(authorized_keys, &dest)
        .await
        .with_context(|| format!("Failed to copy {authorized_keys:?} to {dest:?}"))?;
    tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o600)).await?;

    edit_cmdline(cmdline, |cmdline| {
        if !cmdline.contains("ip") {
            cmdline.set("ip", "dhcp");
        }
    })
    .await?;

    tracing::info!("SSH unlock enabled with keys from {authorized_keys:?}");
    Ok(())
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::guest::tests::RecordingGuest;

    #[tokio::test]
    async fn test_enable_ssh() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root)?;
        let keys = dir.path().join("authorized_keys");
        std::fs::write(&keys, "ssh-ed25519 AAAA test@host\n")?;
        let cmdline = dir.path().join("cmdline.txt");
        std::fs::write(&cmdline, "root=/dev/mapper/cryptroot rootwait\n")?;

        let guest = RecordingGuest {
            root: root.clone(),
            outputs: vec![("dpkg".into(), b"Status: install ok installed\n".to_vec())],
            ..Default::default()
        };
        enable(&guest, &keys, &cmdline).await?;

        let dest = root.join("etc/dropbear/initramfs/authorized_keys");
        assert_eq!(std::fs::read_to_string(&dest)?, "ssh-ed25519 AAAA test@host\n");
        assert_eq!(std::fs::metadata(&dest)?.permissions().mode() & 0o777, 0o600);
        assert_eq!(
            std::fs::read_to_string(&cmdline)?,
            "root=/dev/mapper/cryptroot rootwait ip=dhcp\n"
        );
        Ok(())
    }
}

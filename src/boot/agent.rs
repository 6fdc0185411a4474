//! The unlock agent run by cryptsetup in the initramfs as a `keyscript`.

use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};

/// Absolute path of the agent inside the target root and initramfs.
pub const AGENT_PATH: &str = "/usr/lib/imgcrypt/unlock-key";

/// Directory inside the initramfs holding embedded keys.
pub const EMBEDDED_KEY_DIR: &str = "/etc/luks-keys";

/// Prints the key named by its argument (the crypttab key field) or by
/// `cryptkey=` on the kernel command line. Looks in the initramfs first,
/// then on every partition it can mount, and finally asks for a passphrase.
pub const AGENT_SCRIPT: &str = r#"#!/bin/sh
# Installed by imgcrypt. Writes the LUKS key for the root device to stdout.

KEY_NAME="$1"
if [ -z "$KEY_NAME" ] || [ "$KEY_NAME" = "none" ]; then
    KEY_NAME=""
    for arg in $(cat /proc/cmdline); do
        case "$arg" in
            cryptkey=*) KEY_NAME="${arg#cryptkey=}" ;;
        esac
    done
fi

if [ -n "$KEY_NAME" ]; then
    if [ -r "/etc/luks-keys/$KEY_NAME" ]; then
        cat "/etc/luks-keys/$KEY_NAME"
        exit 0
    fi

    MNT=/run/imgcrypt-key
    mkdir -p "$MNT"
    for attempt in 1 2 3 4 5 6 7 8 9 10; do
        for dev in /dev/sd?* /dev/mmcblk?p* /dev/nvme?n?p* /dev/vd?*; do
            [ -b "$dev" ] || continue
            if mount -o ro "$dev" "$MNT" 2>/dev/null; then
                for candidate in "$MNT/$KEY_NAME" "$MNT/luks-keys/$KEY_NAME"; do
                    if [ -r "$candidate" ]; then
                        cat "$candidate"
                        umount "$MNT"
                        exit 0
                    fi
                done
                umount "$MNT"
            fi
        done
        echo "imgcrypt: waiting for key $KEY_NAME ($attempt/10)" >&2
        sleep 1
    done
fi

if [ -x /lib/cryptsetup/askpass ]; then
    exec /lib/cryptsetup/askpass "Please unlock ${CRYPTTAB_NAME:-root}: "
fi

echo "imgcrypt: no key found for ${CRYPTTAB_NAME:-root}" >&2
exit 1
"#;

/// Path of `absolute` below `root`.
pub fn in_root(root: &Path, absolute: &str) -> PathBuf {
    root.join(absolute.trim_start_matches('/'))
}

/// Install the agent into the root filesystem mounted at `root`.
pub async fn install(root: &Path) -> Result<PathBuf> {
    let path = in_root(root, AGENT_PATH);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {parent:?}"))?;
    }
    tokio::fs::write(&path, AGENT_SCRIPT)
        .await
        .with_context(|| format!("Failed to write unlock agent to {path:?}"))?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;

    tracing::debug!("Installed unlock agent at {path:?}");
    Ok(path)
}

#[cfg(test)]
pub mod tests {

    use tokio::process::Command;

    use super::*;
    use crate::fs::cmd::CheckCommandOutput as _;

    #[tokio::test]
    async fn test_install_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = install(dir.path()).await?;
        assert_eq!(path, dir.path().join("usr/lib/imgcrypt/unlock-key"));
        assert_eq!(
            std::fs::metadata(&path)?.permissions().mode() & 0o777,
            0o755
        );
        assert!(std::fs::read_to_string(&path)?.starts_with("#!/bin/sh\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_agent_is_valid_sh() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = install(dir.path()).await?;
        Command::new("sh").arg("-n").arg(&path).run().await?;
        Ok(())
    }

    #[test]
    fn test_in_root() {
        assert_eq!(
            in_root(Path::new("/tmp/r"), "/etc/crypttab"),
            PathBuf::from("/tmp/r/etc/crypttab")
        );
    }
}

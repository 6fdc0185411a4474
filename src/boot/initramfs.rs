//! initramfs-tools provisioning for general purpose images.

use std::{
    cmp::Ordering,
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};

use crate::{
    boot::agent::{in_root, AGENT_PATH, EMBEDDED_KEY_DIR},
    guest::{resolve_in_root, GuestExec},
    types::{CryptoAlgorithm, UnlockPolicy},
};

pub const HOOK_PATH: &str = "/etc/initramfs-tools/hooks/imgcrypt";
pub const MODULES_PATH: &str = "/etc/initramfs-tools/modules";
pub const CONF_HOOK_PATH: &str = "/etc/cryptsetup-initramfs/conf-hook";
pub const REQUIRED_PACKAGES: [&str; 2] = ["cryptsetup", "cryptsetup-initramfs"];

/// Modules needed to read a key from removable media.
const REMOVABLE_MEDIA_MODULES: [&str; 5] =
    ["usb_storage", "uas", "vfat", "nls_cp437", "nls_iso8859_1"];

pub async fn install_packages(guest: &dyn GuestExec, packages: &[&str]) -> Result<()> {
    tracing::info!("Installing {packages:?} inside the image");
    guest.run(&["apt-get", "update"]).await?;

    let mut argv = vec!["apt-get", "install", "-y", "--no-install-recommends"];
    argv.extend_from_slice(packages);
    guest.run(&argv).await?;
    Ok(())
}

/// Fail unless every package in `packages` is installed in the guest.
pub async fn verify_packages(guest: &dyn GuestExec, packages: &[&str]) -> Result<()> {
    let mut missing = vec![];
    for package in packages {
        let installed = match guest.run(&["dpkg", "-s", package]).await {
            Ok(status) => is_installed(&String::from_utf8_lossy(&status)),
            Err(error) => {
                tracing::debug!(?error, "dpkg -s {package} failed");
                false
            }
        };
        if !installed {
            missing.push(*package);
        }
    }
    if !missing.is_empty() {
        bail!("Required packages are not installed in the image: {missing:?}");
    }
    Ok(())
}

fn is_installed(dpkg_status: &str) -> bool {
    dpkg_status
        .lines()
        .filter_map(|line| line.strip_prefix("Status:"))
        .any(|status| status.trim() == "install ok installed")
}

pub fn hook_script(policy: UnlockPolicy) -> String {
    let mut script = format!(
        r#"#!/bin/sh
# Installed by imgcrypt. Copies the unlock agent into the initramfs.
PREREQ="cryptroot"
prereqs()
{{
    echo "$PREREQ"
}}
case "$1" in
    prereqs)
        prereqs
        exit 0
        ;;
esac

. /usr/share/initramfs-tools/hook-functions

copy_exec {AGENT_PATH}
copy_exec /bin/mount
copy_exec /bin/umount
"#
    );
    if policy == UnlockPolicy::LocalKeyfile {
        script.push_str(&format!(
            r#"
mkdir -p "${{DESTDIR}}{EMBEDDED_KEY_DIR}"
cp -a {EMBEDDED_KEY_DIR}/. "${{DESTDIR}}{EMBEDDED_KEY_DIR}/"
chmod 0700 "${{DESTDIR}}{EMBEDDED_KEY_DIR}"
chmod 0400 "${{DESTDIR}}{EMBEDDED_KEY_DIR}"/*
"#
        ));
    }
    script.push_str("\nexit 0\n");
    script
}

pub async fn write_hook(root: &Path, policy: UnlockPolicy) -> Result<()> {
    let path = in_root(root, HOOK_PATH);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, hook_script(policy))
        .await
        .with_context(|| format!("Failed to write initramfs hook {path:?}"))?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

pub fn required_modules(crypto: CryptoAlgorithm, policy: UnlockPolicy) -> Vec<&'static str> {
    let mut modules = crypto.initramfs_modules().to_vec();
    if policy == UnlockPolicy::UsbRequired {
        modules.extend_from_slice(&REMOVABLE_MEDIA_MODULES);
    }
    modules
}

/// Append `modules` that are not listed yet.
pub fn append_modules(content: &str, modules: &[&str]) -> String {
    let present: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .collect();

    let mut out = content.to_owned();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for module in modules {
        if !present.contains(module) {
            out.push_str(module);
            out.push('\n');
        }
    }
    out
}

/// Force `CRYPTSETUP=y` in cryptsetup-initramfs' conf-hook.
pub fn enable_cryptsetup(content: &str) -> String {
    let mut found = false;
    let mut lines: Vec<String> = content
        .lines()
        .filter_map(|line| {
            let setting = line.trim_start().trim_start_matches('#').trim_start();
            if setting.starts_with("CRYPTSETUP=") {
                if found {
                    return None;
                }
                found = true;
                Some("CRYPTSETUP=y".to_owned())
            } else {
                Some(line.to_owned())
            }
        })
        .collect();
    if !found {
        lines.push("CRYPTSETUP=y".to_owned());
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

async fn rewrite_file(path: &Path, f: impl FnOnce(&str) -> String) -> Result<()> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {path:?}")),
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, f(&content))
        .await
        .with_context(|| format!("Failed to write {path:?}"))
}

pub async fn configure(root: &Path, crypto: CryptoAlgorithm, policy: UnlockPolicy) -> Result<()> {
    write_hook(root, policy).await?;

    let modules = required_modules(crypto, policy);
    rewrite_file(&in_root(root, MODULES_PATH), |content| {
        append_modules(content, &modules)
    })
    .await?;
    rewrite_file(&in_root(root, CONF_HOOK_PATH), enable_cryptsetup).await?;
    Ok(())
}

/// Compare version strings by their numeric and textual runs.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn runs(s: &str) -> Vec<(bool, &str)> {
        let mut runs = vec![];
        let mut start = 0;
        let bytes = s.as_bytes();
        for i in 1..=bytes.len() {
            if i == bytes.len() || bytes[i].is_ascii_digit() != bytes[start].is_ascii_digit() {
                runs.push((bytes[start].is_ascii_digit(), &s[start..i]));
                start = i;
            }
        }
        runs
    }

    let (ra, rb) = (runs(a), runs(b));
    for ((da, sa), (db, sb)) in ra.iter().zip(rb.iter()) {
        let ord = match (*da, *db) {
            (true, true) => {
                let (na, nb) = (sa.trim_start_matches('0'), sb.trim_start_matches('0'));
                na.len().cmp(&nb.len()).then_with(|| na.cmp(nb))
            }
            _ => sa.cmp(sb),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ra.len().cmp(&rb.len())
}

/// Installed kernels, oldest first.
pub async fn kernel_versions(root: &Path) -> Result<Vec<String>> {
    let modules = resolve_in_root(root, "/lib/modules")?;
    let mut entries = match tokio::fs::read_dir(&modules).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {modules:?}")),
    };

    let mut versions = vec![];
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            versions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    versions.sort_by(|a, b| compare_versions(a, b));
    Ok(versions)
}

pub fn artifact_candidates(version: &str) -> [String; 3] {
    [
        format!("/boot/initrd.img-{version}"),
        format!("/boot/firmware/initrd.img-{version}"),
        format!("/boot/initramfs-{version}"),
    ]
}

/// Host path of the initramfs built for `version`, if any.
pub fn locate_artifact(root: &Path, version: &str) -> Option<PathBuf> {
    artifact_candidates(version)
        .iter()
        .map(|candidate| in_root(root, candidate))
        .find(|path| path.is_file())
}

pub async fn regenerate(guest: &dyn GuestExec, versions: &[String]) -> Result<()> {
    for version in versions {
        let mode = if locate_artifact(guest.root(), version).is_some() {
            "-u"
        } else {
            "-c"
        };
        tracing::info!("Building initramfs for kernel {version}");
        guest
            .run(&["update-initramfs", mode, "-k", version])
            .await
            .with_context(|| format!("Failed to build initramfs for kernel {version}"))?;
    }
    Ok(())
}

/// Make sure the initramfs of every kernel sits on the boot partition
/// mounted at `boot`. Returns the file name for the newest kernel.
pub async fn publish(root: &Path, boot: &Path, versions: &[String]) -> Result<String> {
    let Some(newest) = versions.last() else {
        bail!("No kernel found below /lib/modules in the image");
    };

    let mut newest_name = None;
    for version in versions {
        let Some(artifact) = locate_artifact(root, version) else {
            if version == newest {
                bail!("No initramfs artifact found for kernel {version}");
            }
            tracing::warn!("No initramfs artifact found for kernel {version}");
            continue;
        };
        let name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("Bad artifact path {artifact:?}"))?;

        let on_boot = boot.join(&name);
        if !on_boot.exists() || !same_content(&artifact, &on_boot).await? {
            tokio::fs::copy(&artifact, &on_boot)
                .await
                .with_context(|| format!("Failed to copy {artifact:?} to {on_boot:?}"))?;
            tracing::debug!("Copied {artifact:?} to the boot partition");
        }

        if version == newest {
            newest_name = Some(name);
        }
    }

    newest_name.with_context(|| format!("No initramfs artifact found for kernel {newest}"))
}

async fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let (ma, mb) = (tokio::fs::metadata(a).await?, tokio::fs::metadata(b).await?);
    if ma.len() != mb.len() {
        return Ok(false);
    }
    Ok(tokio::fs::read(a).await? == tokio::fs::read(b).await?)
}

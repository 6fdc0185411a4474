//! Running commands as if native to the target root filesystem.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use object::{Architecture, Object as _};
use tokio::process::Command;

use crate::{
    boot::agent::in_root,
    cleanup::{Resource, ResourceStack},
    fs::{cmd::CheckCommandOutput as _, mount},
};

const GUEST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const MAX_SYMLINK_HOPS: usize = 40;

#[async_trait]
pub trait GuestExec: Send + Sync {
    /// Run `argv` inside the guest and return its stdout.
    async fn run(&self, argv: &[&str]) -> Result<Vec<u8>>;

    /// Host path of the guest's root directory.
    fn root(&self) -> &Path;
}

/// A chroot into a mounted root filesystem, with the host's pseudo
/// filesystems and the boot partition bound into it.
#[derive(Debug)]
pub struct ChrootContext {
    root: PathBuf,
}

impl ChrootContext {
    /// Prepare `root` for chroot. Everything set up here is pushed onto
    /// `stack` and goes away when the run unwinds.
    pub async fn enter(root: &Path, boot: &Path, stack: &mut ResourceStack) -> Result<Self> {
        for pseudo in ["/dev", "/dev/pts", "/proc", "/sys", "/run"] {
            let target = in_root(root, pseudo);
            mount::bind_mount(pseudo, &target).await?;
            stack.push(Resource::BindMount(target));
        }

        let boot_target = boot_mount_point(root);
        mount::bind_mount(boot, &boot_target).await?;
        stack.push(Resource::BindMount(boot_target));

        install_emulator(root, stack).await?;
        provide_resolv_conf(root, stack).await?;

        Ok(Self {
            root: root.to_path_buf(),
        })
    }
}

#[async_trait]
impl GuestExec for ChrootContext {
    async fn run(&self, argv: &[&str]) -> Result<Vec<u8>> {
        Command::new("chroot")
            .arg(&self.root)
            .args(argv)
            .env("PATH", GUEST_PATH)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .run()
            .await
            .with_context(|| format!("Failed to run {argv:?} inside {:?}", self.root))
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// Newer images mount the boot partition at `/boot/firmware`.
pub fn boot_mount_point(root: &Path) -> PathBuf {
    let firmware = in_root(root, "/boot/firmware");
    if firmware.is_dir() {
        firmware
    } else {
        in_root(root, "/boot")
    }
}

/// Follow `path` inside `root`, treating absolute symlink targets as relative
/// to `root` rather than to the host.
pub fn resolve_in_root(root: &Path, path: &str) -> Result<PathBuf> {
    let mut pending: Vec<String> = path
        .split('/')
        .filter(|c| !c.is_empty())
        .rev()
        .map(str::to_owned)
        .collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(component) = pending.pop() {
        match component.as_str() {
            "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }

        let candidate = root.join(&resolved).join(&component);
        let is_symlink = std::fs::symlink_metadata(&candidate)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            resolved.push(&component);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            bail!("Too many levels of symbolic links resolving {path} in {root:?}");
        }
        let target = std::fs::read_link(&candidate)
            .with_context(|| format!("Failed to read link {candidate:?}"))?;
        if target.is_absolute() {
            resolved = PathBuf::new();
        }
        for c in target.components().rev() {
            if let Component::Normal(c) = c {
                pending.push(c.to_string_lossy().into_owned());
            } else if c == Component::ParentDir {
                pending.push("..".to_owned());
            }
        }
    }

    Ok(root.join(resolved))
}

/// qemu user-mode name of an ELF architecture.
fn qemu_arch(arch: Architecture) -> Option<&'static str> {
    match arch {
        Architecture::Aarch64 => Some("aarch64"),
        Architecture::Arm => Some("arm"),
        Architecture::X86_64 => Some("x86_64"),
        Architecture::I386 => Some("i386"),
        Architecture::Riscv64 => Some("riscv64"),
        _ => None,
    }
}

fn host_qemu_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86" => "i386",
        arch => arch,
    }
}

/// Architecture of the guest's `/bin/sh`, as a qemu name.
pub fn guest_arch(root: &Path) -> Result<&'static str> {
    let shell = resolve_in_root(root, "/bin/sh")?;
    let data = std::fs::read(&shell).with_context(|| format!("Failed to read {shell:?}"))?;
    let file = object::File::parse(&*data)
        .with_context(|| format!("{shell:?} is not a recognized executable"))?;
    qemu_arch(file.architecture())
        .with_context(|| format!("Unsupported guest architecture {:?}", file.architecture()))
}

async fn install_emulator(root: &Path, stack: &mut ResourceStack) -> Result<()> {
    let arch = guest_arch(root)?;
    if arch == host_qemu_arch() {
        tracing::debug!("Guest architecture {arch} matches host, no emulation needed");
        return Ok(());
    }

    let name = format!("qemu-{arch}-static");
    let host = which::which(&name).with_context(|| {
        format!("Guest is {arch} but the host is {}, install {name}", host_qemu_arch())
    })?;
    let dest = in_root(root, &format!("/usr/bin/{name}"));
    if dest.exists() {
        tracing::debug!("{dest:?} already present in guest");
        return Ok(());
    }

    tokio::fs::copy(&host, &dest)
        .await
        .with_context(|| format!("Failed to copy {host:?} to {dest:?}"))?;
    stack.push(Resource::File(dest));
    tracing::info!("Using {name} to run {arch} guest commands");
    Ok(())
}

async fn provide_resolv_conf(root: &Path, stack: &mut ResourceStack) -> Result<()> {
    let host = Path::new("/etc/resolv.conf");
    if !host.exists() {
        return Ok(());
    }

    let guest = in_root(root, "/etc/resolv.conf");
    match tokio::fs::symlink_metadata(&guest).await {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            // usually points into /run, which is bound from the host
            tracing::debug!("Guest resolv.conf is a symlink, leaving it alone");
        }
        Ok(_) => {
            mount::bind_mount(host, &guest).await?;
            stack.push(Resource::BindMount(guest));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::copy(host, &guest)
                .await
                .with_context(|| format!("Failed to copy resolv.conf to {guest:?}"))?;
            stack.push(Resource::File(guest));
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {guest:?}")),
    }
    Ok(())
}

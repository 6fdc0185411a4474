//! Rewrites the boot chain of an image so it unlocks its encrypted root.

pub mod agent;
pub mod cmdline;
pub mod crypttab;
pub mod firmware;
pub mod fstab;
pub mod initramfs;
pub mod ssh;

use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};

use crate::{
    cleanup::ResourceStack,
    config::Settings,
    guest::{ChrootContext, GuestExec},
    keyfile::Keyfile,
    types::{Distro, UnlockPolicy},
};

use self::{agent::in_root, cmdline::KernelCmdline, crypttab::CrypttabEntry};

pub const ORIG_SUFFIX: &str = "orig";

/// What the rewriter works on: both partitions mounted on the host.
pub struct BootTarget<'a> {
    /// The new encrypted root filesystem.
    pub root: &'a Path,
    /// The boot partition.
    pub boot: &'a Path,
    /// PARTUUID of the root partition, when the partition table has one.
    pub partuuid: Option<&'a str>,
    pub keyfile: &'a Keyfile,
    pub settings: &'a Settings,
}

impl BootTarget<'_> {
    /// How the target system refers to the encrypted partition.
    pub fn source_device(&self) -> String {
        match self.partuuid {
            Some(partuuid) => format!("PARTUUID={partuuid}"),
            None => self.settings.target_root_device.clone(),
        }
    }

    pub fn mapper_device(&self) -> String {
        format!("/dev/mapper/{}", self.settings.mapper)
    }
}

/// Keep a pristine copy of `path` as `<path>.orig`. An existing copy is never
/// overwritten so repeated runs keep the very first original.
pub async fn backup_original(path: &Path) -> Result<()> {
    let Some(name) = path.file_name() else {
        bail!("Cannot back up {path:?}");
    };
    let backup = path.with_file_name(format!("{}.{ORIG_SUFFIX}", name.to_string_lossy()));
    if tokio::fs::try_exists(&backup).await? || !tokio::fs::try_exists(path).await? {
        return Ok(());
    }
    tokio::fs::copy(path, &backup)
        .await
        .with_context(|| format!("Failed to back up {path:?}"))?;
    Ok(())
}

/// Back up, load, modify and write back a text file.
async fn edit_text(path: &Path, f: impl FnOnce(&str) -> String) -> Result<()> {
    backup_original(path).await?;
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

pub fn locate_cmdline(boot: &Path) -> Result<PathBuf> {
    [boot.join("cmdline.txt"), boot.join("firmware/cmdline.txt")]
        .into_iter()
        .find(|path| path.is_file())
        .with_context(|| format!("No cmdline.txt found on the boot partition {boot:?}"))
}

pub async fn edit_cmdline(path: &Path, f: impl FnOnce(&mut KernelCmdline)) -> Result<()> {
    edit_text(path, |content| {
        let mut cmdline = KernelCmdline::parse(content);
        f(&mut cmdline);
        format!("{cmdline}\n")
    })
    .await
}

/// Command line changes for booting from the encrypted root.
pub fn patch_root_cmdline(cmdline: &mut KernelCmdline, target: &BootTarget<'_>) {
    let mapper = &target.settings.mapper;
    cmdline.set("root", target.mapper_device());
    cmdline.set("rootfstype", target.settings.makefs.to_string());
    cmdline.set(
        "cryptdevice",
        format!("{}:{mapper}", target.source_device()),
    );
    cmdline.set("luks.crypttab", "no");
    match target.settings.unlock_policy {
        UnlockPolicy::LocalKeyfile => cmdline.set("cryptkey", target.keyfile.basename()),
        UnlockPolicy::UsbRequired => cmdline.remove("cryptkey"),
    }
}

/// Copy the keyfile to `dir` readable by root only.
async fn place_key(keyfile: &Keyfile, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    let dest = dir.join(keyfile.basename());
    tokio::fs::copy(keyfile.path(), &dest)
        .await
        .with_context(|| format!("Failed to copy keyfile to {dest:?}"))?;
    tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o400)).await?;
    Ok(dest)
}

/// Changes shared by every distro: command line, fstab, crypttab, the
/// unlock agent and, for local keys, the embedded key.
pub async fn rewrite_common(target: &BootTarget<'_>) -> Result<PathBuf> {
    let cmdline_path = locate_cmdline(target.boot)?;
    edit_cmdline(&cmdline_path, |cmdline| patch_root_cmdline(cmdline, target)).await?;

    let mapper_device = target.mapper_device();
    edit_text(&in_root(target.root, "/etc/fstab"), |content| {
        fstab::rewrite_root_entry(content, &mapper_device, target.settings.makefs)
    })
    .await?;

    let entry = CrypttabEntry::root(
        &target.settings.mapper,
        &target.source_device(),
        &target.keyfile.basename(),
        agent::AGENT_PATH,
    );
    edit_text(&in_root(target.root, "/etc/crypttab"), |content| {
        crypttab::upsert(content, &entry)
    })
    .await?;

    agent::install(target.root).await?;

    if target.settings.unlock_policy == UnlockPolicy::LocalKeyfile {
        let dir = match target.settings.distro {
            Distro::Embedded => target.boot.join("luks-keys"),
            Distro::Raspios => in_root(target.root, agent::EMBEDDED_KEY_DIR),
        };
        let placed = place_key(target.keyfile, &dir).await?;
        tracing::info!("Embedded keyfile at {placed:?}");
    }

    Ok(cmdline_path)
}

/// Install cryptsetup into the image and rebuild its initramfs.
pub async fn provision_initramfs(
    guest: &dyn GuestExec,
    target: &BootTarget<'_>,
    cmdline_path: &Path,
) -> Result<()> {
    initramfs::install_packages(guest, &initramfs::REQUIRED_PACKAGES).await?;
    initramfs::verify_packages(guest, &initramfs::REQUIRED_PACKAGES).await?;

    if let Some(ssh) = &target.settings.ssh {
        if let Err(error) = ssh::enable(guest, &ssh.authorized_keys, cmdline_path).await {
            tracing::warn!(?error, "Failed to set up SSH unlock, continuing without it");
        }
    }

    initramfs::configure(
        target.root,
        target.settings.crypto,
        target.settings.unlock_policy,
    )
    .await?;

    let versions = initramfs::kernel_versions(target.root).await?;
    initramfs::regenerate(guest, &versions).await?;
    let artifact = initramfs::publish(target.root, target.boot, &versions).await?;

    edit_text(&target.boot.join("config.txt"), |content| {
        firmware::set_initramfs(content, &artifact)
    })
    .await?;
    tracing::info!("Boot firmware loads initramfs {artifact}");
    Ok(())
}

pub async fn rewrite(target: &BootTarget<'_>, stack: &mut ResourceStack) -> Result<()> {
    let cmdline_path = rewrite_common(target).await?;

    if target.settings.distro == Distro::Raspios {
        let guest = ChrootContext::enter(target.root, target.boot, stack).await?;
        provision_initramfs(&guest, target, &cmdline_path).await?;
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::{
        cli::EncryptOptions,
        config::{ImageConfig, Settings, SshSettings},
        guest::tests::RecordingGuest,
        keyfile::KeyfileGenerator,
        types::MakeFsType,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        boot: PathBuf,
        keyfile: Keyfile,
    }

    async fn fixture() -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("root");
        let boot = dir.path().join("boot");
        std::fs::create_dir_all(root.join("etc"))?;
        std::fs::create_dir_all(&boot)?;
        std::fs::write(
            boot.join("cmdline.txt"),
            "console=serial0,115200 console=tty1 root=PARTUUID=6c586e13-02 rootfstype=ext4 fsck.repair=yes rootwait\n",
        )?;
        std::fs::write(
            root.join("etc/fstab"),
            "proc /proc proc defaults 0 0\nPARTUUID=6c586e13-01 /boot/firmware vfat defaults 0 2\nPARTUUID=6c586e13-02 / ext4 defaults,noatime 0 1\n",
        )?;
        let keyfile = KeyfileGenerator::new(dir.path().join("keys")).generate().await?;
        Ok(Fixture {
            root,
            boot,
            keyfile,
            _dir: dir,
        })
    }

    fn settings(distro: Distro, policy: UnlockPolicy) -> Settings {
        let mut settings = Settings::resolve(ImageConfig::default(), &EncryptOptions::default());
        settings.distro = distro;
        settings.unlock_policy = policy;
        settings
    }

    #[tokio::test]
    async fn test_rewrite_common_usb_required() -> Result<()> {
        let f = fixture().await?;
        let settings = settings(Distro::Embedded, UnlockPolicy::UsbRequired);
        let target = BootTarget {
            root: &f.root,
            boot: &f.boot,
            partuuid: Some("6c586e13-02"),
            keyfile: &f.keyfile,
            settings: &settings,
        };
        rewrite_common(&target).await?;

        assert_eq!(
            std::fs::read_to_string(f.boot.join("cmdline.txt"))?,
            "console=serial0,115200 console=tty1 root=/dev/mapper/cryptroot rootfstype=ext4 \
             fsck.repair=yes rootwait cryptdevice=PARTUUID=6c586e13-02:cryptroot luks.crypttab=no\n"
        );
        assert!(f.boot.join("cmdline.txt.orig").exists());
        assert!(f.root.join("etc/fstab.orig").exists());

        let fstab = std::fs::read_to_string(f.root.join("etc/fstab"))?;
        assert!(fstab.contains("/dev/mapper/cryptroot  /  ext4"));

        let crypttab = std::fs::read_to_string(f.root.join("etc/crypttab"))?;
        assert_eq!(
            crypttab,
            format!(
                "cryptroot PARTUUID=6c586e13-02 {} luks,discard,initramfs,keyscript=/usr/lib/imgcrypt/unlock-key\n",
                f.keyfile.basename()
            )
        );
        assert!(f.root.join("usr/lib/imgcrypt/unlock-key").exists());
        assert!(!f.boot.join("luks-keys").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_rewrite_common_local_keyfile_embedded() -> Result<()> {
        let f = fixture().await?;
        let settings = settings(Distro::Embedded, UnlockPolicy::LocalKeyfile);
        let target = BootTarget {
            root: &f.root,
            boot: &f.boot,
            partuuid: None,
            keyfile: &f.keyfile,
            settings: &settings,
        };
        rewrite_common(&target).await?;

        let cmdline = std::fs::read_to_string(f.boot.join("cmdline.txt"))?;
        assert!(cmdline.contains("cryptdevice=/dev/mmcblk0p2:cryptroot"));
        assert!(cmdline.contains(&format!("cryptkey={}", f.keyfile.basename())));

        let placed = f.boot.join("luks-keys").join(f.keyfile.basename());
        assert_eq!(std::fs::metadata(&placed)?.permissions().mode() & 0o777, 0o400);
        assert_eq!(std::fs::read(&placed)?, std::fs::read(f.keyfile.path())?);
        Ok(())
    }

    #[tokio::test]
    async fn test_rewrite_common_follows_makefs() -> Result<()> {
        let f = fixture().await?;
        let mut settings = settings(Distro::Embedded, UnlockPolicy::UsbRequired);
        settings.makefs = MakeFsType::Xfs;
        let target = BootTarget {
            root: &f.root,
            boot: &f.boot,
            partuuid: Some("6c586e13-02"),
            keyfile: &f.keyfile,
            settings: &settings,
        };
        rewrite_common(&target).await?;

        let cmdline = std::fs::read_to_string(f.boot.join("cmdline.txt"))?;
        assert!(cmdline.contains(" rootfstype=xfs "), "{cmdline}");
        assert!(!cmdline.contains("ext4"), "{cmdline}");
        let fstab = std::fs::read_to_string(f.root.join("etc/fstab"))?;
        assert!(fstab.contains("/dev/mapper/cryptroot  /  xfs"), "{fstab}");
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_is_never_overwritten() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cmdline.txt");
        std::fs::write(&path, "first")?;
        backup_original(&path).await?;
        std::fs::write(&path, "second")?;
        backup_original(&path).await?;
        assert_eq!(std::fs::read_to_string(dir.path().join("cmdline.txt.orig"))?, "first");
        Ok(())
    }

    #[tokio::test]
    async fn test_provision_initramfs_raspios() -> Result<()> {
        let f = fixture().await?;
        let keys = f.boot.join("authorized_keys");
        std::fs::write(&keys, "ssh-ed25519 AAAA\n")?;
        let mut settings = settings(Distro::Raspios, UnlockPolicy::LocalKeyfile);
        settings.ssh = Some(SshSettings {
            authorized_keys: keys,
        });
        std::fs::create_dir_all(f.root.join("lib/modules/6.6.51+rpt-rpi-v8"))?;
        std::fs::create_dir_all(f.root.join("boot"))?;
        std::fs::write(f.root.join("boot/initrd.img-6.6.51+rpt-rpi-v8"), b"initrd")?;
        std::fs::write(f.boot.join("config.txt"), "arm_64bit=1\nauto_initramfs=1\n")?;

        let target = BootTarget {
            root: &f.root,
            boot: &f.boot,
            partuuid: Some("6c586e13-02"),
            keyfile: &f.keyfile,
            settings: &settings,
        };
        let cmdline_path = rewrite_common(&target).await?;
        let guest = RecordingGuest {
            root: f.root.clone(),
            outputs: vec![("dpkg".into(), b"Status: install ok installed\n".to_vec())],
            ..Default::default()
        };
        provision_initramfs(&guest, &target, &cmdline_path).await?;

        let commands = guest.commands.lock().unwrap().clone();
        assert!(commands.contains(&vec![
            "apt-get".to_owned(),
            "install".to_owned(),
            "-y".to_owned(),
            "--no-install-recommends".to_owned(),
            "cryptsetup".to_owned(),
            "cryptsetup-initramfs".to_owned(),
        ]));
        assert_eq!(
            commands.last().cloned().unwrap_or_default(),
            vec!["update-initramfs", "-u", "-k", "6.6.51+rpt-rpi-v8"]
        );

        assert_eq!(
            std::fs::read_to_string(f.boot.join("config.txt"))?,
            "arm_64bit=1\ninitramfs initrd.img-6.6.51+rpt-rpi-v8 followkernel\n"
        );
        assert_eq!(std::fs::read(f.boot.join("initrd.img-6.6.51+rpt-rpi-v8"))?, b"initrd");
        assert!(std::fs::read_to_string(&cmdline_path)?.contains("ip=dhcp"));
        assert!(f
            .root
            .join("etc/luks-keys")
            .join(f.keyfile.basename())
            .exists());
        assert!(std::fs::read_to_string(f.root.join("etc/cryptsetup-initramfs/conf-hook"))?
            .contains("CRYPTSETUP=y"));
        Ok(())
    }
}

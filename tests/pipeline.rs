// End-to-end encryption of a generated two-partition image.
//
// Needs root, loop devices and the usual tools. Skipped otherwise.

use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use rstest::rstest;
use sha2::{Digest as _, Sha256};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use imgcrypt::{
    cleanup::{Resource, ResourceStack},
    cli::EncryptOptions,
    config::{ImageConfig, Settings},
    fs::{cmd::CheckCommandOutput as _, loopdev::LoopAttachment, luks2, mount},
    keyfile::KeyfileGenerator,
    pipeline::{host_mapping_name, Pipeline, Unit},
    types::{CryptoAlgorithm, Distro},
};

#[cfg(test)]
#[ctor::ctor]
fn init() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

const APP: &[u8] = b"#!/usr/bin/env python3\nprint('hello from the encrypted root')\n";

fn can_run() -> bool {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("not root, skipping");
        return false;
    }
    let missing: Vec<_> = [
        "sfdisk",
        "mkfs.ext4",
        "cryptsetup",
        "rsync",
        "blkid",
        "mount",
        "umount",
    ]
    .into_iter()
    .filter(|tool| which::which(tool).is_err())
    .collect();
    if !missing.is_empty() {
        eprintln!("missing tools {missing:?}, skipping");
        return false;
    }
    true
}

/// A 96 MiB image with a 32 MiB boot partition and an ext4 root holding
/// `/root/app.py`.
async fn build_image(dir: &Path) -> Result<PathBuf> {
    let image = dir.join("source.img");
    tokio::fs::File::create(&image)
        .await?
        .set_len(96 * 1024 * 1024)
        .await?;

    Command::new("sfdisk")
        .arg(&image)
        .run_with_input(Some(b"label: dos\n,32M,L\n,,L\n"))
        .await?;

    let mut stack = ResourceStack::default();
    let attachment = LoopAttachment::attach(&image, false).await?;
    stack.push(Resource::Loop(attachment.path().to_path_buf()));

    let boot_dev = attachment.partition(1).await?;
    let root_dev = attachment.partition(2).await?;
    Command::new("mkfs.ext4").arg("-q").arg(&boot_dev).run().await?;
    Command::new("mkfs.ext4").arg("-q").arg(&root_dev).run().await?;

    let boot = dir.join("mnt-boot");
    mount::mount(&boot_dev, &boot, false).await?;
    stack.push(Resource::Mount(boot.clone()));
    tokio::fs::write(
        boot.join("cmdline.txt"),
        "console=serial0,115200 root=/dev/mmcblk0p2 rootfstype=ext4 rootwait\n",
    )
    .await?;
    tokio::fs::write(boot.join("config.txt"), "[all]\narm_64bit=1\n").await?;

    let root = dir.join("mnt-root");
    mount::mount(&root_dev, &root, false).await?;
    stack.push(Resource::Mount(root.clone()));
    tokio::fs::create_dir_all(root.join("etc")).await?;
    tokio::fs::create_dir_all(root.join("root")).await?;
    tokio::fs::write(
        root.join("etc/fstab"),
        "proc  /proc  proc  defaults  0  0\n/dev/mmcblk0p2  /  ext4  defaults,noatime  0  1\n",
    )
    .await?;
    let app = root.join("root/app.py");
    tokio::fs::write(&app, APP).await?;
    tokio::fs::set_permissions(&app, std::fs::Permissions::from_mode(0o755)).await?;

    stack.unwind().await;
    Ok(image)
}

#[rstest]
#[case(CryptoAlgorithm::Aes, "aes-xts-plain64")]
#[case(CryptoAlgorithm::XChaCha, "xchacha20,aes-adiantum-plain64")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_encrypt_generated_image(
    #[case] crypto: CryptoAlgorithm,
    #[case] expected_cipher: &str,
) -> Result<()> {
    if !can_run() {
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let source = build_image(dir.path()).await?;
    let keyfile = KeyfileGenerator::new(dir.path().join("keys"))
        .generate()
        .await?;

    let mut settings = Settings::resolve(ImageConfig::default(), &EncryptOptions::default());
    settings.distro = Distro::Embedded;
    settings.crypto = crypto;
    settings.work_dir = Some(dir.path().to_path_buf());

    let unit = Unit {
        source: source.clone(),
        output: dir.path().join("encrypted.img"),
        keyfile,
        passphrase: None,
        settings: Arc::new(settings),
    };
    let report = Pipeline::default()
        .run(&unit, &CancellationToken::new())
        .await?;
    assert_eq!(report.size, std::fs::metadata(&source)?.len());

    // nothing of the run stays attached
    let leftover = Command::new("losetup")
        .arg("-j")
        .arg(&unit.output)
        .run_get_string()
        .await?;
    assert!(leftover.trim().is_empty(), "{leftover}");

    let mut stack = ResourceStack::default();
    let attachment = LoopAttachment::attach(&unit.output, true).await?;
    stack.push(Resource::Loop(attachment.path().to_path_buf()));

    let check = async {
        let root_dev = attachment.partition(2).await?;
        assert!(luks2::is_luks(&root_dev).await?);
        let cipher = luks2::dump(&root_dev).await?.cipher.unwrap_or_default();
        assert_eq!(cipher, expected_cipher);

        let name = host_mapping_name("imgcrypt-test");
        luks2::open(&root_dev, &name, unit.keyfile.path()).await?;
        stack.push(Resource::Mapping(name.clone()));

        let root = dir.path().join("check-root");
        mount::mount(luks2::mapper_path(&name), &root, true).await?;
        stack.push(Resource::Mount(root.clone()));

        let app = root.join("root/app.py");
        assert_eq!(
            std::fs::metadata(&app)?.permissions().mode() & 0o777,
            0o755
        );
        assert_eq!(
            Sha256::digest(std::fs::read(&app)?),
            Sha256::digest(APP)
        );
        let fstab = std::fs::read_to_string(root.join("etc/fstab"))?;
        assert!(fstab.contains("/dev/mapper/cryptroot"), "{fstab}");
        assert!(root.join("usr/lib/imgcrypt/unlock-key").is_file());

        let boot = dir.path().join("check-boot");
        mount::mount(attachment.partition(1).await?, &boot, true).await?;
        stack.push(Resource::Mount(boot.clone()));
        let cmdline = std::fs::read_to_string(boot.join("cmdline.txt"))?;
        assert!(cmdline.contains("root=/dev/mapper/cryptroot"), "{cmdline}");
        assert!(cmdline.contains("cryptdevice="), "{cmdline}");
        assert!(cmdline.contains("rootfstype=ext4"), "{cmdline}");
        assert!(!cmdline.contains("cryptkey="), "{cmdline}");
        Ok::<_, anyhow::Error>(())
    }
    .await;

    stack.unwind().await;
    check
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_already_encrypted_image_is_refused() -> Result<()> {
    if !can_run() {
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let source = build_image(dir.path()).await?;
    let keyfile = KeyfileGenerator::new(dir.path().join("keys"))
        .generate()
        .await?;
    let mut settings = Settings::resolve(ImageConfig::default(), &EncryptOptions::default());
    settings.distro = Distro::Embedded;
    let settings = Arc::new(settings);

    let first = Unit {
        source,
        output: dir.path().join("once.img"),
        keyfile: keyfile.clone(),
        passphrase: None,
        settings: settings.clone(),
    };
    Pipeline::default()
        .run(&first, &CancellationToken::new())
        .await?;

    let second = Unit {
        source: first.output.clone(),
        output: dir.path().join("twice.img"),
        keyfile,
        passphrase: None,
        settings,
    };
    let err = Pipeline::default()
        .run(&second, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "precondition");
    assert!(!second.output.exists());
    Ok(())
}

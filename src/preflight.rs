//! Checks run before any system resource is acquired.

use std::path::Path;

use anyhow::{bail, Context as _, Result};

use crate::{config::Settings, types::Distro};

/// External tools a run needs for `settings`.
pub fn required_tools(settings: &Settings) -> Vec<&'static str> {
    let mut tools = vec![
        "cryptsetup",
        "rsync",
        "mount",
        "umount",
        "blkid",
        settings.makefs.mkfs_tool(),
    ];
    if settings.distro == Distro::Raspios {
        tools.push("chroot");
    }
    tools
}

pub fn check_tools(tools: &[&str]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|tool| which::which(tool).is_err())
        .collect();
    if !missing.is_empty() {
        bail!("Required tools not found on PATH: {missing:?}");
    }
    if which::which("partprobe").is_err() && which::which("blockdev").is_err() {
        bail!("Neither partprobe nor blockdev found on PATH");
    }
    Ok(())
}

pub fn check_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("Root privileges are required to attach loop devices and open LUKS volumes");
    }
    Ok(())
}

pub fn check_source_image(image: &Path) -> Result<()> {
    let metadata =
        std::fs::metadata(image).with_context(|| format!("Source image {image:?} not found"))?;
    if !metadata.is_file() {
        bail!("Source image {image:?} is not a regular file");
    }
    Ok(())
}

pub fn check_output(source: &Path, output: &Path) -> Result<()> {
    let same = match (std::fs::canonicalize(source), std::fs::canonicalize(output)) {
        (Ok(a), Ok(b)) => a == b,
        _ => source == output,
    };
    if same {
        bail!("Output image {output:?} must differ from the source image");
    }
    if output.exists() {
        bail!("Output image {output:?} already exists, refusing to overwrite it");
    }

    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !parent.is_dir() {
        bail!("Output directory {parent:?} does not exist");
    }
    Ok(())
}

/// Everything that can be checked without touching the image.
pub fn check_settings(settings: &Settings, jobs: usize) -> Result<()> {
    settings.validate(jobs)?;
    if let Some(keyfile) = &settings.keyfile {
        if !keyfile.is_file() {
            bail!("Keyfile {keyfile:?} does not exist");
        }
    }
    Ok(())
}

pub fn check_all(settings: &Settings, source: &Path, outputs: &[&Path], jobs: usize) -> Result<()> {
    check_settings(settings, jobs)?;
    check_source_image(source)?;
    for output in outputs {
        check_output(source, output)?;
    }
    check_root()?;
    check_tools(&required_tools(settings))?;
    Ok(())
}

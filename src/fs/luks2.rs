use std::{
    ffi::OsString,
    io::Write as _,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use tokio::process::Command;

use crate::types::{CryptoAlgorithm, KdfTuning, Passphrase};

use super::{cmd::CheckCommandOutput as _, get_verbose};

async fn cryptsetup() -> Command {
    let mut cmd = Command::new("cryptsetup");
    if get_verbose().await {
        cmd.arg("--debug");
    }
    cmd
}

fn kdf_args(kdf: &KdfTuning) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--pbkdf".into(),
        kdf.pbkdf.to_string().into(),
        "--iter-time".into(),
        kdf.iter_time_ms.to_string().into(),
    ];
    if let Some(memory_kib) = kdf.memory_kib {
        args.extend(["--pbkdf-memory".into(), memory_kib.to_string().into()]);
    }
    args
}

/// Arguments of `cryptsetup luksFormat` for a non-interactive LUKS2 format.
pub fn format_args(
    dev: &Path,
    keyfile: &Path,
    crypto: CryptoAlgorithm,
    kdf: &KdfTuning,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["luksFormat", "--batch-mode", "--type", "luks2", "--cipher"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(crypto.cipher().into());
    args.extend(["--key-size".into(), crypto.key_size().to_string().into()]);
    args.extend(["--hash".into(), "sha256".into()]);
    args.extend(kdf_args(kdf));
    args.extend(["--key-file".into(), keyfile.into(), dev.into()]);
    args
}

/// Format `dev` as a LUKS2 container unlocked by `keyfile`. Never prompts.
pub async fn format(
    dev: &Path,
    keyfile: &Path,
    crypto: CryptoAlgorithm,
    kdf: &KdfTuning,
) -> Result<()> {
    tracing::info!(
        "Formatting {dev:?} as LUKS2 volume with cipher {}",
        crypto.cipher()
    );

    cryptsetup()
        .await
        .args(format_args(dev, keyfile, crypto, kdf))
        .run()
        .await
        .with_context(|| format!("Failed to format {dev:?} as LUKS2 volume"))?;

    Ok(())
}

/// Ask the operator for a passphrase twice on the terminal.
pub async fn prompt_passphrase() -> Result<Passphrase> {
    tokio::task::spawn_blocking(|| -> Result<_> {
        let passphrase = dialoguer::Password::new()
            .with_prompt("Fallback passphrase for the encrypted root")
            .with_confirmation("Repeat passphrase", "Passphrases do not match")
            .interact()
            .context("Failed to read passphrase from terminal")?;
        if passphrase.is_empty() {
            bail!("Empty passphrase is not allowed");
        }
        Ok(Passphrase::from(passphrase))
    })
    .await
    .context("background task failed")?
}

/// Add `passphrase` as an additional key slot, authorized by `keyfile`.
pub async fn add_passphrase(
    dev: &Path,
    keyfile: &Path,
    passphrase: &Passphrase,
    kdf: &KdfTuning,
) -> Result<()> {
    // tempfile creates the file with mode 0600
    let passphrase_file = {
        let passphrase = passphrase.to_owned();
        tokio::task::spawn_blocking(move || -> Result<_> {
            let mut passphrase_file = tempfile::Builder::new()
                .prefix("imgcrypt-pass")
                .tempfile()
                .context("Failed to create temp file for passphrase")?;
            passphrase_file.write_all(passphrase.as_bytes())?;
            passphrase_file.flush()?;
            Ok(passphrase_file)
        })
        .await
        .context("background task failed")??
    };

    let mut cmd = cryptsetup().await;
    cmd.args(["luksAddKey", "--batch-mode"])
        .args(kdf_args(kdf))
        .arg("--key-file")
        .arg(keyfile)
        .arg(dev)
        .arg(passphrase_file.path())
        .run()
        .await
        .with_context(|| format!("Failed to add passphrase key slot to {dev:?}"))?;

    Ok(())
}

pub async fn open(dev: &Path, name: &str, keyfile: &Path) -> Result<()> {
    tracing::info!("Setting up mapping {name} for {dev:?}");

    cryptsetup()
        .await
        .args(["open", "--type", "luks2", "--key-file"])
        .arg(keyfile)
        .arg(dev)
        .arg(name)
        .run()
        .await
        .with_context(|| format!("Failed to setup mapping {name} for {dev:?}"))?;

    Ok(())
}

pub fn mapper_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/mapper/{name}"))
}

pub fn is_active(name: &str) -> bool {
    mapper_path(name).exists()
}

/// Close a mapping. A mapping that does not exist is already closed.
pub async fn close(name: &str) -> Result<()> {
    if !is_active(name) {
        tracing::trace!("Mapping {name} is not active, nothing to do");
        return Ok(());
    }

    cryptsetup()
        .await
        .arg("close")
        .arg(name)
        .run()
        .await
        .with_context(|| format!("Failed to close mapping `{name}`"))?;
    Ok(())
}

pub async fn is_luks(dev: &Path) -> Result<bool> {
    Command::new("cryptsetup")
        .arg("isLuks")
        .arg(dev)
        .run_with_status_checker(|output| match output.code {
            0 => Ok(true),
            1 => Ok(false),
            _ => bail!("Bad exit code"),
        })
        .await
        .with_context(|| format!("Failed to check whether {dev:?} is a LUKS volume"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LuksInfo {
    pub version: Option<u32>,
    pub uuid: Option<String>,
    /// Cipher of the first data segment.
    pub cipher: Option<String>,
    pub keyslots: usize,
}

pub async fn dump(dev: &Path) -> Result<LuksInfo> {
    let text = Command::new("cryptsetup")
        .arg("luksDump")
        .arg(dev)
        .run_get_string()
        .await
        .with_context(|| format!("Failed to dump LUKS header of {dev:?}"))?;
    Ok(parse_luks_dump(&text))
}

pub fn parse_luks_dump(text: &str) -> LuksInfo {
    #[derive(PartialEq)]
    enum Section {
        Header,
        Segments,
        Keyslots,
        Other,
    }

    let mut info = LuksInfo::default();
    let mut section = Section::Header;

    for line in text.lines() {
        if !line.starts_with(char::is_whitespace) {
            section = match line.trim_end() {
                "Data segments:" => Section::Segments,
                "Keyslots:" => Section::Keyslots,
                "Tokens:" | "Digests:" => Section::Other,
                _ if section == Section::Header => Section::Header,
                _ => Section::Other,
            };
        }

        let trimmed = line.trim();
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match section {
            Section::Header => match key {
                "Version" => info.version = value.parse().ok(),
                "UUID" => info.uuid = Some(value.to_owned()),
                _ => {}
            },
            Section::Segments => {
                if key == "cipher" && info.cipher.is_none() {
                    info.cipher = Some(value.to_owned());
                }
            }
            Section::Keyslots => {
                // slot headers look like "  0: luks2"
                if key.chars().all(|c| c.is_ascii_digit()) && !key.is_empty() {
                    info.keyslots += 1;
                }
            }
            Section::Other => {}
        }
    }

    info
}

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::{
    cli::EncryptOptions,
    types::{CryptoAlgorithm, Distro, KdfTuning, MakeFsType, UnlockPolicy},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/imgcrypt/config.toml";
pub const DEFAULT_MAPPER: &str = "cryptroot";
pub const DEFAULT_KEY_DIR: &str = "./keys";
pub const DEFAULT_TARGET_ROOT_DEVICE: &str = "/dev/mmcblk0p2";
/// Device-mapper names are limited to 127 bytes, leave room for the
/// per-run suffix.
const MAX_MAPPER_LEN: usize = 64;

/// On-disk configuration. Every field is optional; command line flags win.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    /// Cipher family, `aes` or `xchacha`.
    pub crypto: Option<String>,

    /// Mapping name the booted system uses for the root, e.g. `cryptroot`.
    pub mapper: Option<String>,

    /// Where generated keyfiles are stored.
    pub key_dir: Option<PathBuf>,

    /// Reuse this keyfile instead of generating one.
    pub keyfile: Option<PathBuf>,

    /// Keep the source image after a successful run.
    pub keep_original: Option<bool>,

    pub distro: Option<Distro>,

    pub unlock_policy: Option<UnlockPolicy>,

    /// Prompt for a fallback passphrase.
    pub passphrase: Option<bool>,

    pub makefs: Option<MakeFsType>,

    pub boot_partition: Option<u32>,

    pub root_partition: Option<u32>,

    /// Root device written to the command line when no PARTUUID is found.
    pub target_root_device: Option<String>,

    pub kdf: Option<KdfTuning>,

    pub ssh: Option<SshConfig>,

    /// Parent directory for per-run working directories.
    pub work_dir: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    #[serde(default = "Default::default")]
    pub enable: bool,

    pub authorized_keys: Option<PathBuf>,
}

impl ImageConfig {
    /// Load `path`, or the system-wide file when present. A missing
    /// system-wide file yields the defaults; a missing explicit one is an error.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!("No config file at {path:?}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {path:?}"))
            }
        };

        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {path:?}"))?;
        tracing::debug!("Loaded config from {path:?}");
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub authorized_keys: PathBuf,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub crypto: CryptoAlgorithm,
    pub mapper: String,
    pub key_dir: PathBuf,
    pub keyfile: Option<PathBuf>,
    pub keep_original: bool,
    pub distro: Distro,
    pub unlock_policy: UnlockPolicy,
    pub passphrase: bool,
    pub makefs: MakeFsType,
    pub boot_partition: u32,
    pub root_partition: u32,
    pub target_root_device: String,
    pub kdf: KdfTuning,
    pub ssh: Option<SshSettings>,
    pub work_dir: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(file: ImageConfig, cli: &EncryptOptions) -> Self {
        let crypto = cli
            .crypto
            .as_deref()
            .or(file.crypto.as_deref())
            .map(CryptoAlgorithm::parse_lenient)
            .unwrap_or_default();
        let distro = cli.distro.or(file.distro).unwrap_or_default();

        let ssh = match &cli.ssh_authorized_keys {
            Some(keys) => Some(SshSettings {
                authorized_keys: keys.clone(),
            }),
            None => file.ssh.filter(|ssh| ssh.enable).map(|ssh| SshSettings {
                authorized_keys: ssh.authorized_keys.unwrap_or_default(),
            }),
        };

        Settings {
            crypto,
            mapper: cli
                .mapper
                .clone()
                .or(file.mapper)
                .unwrap_or_else(|| DEFAULT_MAPPER.to_owned()),
            key_dir: cli
                .key_dir
                .clone()
                .or(file.key_dir)
                .unwrap_or_else(|| DEFAULT_KEY_DIR.into()),
            keyfile: cli.keyfile.clone().or(file.keyfile),
            keep_original: cli.keep_original.or(file.keep_original).unwrap_or(true),
            distro,
            unlock_policy: cli.unlock_policy.or(file.unlock_policy).unwrap_or_default(),
            passphrase: cli.passphrase || file.passphrase.unwrap_or(false),
            makefs: cli.makefs.or(file.makefs).unwrap_or_default(),
            boot_partition: cli.boot_partition.or(file.boot_partition).unwrap_or(1),
            root_partition: cli.root_partition.or(file.root_partition).unwrap_or(2),
            target_root_device: cli
                .target_root_device
                .clone()
                .or(file.target_root_device)
                .unwrap_or_else(|| DEFAULT_TARGET_ROOT_DEVICE.to_owned()),
            kdf: file.kdf.unwrap_or_else(|| KdfTuning::default_for(distro)),
            ssh,
            work_dir: cli.work_dir.clone().or(file.work_dir),
        }
    }

    /// Checks that need no system access. `jobs` is the number of
    /// concurrent runs sharing these settings.
    pub fn validate(&self, jobs: usize) -> Result<()> {
        if self.mapper.is_empty()
            || self.mapper.len() > MAX_MAPPER_LEN
            || !self
                .mapper
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!(
                "Invalid mapper name {:?}: use 1 to {MAX_MAPPER_LEN} characters from [A-Za-z0-9_-]",
                self.mapper
            );
        }

        if self.boot_partition == 0 || self.root_partition == 0 {
            bail!("Partition indices start at 1");
        }
        if self.boot_partition == self.root_partition {
            bail!(
                "Boot and root partition must differ (both are {})",
                self.boot_partition
            );
        }

        if self.passphrase && jobs > 1 {
            bail!("A passphrase prompt cannot be combined with {jobs} parallel jobs");
        }

        if let Some(ssh) = &self.ssh {
            if !ssh.authorized_keys.is_file() {
                bail!(
                    "SSH unlock is enabled but the authorized keys file {:?} does not exist",
                    ssh.authorized_keys
                );
            }
        }

        if self.kdf.iter_time_ms == 0 {
            bail!("KDF iteration time must be positive");
        }

        Ok(())
    }
}

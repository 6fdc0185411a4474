//! Per-image unlock keys.
//!
//! Every output image gets its own keyfile: 256 bytes from the OS CSPRNG,
//! stored as `<key_dir>/<identifier>.lek` with mode `0600`. The identifier
//! doubles as the manifest key id, so it must be unique within a directory.

use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _, Result};
use rand::{rngs::OsRng, RngCore as _};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt as _;
use zeroize::Zeroizing;

pub const KEYFILE_LEN: usize = 256;
pub const KEYFILE_EXTENSION: &str = "lek";
const KERNEL_UUID_PATH: &str = "/proc/sys/kernel/random/uuid";
const CREATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyfile {
    id: String,
    path: PathBuf,
}

impl Keyfile {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the key, as referenced from crypttab and `cryptkey=`.
    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone())
    }

    pub async fn read_material(&self) -> Result<Zeroizing<Vec<u8>>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read keyfile {:?}", self.path))?;
        Ok(Zeroizing::new(bytes))
    }

    /// Use a keyfile supplied by the operator instead of generating one.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Keyfile {path:?} does not exist"))?;
        if !metadata.is_file() {
            bail!("Keyfile {path:?} is not a regular file");
        }
        if metadata.len() == 0 {
            bail!("Keyfile {path:?} is empty");
        }
        if metadata.len() < KEYFILE_LEN as u64 {
            tracing::warn!(
                "Keyfile {path:?} holds only {} bytes, {KEYFILE_LEN} are recommended",
                metadata.len()
            );
        }

        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .with_context(|| format!("Keyfile path {path:?} has no file name"))?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
        })
    }
}

/// Where an identifier comes from. Sources are tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierSource {
    /// v4 UUID built from OS randomness.
    Uuid,
    /// The kernel's random UUID file.
    KernelUuid(PathBuf),
    /// SHA-256 of random bytes laid out as a UUID.
    HashedRandom,
    /// `<unix-seconds>-<pid>-<16 hex>`.
    TimestampPid,
}

impl IdentifierSource {
    pub fn default_chain() -> Vec<IdentifierSource> {
        vec![
            IdentifierSource::Uuid,
            IdentifierSource::KernelUuid(KERNEL_UUID_PATH.into()),
            IdentifierSource::HashedRandom,
            IdentifierSource::TimestampPid,
        ]
    }

    pub async fn generate(&self) -> Result<String> {
        match self {
            IdentifierSource::Uuid => {
                let mut bytes = [0u8; 16];
                OsRng
                    .try_fill_bytes(&mut bytes)
                    .context("OS random source unavailable")?;
                Ok(uuid::Builder::from_random_bytes(bytes)
                    .into_uuid()
                    .to_string())
            }
            IdentifierSource::KernelUuid(path) => {
                let id = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read {path:?}"))?;
                let id = id.trim();
                if uuid::Uuid::parse_str(id).is_err() {
                    bail!("{path:?} returned malformed uuid {id:?}");
                }
                Ok(id.to_owned())
            }
            IdentifierSource::HashedRandom => {
                let mut seed = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut seed);
                Ok(format_as_uuid(&hex::encode(Sha256::digest(seed))))
            }
            IdentifierSource::TimestampPid => {
                let secs = chrono::Utc::now().timestamp();
                let mut tail = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut tail);
                Ok(format!("{secs}-{}-{}", std::process::id(), hex::encode(tail)))
            }
        }
    }
}

/// Lay out the first 32 hex digits as `8-4-4-4-12`.
fn format_as_uuid(hex: &str) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

pub struct KeyfileGenerator {
    dir: PathBuf,
    sources: Vec<IdentifierSource>,
}

impl KeyfileGenerator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sources: IdentifierSource::default_chain(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<IdentifierSource>) -> Self {
        self.sources = sources;
        self
    }

    async fn next_identifier(&self) -> Result<String> {
        for source in &self.sources {
            match source.generate().await {
                Ok(id) => return Ok(id),
                Err(error) => {
                    tracing::debug!(?error, "Identifier source {source:?} failed, trying next")
                }
            }
        }
        bail!("No identifier source produced a keyfile identifier")
    }

    async fn ensure_dir(&self) -> Result<()> {
        if tokio::fs::metadata(&self.dir).await.is_ok() {
            return Ok(());
        }
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .await
            .with_context(|| format!("Failed to create key directory {:?}", self.dir))
    }

    /// Create a new keyfile. Existing files are never overwritten.
    pub async fn generate(&self) -> Result<Keyfile> {
        self.ensure_dir().await?;

        let mut material = Zeroizing::new(vec![0u8; KEYFILE_LEN]);
        OsRng
            .try_fill_bytes(&mut material)
            .context("Failed to gather random key material")?;

        for _ in 0..CREATE_ATTEMPTS {
            let id = self.next_identifier().await?;
            let path = self.dir.join(format!("{id}.{KEYFILE_EXTENSION}"));

            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tracing::warn!("Keyfile {path:?} already exists, picking another identifier");
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(e).with_context(|| {
                        format!("Key directory {:?} is not writable", self.dir)
                    })
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to create {path:?}")),
            };

            file.write_all(&material).await?;
            file.sync_all().await?;
            // umask may have narrowed the mode but never widened it
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;

            tracing::info!("Generated keyfile {path:?}");
            return Ok(Keyfile { id, path });
        }

        bail!(
            "Failed to find a free keyfile name in {:?} after {CREATE_ATTEMPTS} attempts",
            self.dir
        )
    }
}

use std::fmt::Debug;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum CryptoAlgorithm {
    #[default]
    #[strum(serialize = "aes")]
    Aes,
    #[strum(serialize = "xchacha")]
    XChaCha,
}

impl CryptoAlgorithm {
    /// Never fails: anything unrecognized falls back to AES with a warning.
    pub fn parse_lenient(value: &str) -> Self {
        let value = value.trim().to_ascii_lowercase();
        if value.starts_with("aes") {
            CryptoAlgorithm::Aes
        } else if value.starts_with("xchacha") || value == "adiantum" {
            CryptoAlgorithm::XChaCha
        } else {
            tracing::warn!("Unrecognized crypto algorithm {value:?}, falling back to aes");
            CryptoAlgorithm::Aes
        }
    }

    pub fn cipher(&self) -> &'static str {
        match self {
            CryptoAlgorithm::Aes => "aes-xts-plain64",
            CryptoAlgorithm::XChaCha => "xchacha20,aes-adiantum-plain64",
        }
    }

    /// Key size in bits as passed to `cryptsetup --key-size`.
    pub fn key_size(&self) -> u32 {
        match self {
            CryptoAlgorithm::Aes => 512,
            CryptoAlgorithm::XChaCha => 256,
        }
    }

    /// Kernel modules the initramfs needs to open a container of this kind.
    pub fn initramfs_modules(&self) -> &'static [&'static str] {
        match self {
            CryptoAlgorithm::Aes => &["dm_crypt", "aes_generic", "xts", "sha256_generic"],
            CryptoAlgorithm::XChaCha => &[
                "dm_crypt",
                "adiantum",
                "chacha_generic",
                "nhpoly1305",
                "aes_generic",
                "sha256_generic",
            ],
        }
    }
}

#[derive(
    Serialize, Deserialize, ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Distro {
    /// General purpose OS that builds its initramfs at install time.
    #[default]
    Raspios,
    /// Firmware image shipping prebuilt unlock tooling.
    Embedded,
}

#[derive(
    Serialize, Deserialize, ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum UnlockPolicy {
    /// The key only lives on removable media presented at boot.
    #[default]
    UsbRequired,
    /// The key is embedded in the boot partition and initramfs.
    LocalKeyfile,
}

#[derive(
    Serialize, Deserialize, ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MakeFsType {
    #[default]
    Ext4,
    Xfs,
    Btrfs,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Pbkdf {
    Pbkdf2,
    Argon2id,
    Argon2i,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KdfTuning {
    pub pbkdf: Pbkdf,
    pub iter_time_ms: u32,
    /// Only meaningful for the argon2 family.
    pub memory_kib: Option<u32>,
}

impl KdfTuning {
    pub fn default_for(distro: Distro) -> Self {
        match distro {
            Distro::Raspios => KdfTuning {
                pbkdf: Pbkdf::Pbkdf2,
                iter_time_ms: 1000,
                memory_kib: None,
            },
            Distro::Embedded => KdfTuning {
                pbkdf: Pbkdf::Argon2id,
                iter_time_ms: 2000,
                memory_kib: Some(256 * 1024),
            },
        }
    }
}

#[derive(Zeroize, ZeroizeOnDrop, Clone)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl From<Vec<u8>> for Passphrase {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<String> for Passphrase {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

#[cfg(test)]
pub mod tests {

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("aes", CryptoAlgorithm::Aes)]
    #[case("AES-XTS", CryptoAlgorithm::Aes)]
    #[case("aes256", CryptoAlgorithm::Aes)]
    #[case("xchacha", CryptoAlgorithm::XChaCha)]
    #[case("xchacha20", CryptoAlgorithm::XChaCha)]
    #[case("adiantum", CryptoAlgorithm::XChaCha)]
    #[case("serpent", CryptoAlgorithm::Aes)]
    #[case("", CryptoAlgorithm::Aes)]
    fn test_parse_lenient(#[case] input: &str, #[case] expected: CryptoAlgorithm) {
        assert_eq!(CryptoAlgorithm::parse_lenient(input), expected);
    }

    #[test]
    fn test_cipher_parameters() {
        assert!(CryptoAlgorithm::XChaCha.cipher().contains("adiantum"));
        assert_eq!(CryptoAlgorithm::XChaCha.key_size(), 256);
        assert!(CryptoAlgorithm::default().cipher().starts_with("aes-xts"));
        assert_eq!(CryptoAlgorithm::Aes.key_size(), 512);
        assert!(CryptoAlgorithm::XChaCha
            .initramfs_modules()
            .contains(&"adiantum"));
    }

    #[test]
    fn test_kdf_defaults() {
        let raspios = KdfTuning::default_for(Distro::Raspios);
        assert_eq!(raspios.pbkdf, Pbkdf::Pbkdf2);
        assert_eq!(raspios.memory_kib, None);

        let embedded = KdfTuning::default_for(Distro::Embedded);
        assert_eq!(embedded.pbkdf, Pbkdf::Argon2id);
        assert_eq!(embedded.iter_time_ms, 2000);
        assert_eq!(embedded.memory_kib, Some(262144));
    }

    #[test]
    fn test_enum_names() {
        assert_eq!(UnlockPolicy::LocalKeyfile.to_string(), "local-keyfile");
        assert_eq!(MakeFsType::Btrfs.to_string(), "btrfs");
        assert_eq!(Pbkdf::Argon2id.to_string(), "argon2id");
        assert_eq!(format!("{:?}", Passphrase::from("s3cret".to_owned())), "Passphrase(<redacted>)");
    }
}

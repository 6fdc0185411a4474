use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{
    build::CLAP_LONG_VERSION,
    types::{Distro, MakeFsType, UnlockPolicy},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: GlobalSubcommand,

    /// Path to the configuration file. Default value is /etc/imgcrypt/config.toml.
    #[clap(long, short = 'c', env = "IMGCRYPT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level and make external tools verbose.
    #[clap(long, short = 'v', env = "IMGCRYPT_VERBOSE")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum GlobalSubcommand {
    /// Encrypt the root partition of one disk image.
    #[command(name = "encrypt")]
    Encrypt(EncryptArgs),

    /// Produce many encrypted copies of one image, each with its own key.
    #[command(name = "batch")]
    Batch(BatchArgs),

    /// Generate a keyfile without touching any image.
    #[command(name = "keygen")]
    Keygen(KeygenOptions),

    /// Show partitions and encryption state of a disk image.
    #[command(name = "inspect")]
    Inspect(InspectOptions),
}

/// Options shared by every command that runs the encryption pipeline.
#[derive(Args, Debug, Clone, Default)]
pub struct EncryptOptions {
    /// Cipher family: aes (aes-xts-plain64) or xchacha (adiantum).
    #[clap(long, env = "IMGCRYPT_CRYPTO")]
    pub crypto: Option<String>,

    /// Mapping name used by the booted system for the encrypted root.
    #[clap(long, env = "IMGCRYPT_MAPPER")]
    pub mapper: Option<String>,

    /// Directory receiving generated keyfiles.
    #[clap(long, env = "IMGCRYPT_KEY_DIR")]
    pub key_dir: Option<PathBuf>,

    /// Use an existing keyfile instead of generating a new one.
    #[clap(long, env = "IMGCRYPT_KEYFILE")]
    pub keyfile: Option<PathBuf>,

    /// Keep the source image after success (set to false to delete it).
    #[clap(long, env = "IMGCRYPT_KEEP_ORIGINAL")]
    pub keep_original: Option<bool>,

    /// Kind of OS inside the image.
    #[clap(long, env = "IMGCRYPT_DISTRO")]
    #[arg(value_enum)]
    pub distro: Option<Distro>,

    /// Whether the keyfile is embedded in the image or must be presented on removable media.
    #[clap(long, env = "IMGCRYPT_UNLOCK_POLICY")]
    #[arg(value_enum)]
    pub unlock_policy: Option<UnlockPolicy>,

    /// Prompt for a fallback passphrase added as a second key slot.
    #[clap(long, env = "IMGCRYPT_PASSPHRASE")]
    pub passphrase: bool,

    /// Filesystem created inside the encrypted container.
    #[clap(long, env = "IMGCRYPT_MAKEFS")]
    #[arg(value_enum)]
    pub makefs: Option<MakeFsType>,

    /// Index of the boot partition.
    #[clap(long, env = "IMGCRYPT_BOOT_PARTITION")]
    pub boot_partition: Option<u32>,

    /// Index of the root partition.
    #[clap(long, env = "IMGCRYPT_ROOT_PARTITION")]
    pub root_partition: Option<u32>,

    /// Root device used on the target when the partition has no PARTUUID.
    #[clap(long, env = "IMGCRYPT_TARGET_ROOT_DEVICE")]
    pub target_root_device: Option<String>,

    /// Enable SSH unlock in the initramfs with these authorized keys.
    #[clap(long, env = "IMGCRYPT_SSH_AUTHORIZED_KEYS")]
    pub ssh_authorized_keys: Option<PathBuf>,

    /// Parent directory for temporary working directories.
    #[clap(long, env = "IMGCRYPT_WORK_DIR")]
    pub work_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct EncryptArgs {
    /// The unencrypted source image.
    pub image: PathBuf,

    /// Where to write the encrypted image. Default is `<stem>-encrypted.img` next to the source.
    #[clap(long, short = 'o')]
    pub output: Option<PathBuf>,

    #[clap(flatten)]
    pub options: EncryptOptions,
}

#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// The unencrypted source image.
    pub image: PathBuf,

    /// Number of encrypted images to produce.
    #[clap(long, short = 'n')]
    pub count: usize,

    /// File name prefix of the produced images.
    #[clap(long, default_value = "device_")]
    pub prefix: String,

    /// Directory receiving the produced images. Default is the current directory.
    #[clap(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Number of images processed concurrently. Default is the number of CPUs.
    #[clap(long, short = 'j', env = "IMGCRYPT_JOBS")]
    pub jobs: Option<usize>,

    /// CSV manifest correlating images and keys. Default is `<output-dir>/manifest.csv`.
    #[clap(long)]
    pub manifest: Option<PathBuf>,

    #[clap(flatten)]
    pub options: EncryptOptions,
}

#[derive(Parser, Debug)]
pub struct KeygenOptions {
    /// Directory receiving the keyfile.
    #[clap(long, env = "IMGCRYPT_KEY_DIR", default_value = "./keys")]
    pub key_dir: PathBuf,
}

#[derive(Parser, Debug)]
pub struct InspectOptions {
    /// The image to inspect. It is attached read-only.
    pub image: PathBuf,

    /// Index of the root partition.
    #[clap(long, default_value = "2")]
    pub root_partition: u32,
}

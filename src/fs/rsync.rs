use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use super::{cmd::CheckCommandOutput as _, get_verbose};

/// Copy the content of `src` into `dst`, preserving permissions, ownership,
/// ACLs, extended attributes, sparse files and hardlinks.
pub async fn mirror(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    tokio::fs::create_dir_all(dst)
        .await
        .with_context(|| format!("Failed to create {dst:?}"))?;

    let mut cmd = Command::new("rsync");
    cmd.args(["-aHAXS", "--numeric-ids"]);
    if get_verbose().await {
        cmd.arg("--info=progress2");
    }
    cmd.arg(with_trailing_slash(src))
        .arg(with_trailing_slash(dst))
        .run()
        .await
        .with_context(|| format!("Failed to copy {src:?} to {dst:?}"))?;

    Ok(())
}

/// rsync copies the *content* of a directory only when its path ends in `/`.
fn with_trailing_slash(path: &Path) -> String {
    let path = path.to_string_lossy();
    if path.ends_with('/') {
        path.into_owned()
    } else {
        format!("{path}/")
    }
}

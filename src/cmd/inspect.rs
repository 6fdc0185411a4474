use std::path::Path;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, ContentArrangement, Table,
};
use tokio::process::Command;

use crate::{
    cleanup::{Resource, ResourceStack},
    cli::InspectOptions,
    fs::{cmd::CheckCommandOutput as _, loopdev, luks2},
    preflight,
};

pub struct InspectCommand {
    pub inspect_options: InspectOptions,
}

/// Filesystem type as probed by blkid, `None` for an unknown signature.
async fn probe_type(partition: &Path) -> Result<Option<String>> {
    Command::new("blkid")
        .args(["-s", "TYPE", "-o", "value"])
        .arg(partition)
        .run_with_status_checker(|output| match output.code {
            0 => Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_owned())),
            2 => Ok(None),
            _ => anyhow::bail!("Bad exit code"),
        })
        .await
        .with_context(|| format!("Failed to probe {partition:?}"))
}

async fn print_partitions(device: &Path, root_partition: u32) -> Result<()> {
    // wait for udev before walking the partitions
    loopdev::resolve_partition(device, root_partition).await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Partition", "Device", "Type", "Encrypted", "Cipher", "Key slots"]);

    for index in 1.. {
        let Some(partition) = loopdev::partition_candidates(device, index)
            .into_iter()
            .find(|candidate| candidate.exists())
        else {
            break;
        };

        let encrypted = luks2::is_luks(&partition).await?;
        let info = if encrypted {
            Some(luks2::dump(&partition).await?)
        } else {
            None
        };

        table.add_row(vec![
            if index == root_partition {
                Cell::new(format!("{index} (root)"))
            } else {
                Cell::new(index)
            },
            Cell::new(partition.display()),
            match probe_type(&partition).await? {
                Some(fs_type) => Cell::new(fs_type),
                None => Cell::new("<unknown>").fg(Color::DarkGrey),
            },
            if encrypted {
                Cell::new("True").fg(Color::Green)
            } else {
                Cell::new("False").fg(Color::Yellow)
            },
            match info.as_ref().and_then(|info| info.cipher.as_deref()) {
                Some(cipher) => Cell::new(cipher),
                None => Cell::new("<none>").fg(Color::DarkGrey),
            },
            match &info {
                Some(info) => Cell::new(info.keyslots),
                None => Cell::new("-").fg(Color::DarkGrey),
            },
        ]);
    }

    println!("{table}");
    Ok(())
}

#[async_trait]
impl super::Command for InspectCommand {
    async fn run(&self) -> Result<()> {
        let image = &self.inspect_options.image;
        preflight::check_source_image(image)?;
        preflight::check_root()?;

        let mut stack = ResourceStack::default();
        let attachment = loopdev::LoopAttachment::attach(image, true).await?;
        stack.push(Resource::Loop(attachment.path().to_path_buf()));

        let result = print_partitions(attachment.path(), self.inspect_options.root_partition).await;
        stack.unwind().await;
        result
    }
}

use anyhow::Result;
use async_trait::async_trait;

use crate::{cli::KeygenOptions, keyfile::KeyfileGenerator};

pub struct KeygenCommand {
    pub keygen_options: KeygenOptions,
}

#[async_trait]
impl super::Command for KeygenCommand {
    async fn run(&self) -> Result<()> {
        let keyfile = KeyfileGenerator::new(&self.keygen_options.key_dir)
            .generate()
            .await?;

        println!("{}", keyfile.path().display());
        println!("{}", keyfile.id());
        Ok(())
    }
}

use std::{
    marker::{Send, Sync},
    process::Stdio,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt as _, process::Command};

/// Captured result of an external tool, handed to status checkers.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait CheckCommandOutput {
    /// Run to completion, failing on a non-zero exit code. Returns stdout.
    async fn run(&mut self) -> Result<Vec<u8>>;

    /// Like [`CheckCommandOutput::run`], with stdout decoded and trimmed.
    async fn run_get_string(&mut self) -> Result<String>;

    async fn run_with_input(&mut self, input_bytes: Option<&[u8]>) -> Result<Vec<u8>>;

    /// Run and let `f` decide what an exit code means.
    async fn run_with_status_checker<R>(
        &mut self,
        f: impl for<'a> Fn(&'a ToolOutput) -> Result<R> + Send + Sync,
    ) -> Result<R>;

    async fn run_with_input_and_status_checker<R>(
        &mut self,
        input_bytes: Option<&[u8]>,
        f: impl for<'a> Fn(&'a ToolOutput) -> Result<R> + Send + Sync,
    ) -> Result<R>;
}

#[async_trait]
impl CheckCommandOutput for Command {
    async fn run(&mut self) -> Result<Vec<u8>> {
        self.run_with_input(None).await
    }

    async fn run_get_string(&mut self) -> Result<String> {
        let stdout = self.run().await?;
        Ok(String::from_utf8(stdout)
            .context("command printed non UTF-8 output")?
            .trim()
            .to_owned())
    }

    async fn run_with_input(&mut self, input_bytes: Option<&[u8]>) -> Result<Vec<u8>> {
        self.run_with_input_and_status_checker(input_bytes, |output| {
            if output.code != 0 {
                bail!("Bad exit code")
            } else {
                Ok(output.stdout.clone())
            }
        })
        .await
    }

    async fn run_with_status_checker<R>(
        &mut self,
        f: impl for<'a> Fn(&'a ToolOutput) -> Result<R> + Send + Sync,
    ) -> Result<R> {
        self.run_with_input_and_status_checker(None, f).await
    }

    async fn run_with_input_and_status_checker<R>(
        &mut self,
        input_bytes: Option<&[u8]>,
        f: impl for<'a> Fn(&'a ToolOutput) -> Result<R> + Send + Sync,
    ) -> Result<R> {
        // tools are parsed by message text in a few places
        self.env("LC_ALL", "C");

        tracing::trace!(cmd=?self.as_std(), "run external cmd");

        let output = async {
            if input_bytes.is_some() {
                self.stdin(Stdio::piped());
            } else {
                self.stdin(Stdio::null());
            }
            self.stdout(Stdio::piped());
            self.stderr(Stdio::piped());

            let mut child = self.kill_on_drop(true).spawn()?;

            if let Some(input_bytes) = input_bytes {
                let mut stdin = child.stdin.take().context("No stdin")?;
                stdin.write_all(input_bytes).await?;
                stdin.shutdown().await?;
            }

            child.wait_with_output().await.map_err(anyhow::Error::from)
        }
        .await
        .with_context(|| format!("Failed to spawn external command: {:?}", self.as_std()))?;

        let Some(code) = output.status.code() else {
            return Err(anyhow!("killed by signal"))
                .with_context(|| format!("cmd: {:?}", self.as_std()));
        };

        let output = ToolOutput {
            code,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        f(&output).with_context(|| {
            format!(
                "\ncmd: {:?}\nexit code: {}\nstdout: {}\nstderr: {}",
                self.as_std(),
                output.code,
                indent_multiline(&String::from_utf8_lossy(&output.stdout)),
                indent_multiline(&String::from_utf8_lossy(&output.stderr)),
            )
        })
    }
}

fn indent_multiline(text: &str) -> String {
    let text = text.trim_end();
    if text.contains('\n') {
        format!("(multi-line)\n\t{}", text.replace('\n', "\n\t"))
    } else {
        text.to_owned()
    }
}

//! Running the pipeline many times over one source image.
//!
//! Every unit gets its own keyfile and output name. Units run concurrently up
//! to `jobs`; a failed unit never stops its siblings. Completed units are
//! recorded in a CSV manifest by a single writer task.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt as _;
use tokio::{io::AsyncWriteExt as _, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    config::Settings,
    error::PipelineError,
    keyfile::{Keyfile, KeyfileGenerator},
    pipeline::{Pipeline, RunReport, Unit},
    types::Passphrase,
};

pub const MANIFEST_HEADER: &str = "image_file,keyfile_uuid,keyfile_path,created_at";

/// Runs one unit. [`Pipeline`] is the real implementation.
#[async_trait]
pub trait UnitRunner: Send + Sync {
    async fn run(&self, unit: &Unit, cancel: &CancellationToken)
        -> Result<RunReport, PipelineError>;
}

#[async_trait]
impl UnitRunner for Pipeline {
    async fn run(
        &self,
        unit: &Unit,
        cancel: &CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        Pipeline::run(self, unit, cancel).await
    }
}

/// Output file names `{prefix}{index}.img`, indices starting at 1 and padded
/// to at least three digits.
pub fn unit_names(prefix: &str, count: usize) -> Vec<String> {
    let width = count.to_string().len().max(3);
    (1..=count)
        .map(|index| format!("{prefix}{index:0width$}.img"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub image_file: String,
    pub keyfile_uuid: String,
    pub keyfile_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl ManifestEntry {
    pub fn new(output: &Path, keyfile: &Keyfile) -> Self {
        Self {
            image_file: output
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| output.display().to_string()),
            keyfile_uuid: keyfile.id().to_owned(),
            keyfile_path: keyfile.path().to_path_buf(),
            created_at: Utc::now(),
        }
    }

    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{}\n",
            csv_field(&self.image_file),
            csv_field(&self.keyfile_uuid),
            csv_field(&self.keyfile_path.display().to_string()),
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

/// Owns the manifest file. Rows are appended in the order they arrive.
pub struct ManifestWriter {
    tx: mpsc::Sender<ManifestEntry>,
    handle: JoinHandle<Result<usize>>,
}

impl ManifestWriter {
    pub async fn spawn(path: &Path) -> Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open manifest {path:?}"))?;

        if file.metadata().await?.len() == 0 {
            file.write_all(format!("{MANIFEST_HEADER}\n").as_bytes())
                .await?;
            file.flush().await?;
        }

        let (tx, mut rx) = mpsc::channel::<ManifestEntry>(16);
        let path = path.to_path_buf();
        let handle = tokio::spawn(async move {
            let mut rows = 0;
            while let Some(entry) = rx.recv().await {
                file.write_all(entry.to_csv_row().as_bytes())
                    .await
                    .with_context(|| format!("Failed to append to manifest {path:?}"))?;
                file.flush().await?;
                rows += 1;
            }
            Ok(rows)
        });

        Ok(Self { tx, handle })
    }

    pub fn sender(&self) -> mpsc::Sender<ManifestEntry> {
        self.tx.clone()
    }

    /// Wait for every queued row to be written. Returns the number of rows.
    pub async fn finish(self) -> Result<usize> {
        drop(self.tx);
        self.handle.await.context("Manifest writer panicked")?
    }
}

pub struct BatchPlan {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub count: usize,
    pub jobs: usize,
    pub manifest: PathBuf,
    pub settings: Arc<Settings>,
    /// Shared by every unit. Only allowed when units run one at a time.
    pub passphrase: Option<Passphrase>,
}

impl BatchPlan {
    pub fn outputs(&self) -> Vec<PathBuf> {
        unit_names(&self.prefix, self.count)
            .into_iter()
            .map(|name| self.output_dir.join(name))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub index: usize,
    pub output: PathBuf,
    pub category: &'static str,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: Vec<RunReport>,
    pub failures: Vec<UnitFailure>,
    pub manifest_rows: usize,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

async fn run_unit(
    index: usize,
    output: PathBuf,
    plan: &BatchPlan,
    runner: &dyn UnitRunner,
    manifest: mpsc::Sender<ManifestEntry>,
    cancel: &CancellationToken,
) -> Result<RunReport, UnitFailure> {
    let fail = |error: PipelineError| UnitFailure {
        index,
        output: output.clone(),
        category: error.category(),
        message: format!("{:#}", anyhow::Error::from(error)),
    };

    if cancel.is_cancelled() {
        return Err(fail(PipelineError::Interrupted));
    }

    let (keyfile, generated) = match &plan.settings.keyfile {
        Some(path) => (Keyfile::load(path).await, false),
        None => (
            KeyfileGenerator::new(&plan.settings.key_dir).generate().await,
            true,
        ),
    };
    let keyfile = keyfile.map_err(|e| fail(PipelineError::Precondition(e)))?;

    let unit = Unit {
        source: plan.source.clone(),
        output: output.clone(),
        keyfile,
        passphrase: plan.passphrase.clone(),
        settings: plan.settings.clone(),
    };

    match runner.run(&unit, cancel).await {
        Ok(report) => {
            let entry = ManifestEntry::new(&unit.output, &unit.keyfile);
            if manifest.send(entry).await.is_err() {
                tracing::error!("Manifest writer is gone, row for {output:?} was not recorded");
            }
            tracing::info!(keyfile = %unit.keyfile.id(), "Unit done");
            Ok(report)
        }
        Err(error) => {
            // the key never protected anything that still exists
            if generated {
                if let Err(e) = tokio::fs::remove_file(unit.keyfile.path()).await {
                    tracing::warn!(
                        "Failed to remove unused keyfile {:?}: {e}",
                        unit.keyfile.path()
                    );
                }
            }
            Err(fail(error))
        }
    }
}

pub async fn run_batch(
    plan: &BatchPlan,
    runner: Arc<dyn UnitRunner>,
    cancel: &CancellationToken,
) -> Result<BatchSummary> {
    let writer = ManifestWriter::spawn(&plan.manifest).await?;
    let jobs = plan.jobs.clamp(1, plan.count.max(1));
    tracing::info!(
        count = plan.count,
        jobs,
        "Encrypting {:?} into {:?}",
        plan.source,
        plan.output_dir
    );

    let results: Vec<_> = futures::stream::iter(plan.outputs().into_iter().enumerate())
        .map(|(i, output)| {
            let index = i + 1;
            let span = tracing::info_span!("unit", index);
            let runner = runner.clone();
            let sender = writer.sender();
            async move { run_unit(index, output, plan, &*runner, sender, cancel).await }
                .instrument(span)
        })
        .buffer_unordered(jobs)
        .collect()
        .await;

    let mut summary = BatchSummary {
        manifest_rows: writer.finish().await?,
        ..Default::default()
    };
    for result in results {
        match result {
            Ok(report) => summary.succeeded.push(report),
            Err(failure) => {
                tracing::error!(
                    index = failure.index,
                    category = failure.category,
                    "Unit for {:?} failed: {}",
                    failure.output,
                    failure.message
                );
                summary.failures.push(failure);
            }
        }
    }
    summary.failures.sort_by_key(|failure| failure.index);
    summary.succeeded.sort_by(|a, b| a.output.cmp(&b.output));

    tracing::info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failures.len(),
        "Batch finished, manifest at {:?}",
        plan.manifest
    );
    Ok(summary)
}

#[cfg(test)]
pub mod tests {

    use std::collections::HashSet;

    use rstest::rstest;

    use super::*;
    use crate::{cli::EncryptOptions, config::ImageConfig};

    /// Copies the source and optionally fails chosen outputs.
    #[derive(Default)]
    struct CopyRunner {
        fail_names: Vec<String>,
    }

    #[async_trait]
    impl UnitRunner for CopyRunner {
        async fn run(
            &self,
            unit: &Unit,
            cancel: &CancellationToken,
        ) -> Result<RunReport, PipelineError> {
            if cancel.is_cancelled() {
                return Err(PipelineError::Interrupted);
            }
            let name = unit.output.file_name().unwrap().to_string_lossy();
            if self.fail_names.iter().any(|n| *n == name) {
                return Err(PipelineError::Container(anyhow::anyhow!("luksFormat failed")));
            }
            let size = tokio::fs::copy(&unit.source, &unit.output)
                .await
                .map_err(|e| PipelineError::ResourceAcquisition(e.into()))?;
            Ok(RunReport {
                output: unit.output.clone(),
                size,
            })
        }
    }

    fn plan(dir: &Path, count: usize, jobs: usize) -> Result<BatchPlan> {
        let source = dir.join("raspios.img");
        std::fs::write(&source, vec![7u8; 4096])?;
        let output_dir = dir.join("out");
        std::fs::create_dir_all(&output_dir)?;
        let mut settings = Settings::resolve(ImageConfig::default(), &EncryptOptions::default());
        settings.key_dir = dir.join("keys");

        Ok(BatchPlan {
            source,
            manifest: output_dir.join("manifest.csv"),
            output_dir,
            prefix: "device_".into(),
            count,
            jobs,
            settings: Arc::new(settings),
            passphrase: None,
        })
    }

    #[rstest]
    #[case(1, "device_001.img", "device_001.img")]
    #[case(10, "device_001.img", "device_010.img")]
    #[case(1000, "device_0001.img", "device_1000.img")]
    fn test_unit_names(#[case] count: usize, #[case] first: &str, #[case] last: &str) {
        let names = unit_names("device_", count);
        assert_eq!(names.len(), count);
        assert_eq!(names.first().unwrap(), first);
        assert_eq!(names.last().unwrap(), last);
    }

    #[test]
    fn test_csv_row() {
        let entry = ManifestEntry {
            image_file: "device_001.img".into(),
            keyfile_uuid: "0b8e5a8c-6f1e-4c5e-9b7a-2c3d4e5f6a7b".into(),
            keyfile_path: "keys/a,b.lek".into(),
            created_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        assert_eq!(
            entry.to_csv_row(),
            "device_001.img,0b8e5a8c-6f1e-4c5e-9b7a-2c3d4e5f6a7b,\"keys/a,b.lek\",2024-05-01T10:00:00Z\n"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_of_ten() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let plan = plan(dir.path(), 10, 4)?;

        let summary = run_batch(&plan, Arc::new(CopyRunner::default()), &CancellationToken::new())
            .await?;
        assert!(summary.is_success());
        assert_eq!(summary.succeeded.len(), 10);
        assert_eq!(summary.manifest_rows, 10);

        for name in unit_names("device_", 10) {
            assert!(plan.output_dir.join(&name).is_file(), "{name}");
        }
        assert!(plan.output_dir.join("device_010.img").is_file());

        let manifest = std::fs::read_to_string(&plan.manifest)?;
        let mut lines = manifest.lines();
        assert_eq!(lines.next(), Some(MANIFEST_HEADER));
        let rows: Vec<Vec<&str>> = lines.map(|line| line.split(',').collect()).collect();
        assert_eq!(rows.len(), 10);

        let ids: HashSet<_> = rows.iter().map(|row| row[1]).collect();
        assert_eq!(ids.len(), 10);
        for row in &rows {
            assert!(Path::new(row[2]).is_file());
            assert!(row[2].ends_with(&format!("{}.lek", row[1])));
            DateTime::parse_from_rfc3339(row[3])?;
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_does_not_abort_siblings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let plan = plan(dir.path(), 5, 2)?;
        let runner = CopyRunner {
            fail_names: vec!["device_003.img".into()],
        };

        let summary = run_batch(&plan, Arc::new(runner), &CancellationToken::new()).await?;
        assert!(!summary.is_success());
        assert_eq!(summary.succeeded.len(), 4);
        assert_eq!(summary.manifest_rows, 4);
        assert_eq!(summary.failures.len(), 1);

        let failure = &summary.failures[0];
        assert_eq!(failure.index, 3);
        assert_eq!(failure.category, "container");
        assert_eq!(failure.output, plan.output_dir.join("device_003.img"));
        assert!(failure.message.contains("luksFormat failed"));

        // the failed unit leaves no keyfile behind
        assert_eq!(std::fs::read_dir(&plan.settings.key_dir)?.count(), 4);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_manifest_header_written_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let plan = plan(dir.path(), 2, 1)?;
        let runner: Arc<dyn UnitRunner> = Arc::new(CopyRunner::default());

        run_batch(&plan, runner.clone(), &CancellationToken::new()).await?;
        let second = BatchPlan {
            source: plan.source.clone(),
            manifest: plan.manifest.clone(),
            output_dir: plan.output_dir.clone(),
            prefix: "spare_".into(),
            count: plan.count,
            jobs: plan.jobs,
            settings: plan.settings.clone(),
            passphrase: None,
        };
        run_batch(&second, runner, &CancellationToken::new()).await?;

        let manifest = std::fs::read_to_string(&plan.manifest)?;
        assert_eq!(manifest.matches(MANIFEST_HEADER).count(), 1);
        assert_eq!(manifest.lines().count(), 5);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_batch_generates_no_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let plan = plan(dir.path(), 3, 1)?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = run_batch(&plan, Arc::new(CopyRunner::default()), &cancel).await?;
        assert_eq!(summary.failures.len(), 3);
        assert!(summary
            .failures
            .iter()
            .all(|failure| failure.category == "interrupted"));
        assert!(!plan.settings.key_dir.exists());
        Ok(())
    }
}

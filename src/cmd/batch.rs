use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use async_trait::async_trait;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use crate::{
    batch::{run_batch, BatchPlan, BatchSummary},
    cli::BatchArgs,
    error::PipelineError,
    fs::luks2,
    pipeline::Pipeline,
    preflight,
};

pub struct BatchCommand {
    pub config: Option<PathBuf>,
    pub batch_args: BatchArgs,
}

fn print_summary(summary: &BatchSummary) {
    if summary.failures.is_empty() {
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Unit", "Image", "Category", "Error"]);
    for failure in &summary.failures {
        table.add_row(vec![
            Cell::new(failure.index),
            Cell::new(failure.output.display()),
            Cell::new(failure.category).fg(Color::Red),
            Cell::new(&failure.message),
        ]);
    }
    eprintln!("{table}");
}

#[async_trait]
impl super::Command for BatchCommand {
    async fn run(&self) -> Result<()> {
        let args = &self.batch_args;
        let settings = super::load_settings(self.config.as_deref(), &args.options).await?;

        if args.count == 0 {
            bail!(PipelineError::Precondition(anyhow::anyhow!(
                "--count must be at least 1"
            )));
        }
        if settings.keyfile.is_some() && args.count > 1 {
            bail!(PipelineError::Precondition(anyhow::anyhow!(
                "A fixed --keyfile cannot be shared by {} images, every image needs its own key",
                args.count
            )));
        }
        let jobs = args.jobs.unwrap_or_else(num_cpus::get).clamp(1, args.count);

        let mut plan = BatchPlan {
            source: args.image.clone(),
            output_dir: args.output_dir.clone(),
            prefix: args.prefix.clone(),
            count: args.count,
            jobs,
            manifest: args
                .manifest
                .clone()
                .unwrap_or_else(|| args.output_dir.join("manifest.csv")),
            settings: Arc::new(settings),
            passphrase: None,
        };

        let outputs = plan.outputs();
        let outputs: Vec<_> = outputs.iter().map(PathBuf::as_path).collect();
        preflight::check_all(&plan.settings, &plan.source, &outputs, jobs)
            .map_err(PipelineError::Precondition)?;

        if plan.settings.passphrase {
            plan.passphrase = Some(luks2::prompt_passphrase().await?);
        }

        let cancel = super::cancel_on_signal()?;
        let summary = run_batch(&plan, Arc::new(Pipeline::default()), &cancel).await;
        cancel.cancel();
        let summary = summary?;

        print_summary(&summary);
        println!(
            "{} of {} images encrypted, manifest: {}",
            summary.succeeded.len(),
            plan.count,
            plan.manifest.display()
        );

        if !summary.is_success() {
            bail!(
                "{} of {} units failed",
                summary.failures.len(),
                plan.count
            );
        }

        if !plan.settings.keep_original {
            tokio::fs::remove_file(&plan.source).await?;
            tracing::info!("Removed source image {:?}", plan.source);
        }
        Ok(())
    }
}

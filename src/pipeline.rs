use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::cleaning::{clean, CleaningReport, PriceRange};
use crate::config::{CleaningArgs, TrackingConfig, JOB_TYPE};
use crate::dataset::Dataset;
use crate::error::{CleaningError, Result};
use crate::observability;
use crate::tracking::{
    Artifact, LoggedArtifact, ResolvedArtifact, Run, RunSettings, RunStatus, TrackingBackend,
};

/// Result of a complete cleaning run
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub input: ResolvedArtifact,
    pub output: LoggedArtifact,
    pub report: CleaningReport,
}

/// Metadata for the artifact the pipeline publishes
#[derive(Debug, Clone)]
pub struct OutputSpec<'s> {
    pub name: &'s str,
    pub artifact_type: &'s str,
    pub description: &'s str,
}

/// fetch → load → transform → publish, inside one tracking run.
pub struct CleaningPipeline<'a> {
    backend: &'a dyn TrackingBackend,
    settings: RunSettings,
    scratch_dir: Option<PathBuf>,
}

impl<'a> CleaningPipeline<'a> {
    pub fn new(backend: &'a dyn TrackingBackend, settings: RunSettings) -> Self {
        Self {
            backend,
            settings,
            scratch_dir: None,
        }
    }

    pub fn from_config(backend: &'a dyn TrackingBackend, config: &TrackingConfig) -> Self {
        Self::new(
            backend,
            RunSettings {
                project: config.project.clone(),
                job_type: JOB_TYPE.to_string(),
                group: config.group.clone(),
            },
        )
    }

    /// Parent directory for the temporary output file (system temp dir if unset).
    pub fn with_scratch_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    #[instrument(skip(self, args), fields(input = %args.input_artifact, output = %args.output_artifact))]
    pub async fn run(&self, args: &CleaningArgs) -> Result<PipelineResult> {
        args.validate()?;
        let run_config = args.to_run_config()?;

        let mut run = Run::init(self.backend, self.settings.clone()).await?;
        let outcome = match run.update_config(run_config).await {
            Ok(()) => self.execute(&run, args).await.map_err(|e| (failed_stage(&e), e)),
            Err(e) => Err(("config", CleaningError::from(e))),
        };

        match outcome {
            Ok((input, output, report)) => {
                run.update_summary(report.summary());
                run.update_summary(serde_json::json!({
                    "input_artifact": input.qualified_name(),
                    "output_artifact": output.qualified_name(),
                }));
                let run_id = run.id();
                run.finish(RunStatus::Finished).await?;
                Ok(PipelineResult {
                    run_id,
                    input,
                    output,
                    report,
                })
            }
            Err((stage, e)) => {
                observability::stage::failed(stage);
                error!(stage, "Cleaning run failed: {}", e);
                run.update_summary(serde_json::json!({
                    "failed_stage": stage,
                    "error": e.to_string(),
                }));
                if let Err(finish_err) = run.finish(RunStatus::Failed).await {
                    warn!("Could not record run failure: {}", finish_err);
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run: &Run<'_>,
        args: &CleaningArgs,
    ) -> Result<(ResolvedArtifact, LoggedArtifact, CleaningReport)> {
        // Step 1: Fetch
        info!("Download artifact {}", args.input_artifact);
        let t_fetch = Instant::now();
        let input = run
            .use_artifact(&args.input_artifact)
            .await
            .map_err(|e| CleaningError::from_fetch(&args.input_artifact, e))?;
        let local_path = input.file()?;
        observability::stage::duration("fetch", t_fetch.elapsed().as_secs_f64());

        // Step 2: Load
        let t_load = Instant::now();
        let dataset = Dataset::load_csv(&local_path)?;
        info!(rows = dataset.len(), columns = dataset.columns.len(), "Dataset loaded");
        observability::stage::duration("load", t_load.elapsed().as_secs_f64());

        // Step 3: Transform
        info!("Perform basic cleanup");
        let t_clean = Instant::now();
        let (cleaned, report) = clean(dataset, PriceRange::new(args.min_price, args.max_price))?;
        observability::rows::record_report(&report);
        observability::stage::duration("transform", t_clean.elapsed().as_secs_f64());

        // Step 4: Publish
        info!("Save the cleaned file as artifact {}", args.output_artifact);
        let t_publish = Instant::now();
        let output = publish(
            run,
            &cleaned,
            &OutputSpec {
                name: &args.output_artifact,
                artifact_type: &args.output_type,
                description: &args.output_description,
            },
            self.scratch_dir.as_deref(),
        )
        .await?;
        observability::stage::duration("publish", t_publish.elapsed().as_secs_f64());

        Ok((input, output, report))
    }
}

/// Serialize `dataset` into a scoped temporary directory and publish it. The
/// directory is removed on return, after the upload is durable or has failed.
pub async fn publish(
    run: &Run<'_>,
    dataset: &Dataset,
    output: &OutputSpec<'_>,
    scratch_dir: Option<&Path>,
) -> Result<LoggedArtifact> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("basic_cleaning-");
    let tmp_dir = match scratch_dir {
        Some(dir) => builder.tempdir_in(dir)?,
        None => builder.tempdir()?,
    };

    let mut artifact = Artifact::new(output.name, output.artifact_type, output.description)
        .map_err(CleaningError::from_publish)?;
    let temp_path = tmp_dir.path().join(output.name);
    dataset.write_csv(&temp_path)?;
    let size_bytes = std::fs::metadata(&temp_path)?.len();
    artifact
        .add_file(&temp_path)
        .map_err(CleaningError::from_publish)?;

    let pending = run
        .log_artifact(&artifact)
        .await
        .map_err(CleaningError::from_publish)?;
    // The temp directory must outlive the upload
    let logged = pending.wait().await.map_err(CleaningError::from_publish)?;

    tmp_dir.close()?;
    observability::artifacts::published(logged.reused, size_bytes);
    info!(artifact = %logged.qualified_name(), reused = logged.reused, "Artifact published");
    Ok(logged)
}

fn failed_stage(err: &CleaningError) -> &'static str {
    match err {
        CleaningError::ArtifactNotFound { .. } | CleaningError::Tracking(_) => "fetch",
        CleaningError::Parse(_) | CleaningError::Csv(_) => "load",
        CleaningError::Publish(_) => "publish",
        CleaningError::Config(_) | CleaningError::Toml(_) => "config",
        CleaningError::Io(_) | CleaningError::Json(_) => "io",
    }
}

use anyhow::Context;
use clap::Parser;
use tracing::info;

use basic_cleaning::config::{CleaningArgs, TrackingConfig};
use basic_cleaning::pipeline::CleaningPipeline;
use basic_cleaning::tracking::LocalTracker;
use basic_cleaning::{logging, observability};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CleaningArgs::parse();

    // Load environment variables
    dotenv::dotenv().ok();

    // Keep the guard alive so file logs are flushed on exit
    let _log_guard = logging::init_logging();
    let metrics = observability::init_metrics();

    let config = TrackingConfig::load(args.tracking_config.as_deref())
        .context("loading tracking configuration")?;
    info!(root = %config.root.display(), project = %config.project, "Opening tracking store");
    let tracker = LocalTracker::from_config(&config).context("opening tracking store")?;

    let pipeline = CleaningPipeline::from_config(&tracker, &config);
    let outcome = pipeline.run(&args).await;

    if let (Some(handle), Some(url)) = (&metrics, &config.pushgateway_url) {
        observability::push_to_gateway(handle, url, &args.output_artifact).await;
    }

    let result = outcome?;
    info!(
        run_id = %result.run_id,
        input = %result.input.qualified_name(),
        output = %result.output.qualified_name(),
        kept = result.report.kept_rows,
        dropped = result.report.dropped_rows(),
        "Cleaning finished"
    );
    Ok(())
}

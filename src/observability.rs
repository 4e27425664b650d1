//! Pipeline metrics.
//!
//! Metrics go through the `metrics` facade. The binary installs a Prometheus
//! recorder and, when a Pushgateway is configured, pushes the rendered
//! snapshot once the run is over. Without a recorder every call is a no-op.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

use crate::cleaning::{CleaningReport, DateOutcome};

pub const PUSH_JOB: &str = "basic_cleaning";

/// Install the global Prometheus recorder.
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder install failed (possibly already installed): {}", e);
            None
        }
    }
}

pub mod stage {
    use super::*;

    /// Wall-clock time of one pipeline stage
    pub fn duration(stage: &'static str, secs: f64) {
        histogram!("basic_cleaning_stage_duration_seconds", "stage" => stage).record(secs);
    }

    pub fn failed(stage: &'static str) {
        counter!("basic_cleaning_stage_failures_total", "stage" => stage).increment(1);
    }
}

pub mod rows {
    use super::*;

    pub fn record_report(report: &CleaningReport) {
        counter!("basic_cleaning_rows_input_total").increment(report.input_rows as u64);
        counter!("basic_cleaning_rows_kept_total").increment(report.kept_rows as u64);
        for (_, reason) in report.dropped() {
            counter!("basic_cleaning_rows_dropped_total", "reason" => reason.as_str()).increment(1);
        }
        counter!("basic_cleaning_last_review_nulled_total")
            .increment(report.count_dates(DateOutcome::Nulled) as u64);
    }
}

pub mod artifacts {
    use super::*;

    pub fn published(reused: bool, size_bytes: u64) {
        let outcome = if reused { "reused" } else { "new_version" };
        counter!("basic_cleaning_artifacts_published_total", "outcome" => outcome).increment(1);
        histogram!("basic_cleaning_artifact_bytes").record(size_bytes as f64);
    }
}

/// Push the current snapshot to a Prometheus Pushgateway.
pub async fn push_to_gateway(handle: &PrometheusHandle, base_url: &str, instance: &str) {
    let push_url = format!(
        "{}/metrics/job/{}/instance/{}",
        base_url.trim_end_matches('/'),
        PUSH_JOB,
        instance
    );
    let body = handle.render();

    let client = reqwest::Client::new();
    let push_res = client
        .post(&push_url)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .send()
        .await;

    match push_res {
        Ok(r) if r.status().is_success() => {
            info!("Pushed metrics to Pushgateway");
        }
        Ok(r) => {
            warn!("Pushgateway push responded with status {}", r.status().as_u16());
        }
        Err(e) => {
            warn!("Failed to push metrics to Pushgateway: {}", e);
        }
    }
}

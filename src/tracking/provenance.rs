use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use uuid::Uuid;

use super::TrackingError;

pub const PROVENANCE_LOG: &str = "provenance.ndjson";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceKind {
    RunStarted {
        project: String,
        job_type: String,
        group: Option<String>,
    },
    ConfigUpdated {
        config: serde_json::Value,
    },
    ArtifactUsed {
        artifact: String,
        digest: String,
    },
    ArtifactLogged {
        artifact: String,
        artifact_type: String,
        digest: String,
        reused: bool,
    },
    ArtifactCommitted {
        artifact: String,
    },
    RunFinished {
        status: String,
        summary: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub at: DateTime<Utc>,
    pub run_id: Uuid,
    #[serde(flatten)]
    pub kind: ProvenanceKind,
}

impl ProvenanceEvent {
    pub fn now(run_id: Uuid, kind: ProvenanceKind) -> Self {
        Self {
            at: Utc::now(),
            run_id,
            kind,
        }
    }
}

/// Append one event as a JSON line.
pub fn append(path: &Path, event: &ProvenanceEvent) -> Result<(), TrackingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(event)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Force appended events to disk.
pub fn sync(path: &Path) -> Result<(), TrackingError> {
    if path.exists() {
        OpenOptions::new().append(true).open(path)?.sync_all()?;
    }
    Ok(())
}

/// Read all events, skipping lines that do not parse.
pub fn read_all(path: &Path) -> Result<Vec<ProvenanceEvent>, TrackingError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str(&line) {
            events.push(event);
        }
    }
    Ok(events)
}

//! Experiment-tracking contract used by the cleaning pipeline.
//!
//! The pipeline only talks to [`TrackingBackend`] through a [`Run`]; the
//! filesystem store in [`local`] is the implementation shipped with the crate.

pub mod cas;
pub mod local;
pub mod meta;
pub mod provenance;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use local::LocalTracker;

static REFERENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?P<first>[A-Za-z0-9_.-]+)/)?(?:(?P<second>[A-Za-z0-9_.-]+)/)?(?P<name>[A-Za-z0-9_.-]+)(?::(?P<alias>[A-Za-z0-9_.-]+))?$",
    )
    .expect("artifact reference pattern is valid")
});

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("artifact name pattern is valid"));

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^v(\d+)$").expect("version alias pattern is valid"));

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact reference '{0}'")]
    InvalidReference(String),

    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("artifact has {count} files, expected exactly one: {artifact}")]
    NotSingleFile { artifact: String, count: usize },

    #[error("content changed before upload completed: {0}")]
    Corrupt(String),

    #[error("remote store error: {0}")]
    Remote(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for TrackingError {
    fn from(err: reqwest::Error) -> Self {
        TrackingError::Remote(err.to_string())
    }
}

/// Artifact and file names become path components, so `.` and `..` are out.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name) && !name.chars().all(|c| c == '.')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alias {
    Latest,
    Version(u32),
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alias::Latest => write!(f, "latest"),
            Alias::Version(v) => write!(f, "v{}", v),
        }
    }
}

/// `[entity/][project/]name[:alias]`; a missing alias means `latest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub entity: Option<String>,
    pub project: Option<String>,
    pub name: String,
    pub alias: Alias,
}

impl ArtifactRef {
    pub fn parse(reference: &str) -> Result<Self, TrackingError> {
        let invalid = || TrackingError::InvalidReference(reference.to_string());
        let caps = REFERENCE_RE.captures(reference.trim()).ok_or_else(invalid)?;

        let first = caps.name("first").map(|m| m.as_str().to_string());
        let second = caps.name("second").map(|m| m.as_str().to_string());
        // A single prefix is the project
        let (entity, project) = match (first, second) {
            (Some(e), Some(p)) => (Some(e), Some(p)),
            (Some(p), None) | (None, Some(p)) => (None, Some(p)),
            (None, None) => (None, None),
        };

        let alias = match caps.name("alias").map(|m| m.as_str()) {
            None | Some("latest") => Alias::Latest,
            Some(a) => {
                let v = VERSION_RE
                    .captures(a)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .ok_or_else(invalid)?;
                Alias::Version(v)
            }
        };

        Ok(Self {
            entity,
            project,
            name: caps["name"].to_string(),
            alias,
        })
    }

    pub fn project_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.project.as_deref().unwrap_or(default)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(e) = &self.entity {
            write!(f, "{}/", e)?;
        }
        if let Some(p) = &self.project {
            write!(f, "{}/", p)?;
        }
        write!(f, "{}:{}", self.name, self.alias)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Name of the file inside the artifact
    pub name: String,
    pub source: PathBuf,
}

/// An artifact record under construction: metadata plus attached files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub artifact_type: String,
    pub description: String,
    pub files: Vec<ArtifactFile>,
}

impl Artifact {
    pub fn new(name: &str, artifact_type: &str, description: &str) -> Result<Self, TrackingError> {
        if !is_valid_name(name) {
            return Err(TrackingError::InvalidName(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            artifact_type: artifact_type.to_string(),
            description: description.to_string(),
            files: Vec::new(),
        })
    }

    /// Attach a file under its own file name.
    pub fn add_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), TrackingError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TrackingError::InvalidName(path.display().to_string()))?;
        self.add_named_file(path, name)
    }

    pub fn add_named_file<P: AsRef<Path>>(&mut self, path: P, name: &str) -> Result<(), TrackingError> {
        if !is_valid_name(name) {
            return Err(TrackingError::InvalidName(name.to_string()));
        }
        self.files.retain(|f| f.name != name);
        self.files.push(ArtifactFile {
            name: name.to_string(),
            source: path.as_ref().to_path_buf(),
        });
        Ok(())
    }
}

/// A committed artifact version materialized on local disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedArtifact {
    pub project: String,
    pub name: String,
    pub version: u32,
    pub artifact_type: String,
    pub digest: String,
    pub dir: PathBuf,
    pub files: Vec<String>,
}

impl ResolvedArtifact {
    /// Path of the artifact's only file.
    pub fn file(&self) -> Result<PathBuf, TrackingError> {
        match self.files.as_slice() {
            [single] => Ok(self.dir.join(single)),
            other => Err(TrackingError::NotSingleFile {
                artifact: self.qualified_name(),
                count: other.len(),
            }),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}:v{}", self.project, self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedFile {
    pub name: String,
    pub source: PathBuf,
    pub digest: String,
    pub size_bytes: u64,
}

/// Handle for a submitted, not yet durable, artifact version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTicket {
    pub run_id: Uuid,
    pub project: String,
    pub name: String,
    pub version: u32,
    pub artifact_type: String,
    pub digest: String,
    pub files: Vec<StagedFile>,
    /// Same content as an existing version; nothing to upload
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedArtifact {
    pub project: String,
    pub name: String,
    pub version: u32,
    pub artifact_type: String,
    pub digest: String,
    pub reused: bool,
}

impl LoggedArtifact {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}:v{}", self.project, self.name, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "finished" => Some(RunStatus::Finished),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub project: String,
    pub job_type: String,
    pub group: Option<String>,
    pub config: serde_json::Value,
    pub summary: serde_json::Value,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub project: String,
    pub job_type: String,
    pub group: Option<String>,
}

/// Operations a tracking service must provide.
#[async_trait]
pub trait TrackingBackend: Send + Sync {
    async fn start_run(&self, run: &RunRecord) -> Result<(), TrackingError>;

    async fn update_config(&self, run: &RunRecord) -> Result<(), TrackingError>;

    /// Resolve a reference to a committed version on local disk and record
    /// that `run` consumed it.
    async fn resolve_artifact(
        &self,
        run: &RunRecord,
        reference: &ArtifactRef,
    ) -> Result<ResolvedArtifact, TrackingError>;

    /// Register a new version. The attached files must stay on disk until
    /// [`TrackingBackend::await_upload`] returns.
    async fn submit_artifact(
        &self,
        run: &RunRecord,
        artifact: &Artifact,
    ) -> Result<UploadTicket, TrackingError>;

    /// Returns once the version is durable and visible to readers.
    async fn await_upload(&self, ticket: &UploadTicket) -> Result<LoggedArtifact, TrackingError>;

    async fn finish_run(&self, run: &RunRecord) -> Result<(), TrackingError>;
}

/// A submitted artifact; the upload is only guaranteed durable after `wait`.
#[must_use = "the upload is not durable until `wait` returns"]
pub struct PendingUpload<'a> {
    backend: &'a dyn TrackingBackend,
    ticket: UploadTicket,
}

impl<'a> PendingUpload<'a> {
    pub fn ticket(&self) -> &UploadTicket {
        &self.ticket
    }

    pub async fn wait(self) -> Result<LoggedArtifact, TrackingError> {
        self.backend.await_upload(&self.ticket).await
    }
}

/// A tracking session. Open with [`Run::init`], close with [`Run::finish`].
pub struct Run<'a> {
    backend: &'a dyn TrackingBackend,
    record: RunRecord,
}

impl<'a> Run<'a> {
    pub async fn init(
        backend: &'a dyn TrackingBackend,
        settings: RunSettings,
    ) -> Result<Run<'a>, TrackingError> {
        let record = RunRecord {
            id: Uuid::new_v4(),
            project: settings.project,
            job_type: settings.job_type,
            group: settings.group,
            config: serde_json::json!({}),
            summary: serde_json::json!({}),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };
        backend.start_run(&record).await?;
        info!(run_id = %record.id, project = %record.project, job_type = %record.job_type, "Run started");
        Ok(Run { backend, record })
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Merge `values` (a JSON object) into the run config.
    pub async fn update_config(&mut self, values: serde_json::Value) -> Result<(), TrackingError> {
        merge_object(&mut self.record.config, values);
        self.backend.update_config(&self.record).await
    }

    /// Merge `values` into the summary written when the run finishes.
    pub fn update_summary(&mut self, values: serde_json::Value) {
        merge_object(&mut self.record.summary, values);
    }

    pub async fn use_artifact(&self, reference: &str) -> Result<ResolvedArtifact, TrackingError> {
        let parsed = ArtifactRef::parse(reference)?;
        let resolved = self.backend.resolve_artifact(&self.record, &parsed).await?;
        info!(artifact = %resolved.qualified_name(), "Using artifact");
        Ok(resolved)
    }

    pub async fn log_artifact(&self, artifact: &Artifact) -> Result<PendingUpload<'a>, TrackingError> {
        let ticket = self.backend.submit_artifact(&self.record, artifact).await?;
        info!(
            artifact = %artifact.name,
            version = ticket.version,
            reused = ticket.reused,
            "Artifact submitted"
        );
        Ok(PendingUpload {
            backend: self.backend,
            ticket,
        })
    }

    pub async fn finish(mut self, status: RunStatus) -> Result<RunRecord, TrackingError> {
        self.record.status = status;
        self.record.finished_at = Some(Utc::now());
        if status == RunStatus::Failed {
            warn!(run_id = %self.record.id, "Run finished with failure");
        }
        self.backend.finish_run(&self.record).await?;
        info!(run_id = %self.record.id, status = status.as_str(), "Run finished");
        Ok(self.record)
    }
}

fn merge_object(target: &mut serde_json::Value, values: serde_json::Value) {
    match (target, values) {
        (serde_json::Value::Object(t), serde_json::Value::Object(v)) => {
            t.extend(v);
        }
        (t, v) => *t = v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_forms() {
        let r = ArtifactRef::parse("sample.csv:latest").unwrap();
        assert_eq!(r.name, "sample.csv");
        assert_eq!(r.alias, Alias::Latest);
        assert_eq!(r.project, None);

        let r = ArtifactRef::parse("nyc_airbnb/sample.csv:v3").unwrap();
        assert_eq!(r.project.as_deref(), Some("nyc_airbnb"));
        assert_eq!(r.entity, None);
        assert_eq!(r.alias, Alias::Version(3));

        let r = ArtifactRef::parse("team/nyc_airbnb/sample.csv").unwrap();
        assert_eq!(r.entity.as_deref(), Some("team"));
        assert_eq!(r.project.as_deref(), Some("nyc_airbnb"));
        assert_eq!(r.alias, Alias::Latest);
        assert_eq!(r.to_string(), "team/nyc_airbnb/sample.csv:latest");
    }

    #[test]
    fn test_parse_reference_rejects_garbage() {
        for bad in ["", "a/b/c/d:latest", "sample.csv:prod", "sample csv:latest", "x:v"] {
            assert!(
                matches!(ArtifactRef::parse(bad), Err(TrackingError::InvalidReference(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_artifact_names_are_validated() {
        assert!(Artifact::new("clean_sample.csv", "clean_sample", "d").is_ok());
        for bad in ["clean sample", ".", "..", "..."] {
            assert!(
                matches!(
                    Artifact::new(bad, "clean_sample", "d"),
                    Err(TrackingError::InvalidName(_))
                ),
                "{bad} should be rejected"
            );
        }
        assert!(Artifact::new(".clean.csv", "clean_sample", "d").is_ok());

        let mut artifact = Artifact::new("clean_sample.csv", "clean_sample", "d").unwrap();
        assert!(matches!(
            artifact.add_named_file("/tmp/x.csv", ".."),
            Err(TrackingError::InvalidName(_))
        ));
    }

    #[test]
    fn test_add_file_replaces_same_name() {
        let mut artifact = Artifact::new("clean_sample.csv", "clean_sample", "d").unwrap();
        artifact.add_file("/tmp/a/clean_sample.csv").unwrap();
        artifact.add_file("/tmp/b/clean_sample.csv").unwrap();
        assert_eq!(artifact.files.len(), 1);
        assert_eq!(artifact.files[0].source, PathBuf::from("/tmp/b/clean_sample.csv"));
    }

    #[test]
    fn test_resolved_file_requires_single_file() {
        let mut resolved = ResolvedArtifact {
            project: "p".to_string(),
            name: "n".to_string(),
            version: 0,
            artifact_type: "t".to_string(),
            digest: "d".to_string(),
            dir: PathBuf::from("/store/p/n/v0"),
            files: vec!["n.csv".to_string()],
        };
        assert_eq!(resolved.file().unwrap(), PathBuf::from("/store/p/n/v0/n.csv"));

        resolved.files.push("other.csv".to_string());
        assert!(matches!(
            resolved.file(),
            Err(TrackingError::NotSingleFile { count: 2, .. })
        ));
    }

    #[test]
    fn test_merge_object() {
        let mut config = serde_json::json!({"a": 1});
        merge_object(&mut config, serde_json::json!({"b": 2, "a": 3}));
        assert_eq!(config, serde_json::json!({"a": 3, "b": 2}));
    }
}

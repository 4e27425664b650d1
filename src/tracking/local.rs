//! Filesystem tracking store.
//!
//! Layout under the root directory:
//!
//! - `cas/sha256/ab/cd/<hex>` content-addressed file blobs
//! - `meta.db` SQLite index of runs, versions, files and lineage
//! - `provenance.ndjson` append-only run/artifact event log
//! - `artifacts/<project>/<name>/v<N>/` materialized downloads

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::cas::{self, RemoteCas};
use super::meta::TrackerMeta;
use super::provenance::{self, ProvenanceEvent, ProvenanceKind, PROVENANCE_LOG};
use super::{
    Alias, Artifact, ArtifactRef, LoggedArtifact, ResolvedArtifact, Run, RunRecord, RunSettings,
    RunStatus, StagedFile, TrackingBackend, TrackingError, UploadTicket,
};
use crate::config::TrackingConfig;

pub const IMPORT_JOB_TYPE: &str = "import_data";

pub struct LocalTracker {
    root: PathBuf,
    remote: Option<RemoteCas>,
}

impl LocalTracker {
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self, TrackingError> {
        let root = root.into();
        fs::create_dir_all(root.join("cas"))?;
        fs::create_dir_all(root.join("artifacts"))?;
        // Creates the schema
        TrackerMeta::open_at_root(&root)?;
        Ok(Self { root, remote: None })
    }

    pub fn from_config(config: &TrackingConfig) -> Result<Self, TrackingError> {
        let tracker = Self::open(&config.root)?;
        Ok(match &config.remote {
            Some(remote) => tracker.with_remote(RemoteCas::new(&remote.url, remote.token.clone())),
            None => tracker,
        })
    }

    pub fn with_remote(mut self, remote: RemoteCas) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn provenance_log(&self) -> PathBuf {
        self.root.join(PROVENANCE_LOG)
    }

    pub fn meta(&self) -> Result<TrackerMeta, TrackingError> {
        TrackerMeta::open_at_root(&self.root)
    }

    fn cas_root(&self) -> PathBuf {
        self.root.join("cas")
    }

    fn emit(&self, run: &RunRecord, kind: ProvenanceKind) -> Result<(), TrackingError> {
        provenance::append(&self.provenance_log(), &ProvenanceEvent::now(run.id, kind))
    }

    /// Publish a local file as a new artifact version under its own run.
    pub async fn import_file(
        &self,
        project: &str,
        path: &Path,
        name: &str,
        artifact_type: &str,
        description: &str,
    ) -> Result<LoggedArtifact, TrackingError> {
        let mut artifact = Artifact::new(name, artifact_type, description)?;
        artifact.add_named_file(path, name)?;

        let run = Run::init(
            self,
            RunSettings {
                project: project.to_string(),
                job_type: IMPORT_JOB_TYPE.to_string(),
                group: None,
            },
        )
        .await?;

        let logged = match run.log_artifact(&artifact).await {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };
        let status = if logged.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        run.finish(status).await?;
        logged
    }

    /// Make sure the blob for `digest` is present locally, pulling from the
    /// mirror when it is not.
    async fn ensure_blob(&self, digest: &str) -> Result<PathBuf, TrackingError> {
        let path = cas::blob_path(&self.cas_root(), digest)?;
        if path.exists() {
            return Ok(path);
        }
        let Some(remote) = &self.remote else {
            return Err(TrackingError::NotFound(format!("blob {}", digest)));
        };
        let bytes = remote
            .get(digest)
            .await?
            .ok_or_else(|| TrackingError::NotFound(format!("blob {}", digest)))?;
        if cas::digest_bytes(&bytes) != digest {
            return Err(TrackingError::Corrupt(format!("remote blob {}", digest)));
        }
        cas::write_cas(&self.cas_root(), &bytes)?;
        debug!(digest, "Pulled blob from mirror");
        Ok(path)
    }
}

#[async_trait]
impl TrackingBackend for LocalTracker {
    async fn start_run(&self, run: &RunRecord) -> Result<(), TrackingError> {
        self.meta()?.upsert_run(run)?;
        self.emit(
            run,
            ProvenanceKind::RunStarted {
                project: run.project.clone(),
                job_type: run.job_type.clone(),
                group: run.group.clone(),
            },
        )
    }

    async fn update_config(&self, run: &RunRecord) -> Result<(), TrackingError> {
        self.meta()?.upsert_run(run)?;
        self.emit(
            run,
            ProvenanceKind::ConfigUpdated {
                config: run.config.clone(),
            },
        )
    }

    #[instrument(skip(self, run, reference), fields(reference = %reference))]
    async fn resolve_artifact(
        &self,
        run: &RunRecord,
        reference: &ArtifactRef,
    ) -> Result<ResolvedArtifact, TrackingError> {
        let project = reference.project_or(&run.project).to_string();
        let row = {
            let meta = self.meta()?;
            match reference.alias {
                Alias::Latest => meta.latest_version(&project, &reference.name)?,
                Alias::Version(v) => meta
                    .get_version(&project, &reference.name, v)?
                    .filter(|row| row.committed),
            }
        }
        .ok_or_else(|| TrackingError::NotFound(reference.to_string()))?;

        let files = self.meta()?.version_files(&project, &row.name, row.version)?;
        let dir = self
            .root
            .join("artifacts")
            .join(&project)
            .join(&row.name)
            .join(format!("v{}", row.version));
        fs::create_dir_all(&dir)?;
        for file in &files {
            let blob = self.ensure_blob(&file.digest).await?;
            let target = dir.join(&file.file_name);
            fs::copy(&blob, &target)?;
        }

        self.meta()?
            .record_usage(run.id, &project, &row.name, row.version)?;

        let resolved = ResolvedArtifact {
            project,
            name: row.name,
            version: row.version,
            artifact_type: row.artifact_type,
            digest: row.digest,
            dir,
            files: files.into_iter().map(|f| f.file_name).collect(),
        };
        self.emit(
            run,
            ProvenanceKind::ArtifactUsed {
                artifact: resolved.qualified_name(),
                digest: resolved.digest.clone(),
            },
        )?;
        Ok(resolved)
    }

    #[instrument(skip(self, run, artifact), fields(artifact = %artifact.name))]
    async fn submit_artifact(
        &self,
        run: &RunRecord,
        artifact: &Artifact,
    ) -> Result<UploadTicket, TrackingError> {
        let mut files = Vec::with_capacity(artifact.files.len());
        for file in &artifact.files {
            let (digest, size_bytes) = cas::digest_file(&file.source)?;
            files.push(StagedFile {
                name: file.name.clone(),
                source: file.source.clone(),
                digest,
                size_bytes,
            });
        }
        let digest = cas::manifest_digest(files.iter().map(|f| (f.name.as_str(), f.digest.as_str())));

        let mut meta = self.meta()?;
        let latest = meta.latest_version(&run.project, &artifact.name)?;
        let ticket = match latest {
            Some(existing) if existing.digest == digest => {
                info!(version = existing.version, "Content unchanged, reusing version");
                if existing.artifact_type != artifact.artifact_type
                    || existing.description != artifact.description
                {
                    warn!(
                        version = existing.version,
                        kept_type = %existing.artifact_type,
                        requested_type = %artifact.artifact_type,
                        "Reused version keeps its original type and description"
                    );
                }
                UploadTicket {
                    run_id: run.id,
                    project: run.project.clone(),
                    name: artifact.name.clone(),
                    version: existing.version,
                    artifact_type: existing.artifact_type,
                    digest,
                    files,
                    reused: true,
                }
            }
            _ => {
                let ticket = UploadTicket {
                    run_id: run.id,
                    project: run.project.clone(),
                    name: artifact.name.clone(),
                    version: meta.next_version(&run.project, &artifact.name)?,
                    artifact_type: artifact.artifact_type.clone(),
                    digest,
                    files,
                    reused: false,
                };
                meta.insert_pending(&ticket, &artifact.description)?;
                ticket
            }
        };

        self.emit(
            run,
            ProvenanceKind::ArtifactLogged {
                artifact: format!("{}/{}:v{}", ticket.project, ticket.name, ticket.version),
                artifact_type: ticket.artifact_type.clone(),
                digest: ticket.digest.clone(),
                reused: ticket.reused,
            },
        )?;
        Ok(ticket)
    }

    #[instrument(skip(self, ticket), fields(artifact = %ticket.name, version = ticket.version))]
    async fn await_upload(&self, ticket: &UploadTicket) -> Result<LoggedArtifact, TrackingError> {
        let logged = LoggedArtifact {
            project: ticket.project.clone(),
            name: ticket.name.clone(),
            version: ticket.version,
            artifact_type: ticket.artifact_type.clone(),
            digest: ticket.digest.clone(),
            reused: ticket.reused,
        };
        if ticket.reused {
            return Ok(logged);
        }

        for file in &ticket.files {
            let blob = cas::write_cas_from_file(&self.cas_root(), &file.source, &file.digest)?;
            if let Some(remote) = &self.remote {
                let bytes = fs::read(&blob)?;
                if let Err(e) = remote.put(&file.digest, bytes).await {
                    warn!(file = %file.name, "Mirror upload failed");
                    return Err(e);
                }
            }
            debug!(file = %file.name, digest = %file.digest, size = file.size_bytes, "Blob stored");
        }

        self.meta()?
            .mark_committed(&ticket.project, &ticket.name, ticket.version)?;
        provenance::append(
            &self.provenance_log(),
            &ProvenanceEvent::now(
                ticket.run_id,
                ProvenanceKind::ArtifactCommitted {
                    artifact: logged.qualified_name(),
                },
            ),
        )?;
        info!(artifact = %logged.qualified_name(), "Artifact upload committed");
        Ok(logged)
    }

    async fn finish_run(&self, run: &RunRecord) -> Result<(), TrackingError> {
        self.meta()?.upsert_run(run)?;
        self.emit(
            run,
            ProvenanceKind::RunFinished {
                status: run.status.as_str().to_string(),
                summary: run.summary.clone(),
            },
        )?;
        provenance::sync(&self.provenance_log())
    }
}

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

use super::{RunRecord, RunStatus, StagedFile, TrackingError, UploadTicket};

pub const META_DB: &str = "meta.db";

/// A stored artifact version as read back from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRow {
    pub project: String,
    pub name: String,
    pub version: u32,
    pub artifact_type: String,
    pub description: String,
    pub digest: String,
    pub created_by: Uuid,
    pub committed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileRow {
    pub file_name: String,
    pub digest: String,
    pub size_bytes: u64,
}

/// SQLite index of runs and artifact versions under a tracking root.
pub struct TrackerMeta {
    conn: Connection,
}

impl TrackerMeta {
    pub fn open_at_root<P: AsRef<Path>>(root: P) -> Result<Self, TrackingError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let conn = Connection::open(root.join(META_DB))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS runs (
                id           TEXT PRIMARY KEY,
                project      TEXT NOT NULL,
                job_type     TEXT NOT NULL,
                group_name   TEXT,
                config       TEXT NOT NULL,
                summary      TEXT NOT NULL,
                status       TEXT NOT NULL,
                started_at   TEXT NOT NULL,
                finished_at  TEXT
            );
            CREATE TABLE IF NOT EXISTS artifacts (
                project        TEXT NOT NULL,
                name           TEXT NOT NULL,
                version        INTEGER NOT NULL,
                artifact_type  TEXT NOT NULL,
                description    TEXT NOT NULL,
                digest         TEXT NOT NULL,
                created_by     TEXT NOT NULL,
                created_at     TEXT NOT NULL,
                committed      INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (project, name, version)
            );
            CREATE TABLE IF NOT EXISTS artifact_files (
                project     TEXT NOT NULL,
                name        TEXT NOT NULL,
                version     INTEGER NOT NULL,
                file_name   TEXT NOT NULL,
                digest      TEXT NOT NULL,
                size_bytes  INTEGER NOT NULL,
                PRIMARY KEY (project, name, version, file_name)
            );
            CREATE TABLE IF NOT EXISTS artifact_usage (
                run_id   TEXT NOT NULL,
                project  TEXT NOT NULL,
                name     TEXT NOT NULL,
                version  INTEGER NOT NULL,
                used_at  TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    // Runs
    pub fn upsert_run(&self, run: &RunRecord) -> Result<(), TrackingError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO runs
                (id, project, job_type, group_name, config, summary, status, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id.to_string(),
                run.project,
                run.job_type,
                run.group,
                serde_json::to_string(&run.config)?,
                serde_json::to_string(&run.summary)?,
                run.status.as_str(),
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: Uuid) -> Result<Option<RunRecord>, TrackingError> {
        let row = self
            .conn
            .query_row(
                "SELECT project, job_type, group_name, config, summary, status, started_at, finished_at
                 FROM runs WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((project, job_type, group, config, summary, status, started_at, finished_at)) = row
        else {
            return Ok(None);
        };
        Ok(Some(RunRecord {
            id,
            project,
            job_type,
            group,
            config: serde_json::from_str(&config)?,
            summary: serde_json::from_str(&summary)?,
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            started_at: parse_time(&started_at).unwrap_or_else(Utc::now),
            finished_at: finished_at.as_deref().and_then(parse_time),
        }))
    }

    // Artifact versions
    pub fn latest_version(&self, project: &str, name: &str) -> Result<Option<VersionRow>, TrackingError> {
        self.query_version(
            "SELECT project, name, version, artifact_type, description, digest, created_by, committed
             FROM artifacts WHERE project = ?1 AND name = ?2 AND committed = 1
             ORDER BY version DESC LIMIT 1",
            params![project, name],
        )
    }

    pub fn get_version(&self, project: &str, name: &str, version: u32) -> Result<Option<VersionRow>, TrackingError> {
        self.query_version(
            "SELECT project, name, version, artifact_type, description, digest, created_by, committed
             FROM artifacts WHERE project = ?1 AND name = ?2 AND version = ?3",
            params![project, name, version],
        )
    }

    fn query_version<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<VersionRow>, TrackingError> {
        let row = self
            .conn
            .query_row(sql, params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })
            .optional()?;
        Ok(row.map(
            |(project, name, version, artifact_type, description, digest, created_by, committed)| VersionRow {
                project,
                name,
                version: version as u32,
                artifact_type,
                description,
                digest,
                created_by: Uuid::parse_str(&created_by).unwrap_or_default(),
                committed: committed != 0,
            },
        ))
    }

    /// Next free version number, counting pending versions too.
    pub fn next_version(&self, project: &str, name: &str) -> Result<u32, TrackingError> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(version) FROM artifacts WHERE project = ?1 AND name = ?2",
            params![project, name],
            |row| row.get(0),
        )?;
        Ok(max.map(|v| v as u32 + 1).unwrap_or(0))
    }

    /// Record a pending (uncommitted) version and its files in one transaction.
    pub fn insert_pending(&mut self, ticket: &UploadTicket, description: &str) -> Result<(), TrackingError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO artifacts
                (project, name, version, artifact_type, description, digest, created_by, created_at, committed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                ticket.project,
                ticket.name,
                ticket.version,
                ticket.artifact_type,
                description,
                ticket.digest,
                ticket.run_id.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        for file in &ticket.files {
            tx.execute(
                "INSERT INTO artifact_files (project, name, version, file_name, digest, size_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ticket.project,
                    ticket.name,
                    ticket.version,
                    file.name,
                    file.digest,
                    file.size_bytes as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn mark_committed(&self, project: &str, name: &str, version: u32) -> Result<(), TrackingError> {
        self.conn.execute(
            "UPDATE artifacts SET committed = 1 WHERE project = ?1 AND name = ?2 AND version = ?3",
            params![project, name, version],
        )?;
        Ok(())
    }

    pub fn version_files(&self, project: &str, name: &str, version: u32) -> Result<Vec<FileRow>, TrackingError> {
        let mut stmt = self.conn.prepare(
            "SELECT file_name, digest, size_bytes FROM artifact_files
             WHERE project = ?1 AND name = ?2 AND version = ?3 ORDER BY file_name",
        )?;
        let rows = stmt.query_map(params![project, name, version], |row| {
            Ok(FileRow {
                file_name: row.get(0)?,
                digest: row.get(1)?,
                size_bytes: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    // Lineage
    pub fn record_usage(&self, run_id: Uuid, project: &str, name: &str, version: u32) -> Result<(), TrackingError> {
        self.conn.execute(
            "INSERT INTO artifact_usage (run_id, project, name, version, used_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id.to_string(), project, name, version, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// (project, name, version) of every artifact `run_id` consumed.
    pub fn used_by(&self, run_id: Uuid) -> Result<Vec<(String, String, u32)>, TrackingError> {
        let mut stmt = self.conn.prepare(
            "SELECT project, name, version FROM artifact_usage WHERE run_id = ?1 ORDER BY used_at",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u32))
        })?;
        let mut used = Vec::new();
        for row in rows {
            used.push(row?);
        }
        Ok(used)
    }
}

impl StagedFile {
    pub fn as_row(&self) -> FileRow {
        FileRow {
            file_name: self.name.clone(),
            digest: self.digest.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ticket(version: u32, digest: &str) -> UploadTicket {
        UploadTicket {
            run_id: Uuid::new_v4(),
            project: "nyc_airbnb".to_string(),
            name: "sample.csv".to_string(),
            version,
            artifact_type: "raw_data".to_string(),
            digest: digest.to_string(),
            files: vec![StagedFile {
                name: "sample.csv".to_string(),
                source: "/tmp/sample.csv".into(),
                digest: "f00d".to_string(),
                size_bytes: 42,
            }],
            reused: false,
        }
    }

    #[test]
    fn test_versions_visible_only_when_committed() {
        let dir = tempdir().unwrap();
        let mut meta = TrackerMeta::open_at_root(dir.path()).unwrap();

        assert_eq!(meta.next_version("nyc_airbnb", "sample.csv").unwrap(), 0);
        meta.insert_pending(&ticket(0, "aaa"), "raw").unwrap();
        assert_eq!(meta.next_version("nyc_airbnb", "sample.csv").unwrap(), 1);
        assert!(meta.latest_version("nyc_airbnb", "sample.csv").unwrap().is_none());

        meta.mark_committed("nyc_airbnb", "sample.csv", 0).unwrap();
        let latest = meta.latest_version("nyc_airbnb", "sample.csv").unwrap().unwrap();
        assert_eq!(latest.version, 0);
        assert_eq!(latest.digest, "aaa");
        assert!(latest.committed);

        meta.insert_pending(&ticket(1, "bbb"), "raw").unwrap();
        assert_eq!(
            meta.latest_version("nyc_airbnb", "sample.csv").unwrap().unwrap().version,
            0
        );
        assert!(!meta.get_version("nyc_airbnb", "sample.csv", 1).unwrap().unwrap().committed);

        let files = meta.version_files("nyc_airbnb", "sample.csv", 0).unwrap();
        assert_eq!(files, vec![ticket(0, "aaa").files[0].as_row()]);
    }

    #[test]
    fn test_run_round_trip_and_usage() {
        let dir = tempdir().unwrap();
        let meta = TrackerMeta::open_at_root(dir.path()).unwrap();
        let run = RunRecord {
            id: Uuid::new_v4(),
            project: "nyc_airbnb".to_string(),
            job_type: "basic_cleaning".to_string(),
            group: None,
            config: serde_json::json!({"min_price": 10.0}),
            summary: serde_json::json!({}),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };
        meta.upsert_run(&run).unwrap();
        meta.record_usage(run.id, "nyc_airbnb", "sample.csv", 2).unwrap();

        let stored = meta.get_run(run.id).unwrap().unwrap();
        assert_eq!(stored.config, run.config);
        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(
            meta.used_by(run.id).unwrap(),
            vec![("nyc_airbnb".to_string(), "sample.csv".to_string(), 2)]
        );
        assert!(meta.get_run(Uuid::new_v4()).unwrap().is_none());
    }
}

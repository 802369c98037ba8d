//! Database module for persisting jobs, their events and the library index

mod schema;

pub use schema::*;

use crate::events::{JobEvent, JobEventType};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

/// Database wrapper for SQLite operations
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const JOB_COLUMNS: &str =
    "id, status, payload, message, output_path, created_at, updated_at";

impl Database {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                payload TEXT NOT NULL,
                message TEXT,
                output_path TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_steps (
                job_id TEXT NOT NULL REFERENCES jobs(id),
                step TEXT NOT NULL,
                status TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                message TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (job_id, step)
            );

            CREATE TABLE IF NOT EXISTS job_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                type TEXT NOT NULL,
                step TEXT,
                progress REAL,
                message TEXT,
                bytes_downloaded INTEGER,
                total_bytes INTEGER,
                ts TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS library_items (
                path TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                mtime TEXT NOT NULL,
                hash TEXT,
                platform TEXT,
                game_slug TEXT,
                source TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
            CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events(job_id, seq);
            "#,
        )?;

        Ok(())
    }

    /// Insert a new job record
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO jobs (id, kind, status, payload, message, output_path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            rusqlite::params![
                job.id,
                job.kind.as_str(),
                job.status.as_str(),
                serde_json::to_string(&job.payload)?,
                job.message,
                job.output_path,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Update job status, failure message and output path
    pub fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        message: Option<&str>,
        output_path: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            UPDATE jobs
            SET status = ?1,
                message = COALESCE(?2, message),
                output_path = COALESCE(?3, output_path),
                updated_at = ?4
            WHERE id = ?5
            "#,
            rusqlite::params![
                status.as_str(),
                message,
                output_path,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;

        Ok(())
    }

    /// Insert or update one step of a job
    pub fn upsert_step(&self, job_id: &str, step: &JobStep) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO job_steps (job_id, step, status, progress, message, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(job_id, step) DO UPDATE SET
                status = excluded.status,
                progress = excluded.progress,
                message = excluded.message,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![
                job_id,
                step.step,
                step.status.as_str(),
                step.progress,
                step.message,
                step.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    fn job_from_row(row: &Row<'_>) -> rusqlite::Result<(Job, String)> {
        let payload_json: String = row.get(2)?;
        let payload: JobPayload = serde_json::from_str(&payload_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let job = Job {
            id: row.get(0)?,
            kind: payload.kind(),
            status: JobStatus::from_str(&row.get::<_, String>(1)?),
            payload,
            message: row.get(3)?,
            output_path: row.get(4)?,
            created_at: parse_ts(&row.get::<_, String>(5)?),
            updated_at: parse_ts(&row.get::<_, String>(6)?),
            steps: Vec::new(),
        };
        let id = job.id.clone();
        Ok((job, id))
    }

    fn steps_for(conn: &Connection, job_id: &str) -> Result<Vec<JobStep>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT step, status, progress, message, updated_at
            FROM job_steps WHERE job_id = ?1
            ORDER BY rowid ASC
            "#,
        )?;
        let steps = stmt
            .query_map([job_id], |row| {
                Ok(JobStep {
                    step: row.get(0)?,
                    status: StepStatus::from_str(&row.get::<_, String>(1)?),
                    progress: row.get(2)?,
                    message: row.get(3)?,
                    updated_at: parse_ts(&row.get::<_, String>(4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(steps)
    }

    fn query_jobs(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, Self::job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut jobs = Vec::with_capacity(rows.len());
        for (mut job, id) in rows {
            job.steps = Self::steps_for(&conn, &id)?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Get one job with its steps
    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        Ok(self.query_jobs(&sql, &[&id])?.into_iter().next())
    }

    /// Get all jobs, newest first
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC");
        self.query_jobs(&sql, &[])
    }

    /// Jobs in `status`, oldest first
    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        self.query_jobs(&sql, &[&status.as_str()])
    }

    /// Append an event to the audit trail
    pub fn append_event(&self, event: &JobEvent) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO job_events (job_id, type, step, progress, message, bytes_downloaded, total_bytes, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            rusqlite::params![
                event.job_id,
                event.kind.as_str(),
                event.step,
                event.progress,
                event.message,
                event.bytes_downloaded,
                event.total_bytes,
                event.ts.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Events of one job in emission order
    pub fn events_for_job(&self, job_id: &str) -> Result<Vec<JobEvent>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            r#"
            SELECT job_id, type, step, progress, message, bytes_downloaded, total_bytes, ts
            FROM job_events WHERE job_id = ?1
            ORDER BY seq ASC
            "#,
        )?;

        let events = stmt
            .query_map([job_id], |row| {
                let kind: String = row.get(1)?;
                Ok((
                    kind,
                    JobEvent {
                        job_id: row.get(0)?,
                        kind: JobEventType::StepLog,
                        step: row.get(2)?,
                        progress: row.get(3)?,
                        message: row.get(4)?,
                        bytes_downloaded: row.get(5)?,
                        total_bytes: row.get(6)?,
                        ts: parse_ts(&row.get::<_, String>(7)?),
                    },
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(kind, mut event)| {
                event.kind = JobEventType::from_str(&kind)?;
                Some(event)
            })
            .collect();

        Ok(events)
    }

    /// Insert or replace the library record for `item.path`.
    ///
    /// A scan never demotes an installed item: `remote` entries keep their
    /// source and catalog slug when the same path is indexed locally.
    pub fn upsert_library_item(&self, item: &LibraryItem) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO library_items (path, size, mtime, hash, platform, game_slug, source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(path) DO UPDATE SET
                size = excluded.size,
                mtime = excluded.mtime,
                hash = COALESCE(excluded.hash, library_items.hash),
                platform = COALESCE(excluded.platform, library_items.platform),
                game_slug = CASE
                    WHEN library_items.source = 'remote' AND excluded.source = 'local'
                        THEN COALESCE(library_items.game_slug, excluded.game_slug)
                    ELSE COALESCE(excluded.game_slug, library_items.game_slug)
                END,
                source = CASE
                    WHEN library_items.source = 'remote' THEN 'remote'
                    ELSE excluded.source
                END
            "#,
            rusqlite::params![
                item.path,
                item.size,
                item.mtime.to_rfc3339(),
                item.hash,
                item.platform,
                item.game_slug,
                item.source.as_str(),
            ],
        )?;

        Ok(())
    }

    fn library_from_row(row: &Row<'_>) -> rusqlite::Result<LibraryItem> {
        Ok(LibraryItem {
            path: row.get(0)?,
            size: row.get(1)?,
            mtime: parse_ts(&row.get::<_, String>(2)?),
            hash: row.get(3)?,
            platform: row.get(4)?,
            game_slug: row.get(5)?,
            source: LibrarySource::from_str(&row.get::<_, String>(6)?),
        })
    }

    /// Get the library record for a path
    pub fn get_library_item(&self, path: &str) -> Result<Option<LibraryItem>> {
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                "SELECT path, size, mtime, hash, platform, game_slug, source FROM library_items WHERE path = ?1",
                [path],
                Self::library_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Get all library records ordered by path
    pub fn list_library(&self) -> Result<Vec<LibraryItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT path, size, mtime, hash, platform, game_slug, source FROM library_items ORDER BY path ASC",
        )?;
        let items = stmt
            .query_map([], Self::library_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }
}

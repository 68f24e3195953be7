use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::{instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::store::JobStore;
use crate::types::{Job, JobStatus};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and an index on `next_due_at` so
/// due-time queries stay cheap with thousands of jobs.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id            TEXT    NOT NULL PRIMARY KEY,
            name          TEXT    NOT NULL,
            kind          TEXT    NOT NULL,
            payload       TEXT    NOT NULL DEFAULT '{}',  -- opaque JSON
            schedule      TEXT    NOT NULL,               -- cron or PT interval
            status        TEXT    NOT NULL DEFAULT 'active',
            next_due_at   TEXT,                           -- RFC 3339 or NULL
            last_run_at   TEXT,
            run_count     INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_error    TEXT,
            max_runs      INTEGER,                        -- NULL means unlimited
            created_at    TEXT    NOT NULL,
            updated_at    TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_status_next_due ON jobs (status, next_due_at);
        ",
    )?;
    Ok(())
}

const SELECT_COLUMNS: &str = "SELECT id, name, kind, payload, schedule, status, next_due_at,
        last_run_at, run_count, failure_count, last_error, max_runs, created_at, updated_at
 FROM jobs";

const UPSERT: &str = "INSERT INTO jobs
     (id, name, kind, payload, schedule, status, next_due_at, last_run_at,
      run_count, failure_count, last_error, max_runs, created_at, updated_at)
     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
     ON CONFLICT(id) DO UPDATE SET
        name=excluded.name, kind=excluded.kind, payload=excluded.payload,
        schedule=excluded.schedule, status=excluded.status,
        next_due_at=excluded.next_due_at, last_run_at=excluded.last_run_at,
        run_count=excluded.run_count, failure_count=excluded.failure_count,
        last_error=excluded.last_error, max_runs=excluded.max_runs,
        updated_at=excluded.updated_at";

const RECORD_COUNTERS: &str = "UPDATE jobs SET
        run_count=?2, failure_count=?3, last_run_at=?4, last_error=?5, updated_at=?6
     WHERE id=?1";

const RECORD_TRANSITION: &str = "UPDATE jobs SET status=?2, next_due_at=?3
     WHERE id=?1 AND status='active' AND schedule=?4";

/// SQLite-backed [`JobStore`].
///
/// Wraps a single connection in a `Mutex`; every call is a short
/// synchronous statement, so holding the lock inside async methods is fine
/// for the single-process target.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fresh in-memory database, mainly for tests and previews.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, |row| Ok(row_to_job(row)))?;

        let mut jobs = Vec::new();
        for row in rows {
            match row? {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("skipping unreadable job row: {e}"),
            }
        }
        Ok(jobs)
    }
}

fn upsert(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        UPSERT,
        rusqlite::params![
            job.id,
            job.name,
            job.kind,
            job.payload,
            job.schedule,
            job.status.to_string(),
            job.next_due_at.map(|t| t.to_rfc3339()),
            job.last_run_at.map(|t| t.to_rfc3339()),
            job.run_count,
            job.failure_count,
            job.last_error,
            job.max_runs,
            job.created_at.to_rfc3339(),
            job.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Decode one row. The outer `rusqlite::Result` covers column access; the
/// inner one covers values this crate cannot interpret.
fn row_to_job(row: &Row<'_>) -> Result<Job> {
    let id: String = row.get(0)?;
    let status: String = row.get(5)?;
    let status: JobStatus = status
        .parse()
        .map_err(|e: String| SchedulerError::Store(format!("job {id}: {e}")))?;

    Ok(Job {
        name: row.get(1)?,
        kind: row.get(2)?,
        payload: row.get(3)?,
        schedule: row.get(4)?,
        status,
        next_due_at: parse_opt_ts(&id, row.get(6)?)?,
        last_run_at: parse_opt_ts(&id, row.get(7)?)?,
        run_count: row.get(8)?,
        failure_count: row.get(9)?,
        last_error: row.get(10)?,
        max_runs: row.get(11)?,
        created_at: parse_ts(&id, &row.get::<_, String>(12)?)?,
        updated_at: parse_ts(&id, &row.get::<_, String>(13)?)?,
        id,
    })
}

fn parse_ts(id: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Store(format!("job {id}: bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(id: &str, s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(id, &s)).transpose()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self))]
    async fn load_active(&self) -> Result<Vec<Job>> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE status = 'active' ORDER BY created_at"),
            [],
        )
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn save(&self, job: &Job) -> Result<Job> {
        {
            let conn = self.conn.lock().unwrap();
            upsert(&conn, job)?;
        }
        self.find_by_id(&job.id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: job.id.clone() })
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()))]
    async fn save_all(&self, jobs: &[Job]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for job in jobs {
            upsert(&tx, job)?;
        }
        tx.commit()?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn record_attempt(&self, job: &Job) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let touched = tx.execute(
            RECORD_COUNTERS,
            rusqlite::params![
                job.id,
                job.run_count,
                job.failure_count,
                job.last_run_at.map(|t| t.to_rfc3339()),
                job.last_error,
                job.updated_at.to_rfc3339(),
            ],
        )?;
        let applied = touched > 0
            && tx.execute(
                RECORD_TRANSITION,
                rusqlite::params![
                    job.id,
                    job.status.to_string(),
                    job.next_due_at.map(|t| t.to_rfc3339()),
                    job.schedule,
                ],
            )? > 0;
        tx.commit()?;
        Ok(applied)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                [id],
                |row| Ok(row_to_job(row)),
            )
            .optional()?;
        row.transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<Job>> {
        self.query(&format!("{SELECT_COLUMNS} ORDER BY created_at"), [])
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }
}

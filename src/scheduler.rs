//! SQLite-backed job scheduler: the persistent queue and its CRUD API.
//!
//! One scheduler holds one shared connection; every mutation is a single
//! transaction so concurrent callers (the dispatcher, executors, and CLI
//! invocations from other processes) only ever observe committed rows.
//!
//! Database path resolution order:
//!   1. `--db-path` CLI flag
//!   2. `SCHEDARRAY_DB` environment variable
//!   3. platform data directory (`~/.schedarray/scheduler.db` on Unix,
//!      local app data on Windows)

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use directories::BaseDirs;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use ulid::Ulid;

use crate::job::{Job, JobState, Metadata, META_STDERR, META_STDOUT};

/// Resolve the scheduler database path following the priority chain.
pub fn resolve_db_path(cli_path: Option<&str>) -> PathBuf {
    if let Some(path) = cli_path {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var("SCHEDARRAY_DB") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(base_dirs) = BaseDirs::new() {
        #[cfg(windows)]
        let base = base_dirs.data_local_dir().to_path_buf();
        #[cfg(not(windows))]
        let base = base_dirs.home_dir().to_path_buf();
        return base.join(".schedarray").join("scheduler.db");
    }

    PathBuf::from(".schedarray/scheduler.db")
}

/// Current UTC time as a fixed-width RFC 3339 string.
///
/// Microsecond precision keeps the strings lexicographically ordered, which
/// the `(priority DESC, submitted_at ASC)` dispatch query depends on.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Submission parameters for [`JobScheduler::submit_job`].
#[derive(Debug, Clone)]
pub struct SubmitJob {
    /// Shell command line, executed verbatim (never tokenized here).
    pub command: String,
    pub working_dir: Option<String>,
    /// Defaults to `job_<submit_epoch>` when not given.
    pub job_name: Option<String>,
    pub cpus: i64,
    pub memory: Option<String>,
    /// Timeout in seconds; `None` = no timeout.
    pub timeout: Option<i64>,
    pub priority: i64,
    pub max_retries: i64,
    pub output_file: Option<String>,
    pub error_file: Option<String>,
    pub metadata: Option<Metadata>,
}

impl Default for SubmitJob {
    fn default() -> Self {
        SubmitJob {
            command: String::new(),
            working_dir: None,
            job_name: None,
            cpus: 1,
            memory: None,
            timeout: None,
            priority: 0,
            max_retries: 3,
            output_file: None,
            error_file: None,
            metadata: None,
        }
    }
}

/// SQLite-backed scheduler (job submission, inspection, cancellation).
pub struct JobScheduler {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl JobScheduler {
    /// Open (creating if necessary) the scheduler database at `db_path`,
    /// or at the default location when `None`.
    pub fn open(db_path: Option<&Path>) -> Result<Self> {
        let db_path = match db_path {
            Some(p) => p.to_path_buf(),
            None => resolve_db_path(None),
        };

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("create scheduler data directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("open scheduler database {}", db_path.display()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // The CLI and a running service share this file from different
        // processes; wait out short write locks instead of failing.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let scheduler = JobScheduler {
            db_path,
            conn: Mutex::new(conn),
        };
        scheduler.init_schema()?;
        Ok(scheduler)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("scheduler connection poisoned");
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS job_queue (
                job_id TEXT PRIMARY KEY,
                job_name TEXT NOT NULL,
                command TEXT NOT NULL,
                working_dir TEXT,
                priority INTEGER DEFAULT 0,
                state TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                cpu_limit INTEGER,
                memory_limit TEXT,
                timeout INTEGER,
                retry_count INTEGER DEFAULT 0,
                max_retries INTEGER DEFAULT 3,
                output_file TEXT,
                error_file TEXT,
                return_code INTEGER,
                worker_id TEXT,
                metadata TEXT,
                user TEXT
             );
             CREATE TABLE IF NOT EXISTS worker_nodes (
                worker_id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                platform TEXT NOT NULL,
                max_cpus INTEGER,
                available_cpus INTEGER,
                max_memory TEXT,
                available_memory TEXT,
                state TEXT NOT NULL,
                last_heartbeat TEXT,
                registered_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS resource_usage (
                usage_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                cpu_usage REAL,
                memory_usage TEXT,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (job_id) REFERENCES job_queue(job_id)
             );
             CREATE INDEX IF NOT EXISTS idx_job_queue_state ON job_queue(state);
             CREATE INDEX IF NOT EXISTS idx_job_queue_priority
                 ON job_queue(priority DESC, submitted_at ASC);
             CREATE INDEX IF NOT EXISTS idx_job_queue_user ON job_queue(user);
             CREATE INDEX IF NOT EXISTS idx_worker_nodes_state ON worker_nodes(state);
             CREATE INDEX IF NOT EXISTS idx_resource_usage_job_id ON resource_usage(job_id);",
        )
        .with_context(|| format!("initialize scheduler schema at {}", self.db_path.display()))?;
        Ok(())
    }

    /// Submit a job, inserting one PENDING row. Returns the fresh job id.
    ///
    /// Storage failures propagate so the caller learns the job was not
    /// accepted.
    pub fn submit_job(&self, submit: SubmitJob) -> Result<String> {
        let job_id = Ulid::new().to_string();
        let job_name = submit
            .job_name
            .unwrap_or_else(|| format!("job_{}", Utc::now().timestamp()));
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let metadata_json = serde_json::to_string(&submit.metadata.unwrap_or_default())?;

        let conn = self.conn.lock().expect("scheduler connection poisoned");
        conn.execute(
            "INSERT INTO job_queue (
                job_id, job_name, command, working_dir, priority, state,
                submitted_at, cpu_limit, memory_limit, timeout,
                max_retries, output_file, error_file, metadata, user
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                job_id,
                job_name,
                submit.command,
                submit.working_dir,
                submit.priority,
                JobState::Pending.as_str(),
                now_iso(),
                submit.cpus,
                submit.memory,
                submit.timeout,
                submit.max_retries,
                submit.output_file,
                submit.error_file,
                metadata_json,
                user,
            ],
        )
        .with_context(|| format!("insert job {job_id}"))?;

        info!(job_id = %job_id, job_name = %job_name, "submitted job");
        Ok(job_id)
    }

    /// Fetch one job by id, or `None` if absent.
    pub fn get_job_status(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().expect("scheduler connection poisoned");
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE job_id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()
            .with_context(|| format!("read job {job_id}"))?;
        Ok(job)
    }

    /// Cancel a job. Returns `false` when the job is absent or already
    /// completed/cancelled.
    ///
    /// This only flips stored state; a running child is terminated by the
    /// dispatcher's next reconciliation pass.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().expect("scheduler connection poisoned");
        let tx = conn.transaction()?;

        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM job_queue WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;

        let state = match state {
            Some(s) => s,
            None => {
                warn!(job_id = %job_id, "cancel: job not found");
                return Ok(false);
            }
        };

        let current = JobState::parse(&state)
            .with_context(|| format!("job {job_id} has unknown state '{state}'"))?;
        if !current.can_transition_to(JobState::Cancelled) {
            warn!(job_id = %job_id, state = %state, "cancel: job already finished");
            return Ok(false);
        }

        tx.execute(
            "UPDATE job_queue SET state = ?1, completed_at = ?2 WHERE job_id = ?3",
            params![JobState::Cancelled.as_str(), now_iso(), job_id],
        )?;
        tx.commit()?;

        info!(job_id = %job_id, "cancelled job");
        Ok(true)
    }

    /// List jobs, optionally filtered by state and user, ordered by
    /// `(priority DESC, submitted_at ASC)` with insertion order breaking ties.
    pub fn list_jobs(
        &self,
        state: Option<JobState>,
        user: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE 1=1");
        let mut bound: Vec<Value> = Vec::new();

        if let Some(state) = state {
            sql.push_str(" AND state = ?");
            bound.push(Value::from(state.as_str().to_string()));
        }
        if let Some(user) = user {
            sql.push_str(" AND user = ?");
            bound.push(Value::from(user.to_string()));
        }
        sql.push_str(" ORDER BY priority DESC, submitted_at ASC, rowid ASC");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            bound.push(Value::Integer(limit));
        }

        let conn = self.conn.lock().expect("scheduler connection poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bound), job_from_row)?
            .collect::<rusqlite::Result<Vec<Job>>>()
            .context("list jobs")?;
        Ok(rows)
    }

    /// Pending jobs in dispatch order.
    pub fn pending_jobs(&self, limit: Option<i64>) -> Result<Vec<Job>> {
        self.list_jobs(Some(JobState::Pending), None, limit)
    }

    /// All jobs currently marked running.
    pub fn running_jobs(&self) -> Result<Vec<Job>> {
        self.list_jobs(Some(JobState::Running), None, None)
    }

    /// Atomically claim a pending job for a worker: PENDING → RUNNING with
    /// `started_at` and `worker_id` set, conditional on the row still being
    /// pending. Returns `false` when another claimant won the race.
    pub fn claim_job(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("scheduler connection poisoned");
        let changed = conn
            .execute(
                "UPDATE job_queue SET state = ?1, started_at = ?2, worker_id = ?3
                 WHERE job_id = ?4 AND state = ?5",
                params![
                    JobState::Running.as_str(),
                    now_iso(),
                    worker_id,
                    job_id,
                    JobState::Pending.as_str(),
                ],
            )
            .with_context(|| format!("claim job {job_id}"))?;
        Ok(changed == 1)
    }

    /// Post a state change for a job. The sole mutation path used by
    /// executors and reconciliation.
    ///
    /// Side effects: RUNNING sets `started_at`; any terminal state sets
    /// `completed_at`; captured stdout/stderr are merged into the metadata
    /// bag under the reserved keys and mirrored into the
    /// `output_file`/`error_file` columns. Illegal transitions (out of a
    /// terminal state) are refused with `false`, which is what keeps an
    /// executor's late FAILED from overwriting an external cancel.
    pub fn update_job_state(
        &self,
        job_id: &str,
        new_state: JobState,
        return_code: Option<i64>,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().expect("scheduler connection poisoned");
        let tx = conn.transaction()?;

        let row: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT state, metadata FROM job_queue WHERE job_id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (current_token, metadata_json) = match row {
            Some(r) => r,
            None => {
                warn!(job_id = %job_id, "update_job_state: job not found");
                return Ok(false);
            }
        };

        let current = JobState::parse(&current_token)
            .with_context(|| format!("job {job_id} has unknown state '{current_token}'"))?;
        if !current.can_transition_to(new_state) {
            warn!(
                job_id = %job_id,
                from = current.as_str(),
                to = new_state.as_str(),
                "update_job_state: illegal transition refused"
            );
            return Ok(false);
        }

        let now = now_iso();
        let mut sets: Vec<&str> = vec!["state = ?"];
        let mut bound: Vec<Value> = vec![Value::from(new_state.as_str().to_string())];

        if new_state == JobState::Running {
            sets.push("started_at = ?");
            bound.push(Value::from(now.clone()));
        } else if new_state.is_terminal() {
            sets.push("completed_at = ?");
            bound.push(Value::from(now.clone()));
        }

        if let Some(code) = return_code {
            sets.push("return_code = ?");
            bound.push(Value::Integer(code));
        }

        if stdout.is_some() || stderr.is_some() {
            let mut metadata: Metadata = metadata_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            if let Some(text) = stdout {
                metadata.insert(META_STDOUT.to_string(), text.into());
                sets.push("output_file = ?");
                bound.push(Value::from(text.to_string()));
            }
            if let Some(text) = stderr {
                metadata.insert(META_STDERR.to_string(), text.into());
                sets.push("error_file = ?");
                bound.push(Value::from(text.to_string()));
            }
            sets.push("metadata = ?");
            bound.push(Value::from(serde_json::to_string(&metadata)?));
        }

        bound.push(Value::from(job_id.to_string()));
        let sql = format!(
            "UPDATE job_queue SET {} WHERE job_id = ?",
            sets.join(", ")
        );
        tx.execute(&sql, params_from_iter(bound))?;
        tx.commit()?;
        Ok(true)
    }

    /// Count of jobs per state token.
    pub fn job_counts(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn.lock().expect("scheduler connection poisoned");
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM job_queue GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, i64)>>>()
            .context("count jobs by state")?;
        Ok(rows.into_iter().collect())
    }

    /// Delete a job row. Refused (returns `false`) while the job is running.
    pub fn delete_job(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().expect("scheduler connection poisoned");
        let tx = conn.transaction()?;

        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM job_queue WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;

        let state = match state {
            Some(s) => s,
            None => {
                warn!(job_id = %job_id, "delete: job not found");
                return Ok(false);
            }
        };

        if state == JobState::Running.as_str() {
            warn!(job_id = %job_id, "delete: refusing to delete running job");
            return Ok(false);
        }

        tx.execute("DELETE FROM job_queue WHERE job_id = ?1", params![job_id])?;
        tx.commit()?;

        info!(job_id = %job_id, "deleted job");
        Ok(true)
    }
}

const JOB_COLUMNS: &str = "job_id, job_name, command, working_dir, priority, state, \
     submitted_at, started_at, completed_at, cpu_limit, memory_limit, timeout, \
     retry_count, max_retries, output_file, error_file, return_code, worker_id, \
     metadata, user";

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let state_token: String = row.get(5)?;
    let state = JobState::parse(&state_token).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown persisted state: {state_token}"),
            )),
        )
    })?;

    let metadata_raw: Option<String> = row.get(18)?;
    let metadata: Metadata = metadata_raw
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    Ok(Job {
        job_id: row.get(0)?,
        job_name: row.get(1)?,
        command: row.get(2)?,
        working_dir: row.get(3)?,
        priority: row.get(4)?,
        state,
        submitted_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        cpu_limit: row.get::<_, Option<i64>>(9)?.unwrap_or(1),
        memory_limit: row.get(10)?,
        timeout: row.get(11)?,
        retry_count: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
        max_retries: row.get::<_, Option<i64>>(13)?.unwrap_or(3),
        output_file: row.get(14)?,
        error_file: row.get(15)?,
        return_code: row.get(16)?,
        worker_id: row.get(17)?,
        metadata,
        user: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
    })
}

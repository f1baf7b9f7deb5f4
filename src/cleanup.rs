//! Implementation of the `cleanup` sub-command.
//!
//! Bulk-deletes terminal jobs. With no state flag the sweep covers
//! completed, failed, and cancelled jobs; `--timeout` opts the timeout state
//! in. `--older-than-days N` keeps anything that finished more recently.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::job::JobState;
use crate::scheduler::{resolve_db_path, JobScheduler};

/// Options for the `cleanup` sub-command.
#[derive(Debug, Default)]
pub struct CleanupOpts<'a> {
    pub db_path: Option<&'a str>,
    pub json: bool,
    pub completed: bool,
    pub failed: bool,
    pub cancelled: bool,
    pub timeout: bool,
    pub older_than_days: Option<i64>,
}

/// Execute `cleanup`: delete matching terminal jobs, print how many went.
pub fn execute(opts: CleanupOpts) -> Result<i32> {
    let mut states: Vec<JobState> = Vec::new();
    if opts.completed {
        states.push(JobState::Completed);
    }
    if opts.failed {
        states.push(JobState::Failed);
    }
    if opts.cancelled {
        states.push(JobState::Cancelled);
    }
    if opts.timeout {
        states.push(JobState::Timeout);
    }
    if states.is_empty() {
        states = vec![JobState::Completed, JobState::Failed, JobState::Cancelled];
    }

    let cutoff = opts
        .older_than_days
        .map(|days| Utc::now() - Duration::days(days));

    let scheduler = JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?;
    let mut deleted = 0u64;
    let mut failed = 0u64;

    for state in &states {
        for job in scheduler.list_jobs(Some(*state), None, None)? {
            if let Some(cutoff) = cutoff {
                if is_newer_than(job.completed_at.as_deref(), cutoff) {
                    debug!(job_id = %job.job_id, "cleanup: too recent, keeping");
                    continue;
                }
            }
            if scheduler.delete_job(&job.job_id)? {
                deleted += 1;
            } else {
                failed += 1;
            }
        }
    }

    if opts.json {
        let doc = serde_json::json!({
            "deleted": deleted,
            "failed": failed,
            "states": states.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("Deleted {deleted} job(s)");
        if failed > 0 {
            eprintln!("Failed to delete {failed} job(s)");
        }
    }
    Ok(0)
}

/// True when the completion timestamp parses and is after the cutoff.
/// Unparseable or missing timestamps are treated as old enough to delete.
fn is_newer_than(completed_at: Option<&str>, cutoff: DateTime<Utc>) -> bool {
    match completed_at {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => ts.with_timezone(&Utc) > cutoff,
            Err(_) => false,
        },
        None => false,
    }
}

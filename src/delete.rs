//! Implementation of the `delete` sub-command.
//!
//! Only jobs in a terminal state may be deleted; deleting a running job is
//! refused.

use anyhow::Result;

use crate::scheduler::{resolve_db_path, JobScheduler};

/// Options for the `delete` sub-command.
#[derive(Debug)]
pub struct DeleteOpts<'a> {
    pub db_path: Option<&'a str>,
    pub json: bool,
    pub job_id: &'a str,
}

/// Execute `delete`: exit 0 on success, 1 when refused or absent.
pub fn execute(opts: DeleteOpts) -> Result<i32> {
    let scheduler = JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?;
    let deleted = scheduler.delete_job(opts.job_id)?;

    if opts.json {
        let mut doc = serde_json::json!({
            "deleted": deleted,
            "job_id": opts.job_id,
        });
        if !deleted {
            doc["error"] = "Job not found or cannot be deleted".into();
        }
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else if deleted {
        println!("Deleted job {}", opts.job_id);
    } else {
        eprintln!("Failed to delete job {}", opts.job_id);
    }
    Ok(if deleted { 0 } else { 1 })
}

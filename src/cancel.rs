//! Implementation of the `cancel` sub-command.
//!
//! Cancelling only flips stored state. A running child is terminated by the
//! service's dispatcher within one poll interval of the flip.

use anyhow::Result;

use crate::scheduler::{resolve_db_path, JobScheduler};

/// Options for the `cancel` sub-command.
#[derive(Debug)]
pub struct CancelOpts<'a> {
    pub db_path: Option<&'a str>,
    pub json: bool,
    pub job_id: &'a str,
}

/// Execute `cancel`: exit 0 on success, 1 when the job is absent or already
/// finished.
pub fn execute(opts: CancelOpts) -> Result<i32> {
    let scheduler = JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?;
    let cancelled = scheduler.cancel_job(opts.job_id)?;

    if opts.json {
        let doc = serde_json::json!({
            "cancelled": cancelled,
            "job_id": opts.job_id,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else if cancelled {
        println!("Cancelled job {}", opts.job_id);
    } else {
        eprintln!("Failed to cancel job {}", opts.job_id);
    }
    Ok(if cancelled { 0 } else { 1 })
}

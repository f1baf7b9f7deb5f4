//! Implementation of the `counts` sub-command.

use anyhow::Result;

use crate::scheduler::{resolve_db_path, JobScheduler};

/// Options for the `counts` sub-command.
#[derive(Debug)]
pub struct CountsOpts<'a> {
    pub db_path: Option<&'a str>,
    pub json: bool,
}

/// Execute `counts`: print the number of jobs per state.
pub fn execute(opts: CountsOpts) -> Result<i32> {
    let scheduler = JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?;
    let counts = scheduler.job_counts()?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        println!("Job counts by state:");
        for (state, count) in &counts {
            println!("  {state}: {count}");
        }
    }
    Ok(0)
}

//! Implementation of the `status` sub-command.

use anyhow::Result;
use tracing::debug;

use crate::job::Job;
use crate::scheduler::{resolve_db_path, JobScheduler};

/// Options for the `status` sub-command.
#[derive(Debug)]
pub struct StatusOpts<'a> {
    pub db_path: Option<&'a str>,
    pub json: bool,
    pub job_id: &'a str,
}

/// Execute `status`: print one job, or exit 1 when it does not exist.
pub fn execute(opts: StatusOpts) -> Result<i32> {
    let scheduler = JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?;
    let job = match scheduler.get_job_status(opts.job_id)? {
        Some(job) => job,
        None => {
            if opts.json {
                let doc = serde_json::json!({
                    "error": format!("Job {} not found", opts.job_id),
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                eprintln!("Job {} not found", opts.job_id);
            }
            return Ok(1);
        }
    };

    debug!(job_id = %opts.job_id, state = job.state.as_str(), "status query");

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_human(&job);
    }
    Ok(0)
}

fn print_human(job: &Job) {
    println!("Job ID: {}", job.job_id);
    println!("Name: {}", job.job_name);
    println!("State: {}", job.state.as_str());
    println!("Submitted: {}", job.submitted_at);
    if let Some(started) = &job.started_at {
        println!("Started: {started}");
    }
    if let Some(completed) = &job.completed_at {
        println!("Completed: {completed}");
    }
    if let Some(code) = job.return_code {
        println!("Return code: {code}");
    }
    if let Some(dir) = &job.working_dir {
        println!("Working directory: {dir}");
    }
    if job.command.chars().count() > 100 {
        let head: String = job.command.chars().take(100).collect();
        println!("Command: {head}...");
    } else {
        println!("Command: {}", job.command);
    }
}

//! Implementation of the `submit` sub-command.
//!
//! The command text comes from `--command` verbatim or from the contents of
//! `--script FILE`; exactly one of the two must be given. The job is only
//! queued here; execution is the running service's business.

use anyhow::{Context, Result};
use std::path::Path;

use crate::scheduler::{resolve_db_path, JobScheduler, SubmitJob};

/// Options for the `submit` sub-command.
#[derive(Debug, Default)]
pub struct SubmitOpts<'a> {
    pub db_path: Option<&'a str>,
    pub json: bool,
    /// Script file whose contents become the command text.
    pub script: Option<&'a str>,
    /// Command line to execute, passed to the shell verbatim.
    pub command: Option<&'a str>,
    pub job_name: Option<&'a str>,
    pub working_dir: Option<&'a str>,
    pub cpus: i64,
    pub memory: Option<&'a str>,
    pub timeout: Option<i64>,
    pub priority: i64,
    pub output: Option<&'a str>,
    pub error: Option<&'a str>,
}

/// Execute `submit`: enqueue one job and print its id. Exit code 0, or an
/// error for missing/unreadable command input.
pub fn execute(opts: SubmitOpts) -> Result<i32> {
    let command = match (opts.script, opts.command) {
        (Some(script), _) => std::fs::read_to_string(Path::new(script))
            .with_context(|| format!("read script file {script}"))?,
        (None, Some(command)) => command.to_string(),
        (None, None) => {
            anyhow::bail!("either --script or --command must be provided")
        }
    };

    let scheduler = JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?;
    let job_id = scheduler.submit_job(SubmitJob {
        command,
        working_dir: opts.working_dir.map(str::to_string),
        job_name: opts.job_name.map(str::to_string),
        cpus: opts.cpus,
        memory: opts.memory.map(str::to_string),
        timeout: opts.timeout,
        priority: opts.priority,
        output_file: opts.output.map(str::to_string),
        error_file: opts.error.map(str::to_string),
        ..SubmitJob::default()
    })?;

    if opts.json {
        let doc = serde_json::json!({
            "job_id": job_id,
            "job_name": opts.job_name.unwrap_or(&job_id),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("Submitted job {job_id}");
        if let Some(name) = opts.job_name {
            println!("Job name: {name}");
        }
    }
    Ok(0)
}

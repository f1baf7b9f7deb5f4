//! Implementation of the `list` sub-command.
//!
//! Jobs print in dispatch order (priority descending, then submission time),
//! as a `squeue`-style table or a JSON array.

use anyhow::Result;

use crate::job::JobState;
use crate::scheduler::{resolve_db_path, JobScheduler};

/// Options for the `list` sub-command.
#[derive(Debug, Default)]
pub struct ListOpts<'a> {
    pub db_path: Option<&'a str>,
    pub json: bool,
    /// Filter by state token (pending, running, completed, ...).
    pub state: Option<&'a str>,
    pub user: Option<&'a str>,
    pub limit: Option<i64>,
}

/// Execute `list`: print matching jobs.
pub fn execute(opts: ListOpts) -> Result<i32> {
    let state = match opts.state {
        Some(token) => match JobState::parse(token) {
            Some(state) => Some(state),
            None => anyhow::bail!("unknown state filter: {token}"),
        },
        None => None,
    };

    let scheduler = JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?;
    let jobs = scheduler.list_jobs(state, opts.user, opts.limit)?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(0);
    }

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(0);
    }

    println!(
        "{:<40} {:<20} {:<12} {:<8} {:<20}",
        "Job ID", "Name", "State", "Priority", "Submitted"
    );
    println!("{}", "-".repeat(100));
    for job in &jobs {
        let id = clip(&job.job_id, 40);
        let name = clip(&job.job_name, 20);
        let submitted = if job.submitted_at.len() > 19 {
            &job.submitted_at[..19]
        } else {
            &job.submitted_at
        };
        println!(
            "{:<40} {:<20} {:<12} {:<8} {:<20}",
            id,
            name,
            job.state.as_str(),
            job.priority,
            submitted
        );
    }
    Ok(0)
}

fn clip(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let head: String = text.chars().take(width - 2).collect();
        format!("{head}..")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_leaves_short_strings_alone() {
        assert_eq!(clip("abc", 5), "abc");
        assert_eq!(clip("abcdef", 5), "abc..");
    }

    #[test]
    fn unknown_state_filter_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("scheduler.db");
        let err = execute(ListOpts {
            db_path: Some(db.to_str().unwrap()),
            state: Some("sleeping"),
            ..ListOpts::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("unknown state"));
    }
}

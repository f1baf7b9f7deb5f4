//! Implementation of the `service` sub-commands: start, status, stop.
//!
//! There is no IPC channel between processes. `service start` blocks and
//! runs the dispatcher; from any other process, `service status` reports the
//! authoritative in-process flag (false) plus the shared job counts, and
//! `service stop` is an idempotent no-op. Stopping a foreground service is
//! done with SIGINT/SIGTERM.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::scheduler::{resolve_db_path, JobScheduler};
use crate::service::Service;

/// Options for `service start`.
#[derive(Debug)]
pub struct StartOpts<'a> {
    pub db_path: Option<&'a str>,
    pub max_workers: Option<usize>,
    /// Seconds between dispatcher passes.
    pub poll_interval: f64,
}

/// Run the service in the foreground until a stop signal arrives.
/// Exit code 130 for SIGINT, 0 otherwise.
pub fn start(opts: StartOpts) -> Result<i32> {
    let scheduler = Arc::new(JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?);
    let mut service = Service::new(
        scheduler,
        opts.max_workers,
        Duration::from_secs_f64(opts.poll_interval.max(0.01)),
    );

    let signal = service.run();
    #[cfg(unix)]
    let interrupted = signal == Some(libc::SIGINT);
    #[cfg(not(unix))]
    let interrupted = signal == Some(2);

    Ok(if interrupted { 130 } else { 0 })
}

/// Options for `service status` and `service stop`.
#[derive(Debug)]
pub struct StatusOpts<'a> {
    pub db_path: Option<&'a str>,
    pub json: bool,
    pub max_workers: Option<usize>,
}

/// Print a service snapshot: running flag, worker slots, job counts.
pub fn status(opts: StatusOpts) -> Result<i32> {
    let scheduler = Arc::new(JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?);
    let service = Service::new(scheduler, opts.max_workers, Duration::from_secs(1));
    let status = service.status();

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Service running: {}", status.running);
        println!("Workers: {}", status.workers.total);
        println!("Jobs by state:");
        for (state, count) in &status.jobs {
            println!("  {state}: {count}");
        }
    }
    Ok(0)
}

/// Stop the service owned by this process. With no IPC this is a no-op from
/// a fresh process; it exists so the stop path is reachable without signals.
pub fn stop(opts: StatusOpts) -> Result<i32> {
    let scheduler = Arc::new(JobScheduler::open(Some(&resolve_db_path(opts.db_path)))?);
    let mut service = Service::new(scheduler, opts.max_workers, Duration::from_secs(1));
    service.stop();

    if opts.json {
        let doc = serde_json::json!({ "stopped": true });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("Scheduler service stopped");
    }
    Ok(0)
}

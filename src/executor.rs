//! Per-job executor: spawns the child process, waits with an optional
//! timeout, captures output, and posts the terminal state.
//!
//! The command line is handed to the platform shell verbatim; the scheduler
//! never tokenizes it. While the child runs, its handle lives in the worker
//! slot's shared cell so the dispatcher can observe liveness and, on an
//! external cancel, take the child and kill it. Observation and removal both
//! happen under the cell's mutex, so exactly one side ever reaps the child.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::job::{Job, JobState};
use crate::pool::{SharedChild, WorkerPool};
use crate::scheduler::JobScheduler;

/// Interval between `try_wait` polls on the child.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Everything the executor needs from the claimed job row.
#[derive(Debug, Clone)]
pub struct ExecutorTask {
    pub job_id: String,
    pub command: String,
    pub working_dir: Option<String>,
    pub output_file: Option<String>,
    pub error_file: Option<String>,
    /// Seconds; `None` = wait forever.
    pub timeout: Option<i64>,
}

impl ExecutorTask {
    pub fn from_job(job: &Job) -> Self {
        ExecutorTask {
            job_id: job.job_id.clone(),
            command: job.command.clone(),
            working_dir: job.working_dir.clone(),
            output_file: job.output_file.clone(),
            error_file: job.error_file.clone(),
            timeout: job.timeout,
        }
    }
}

enum Outcome {
    /// Child exited on its own; captured output is `None` when the stream
    /// was routed to a file instead of a pipe.
    Exited {
        status: ExitStatus,
        stdout: Option<String>,
        stderr: Option<String>,
    },
    /// Timeout fired and the child was hard-killed.
    TimedOut,
    /// Someone else (cancellation reconciliation) took the child out of the
    /// slot; the terminal state is already posted, nothing left to do here.
    Detached,
}

/// Run one claimed job to completion and release the slot.
///
/// Every exit path (natural exit, timeout, detachment, spawn or I/O error)
/// releases the slot; errors become a FAILED terminal state with the error
/// text captured as stderr.
pub fn run_job(
    scheduler: Arc<JobScheduler>,
    pool: Arc<WorkerPool>,
    worker_id: String,
    process: SharedChild,
    task: ExecutorTask,
) {
    let job_id = task.job_id.clone();
    debug!(job_id = %job_id, worker_id = %worker_id, "executor starting");

    match execute(&process, &task) {
        Ok(Outcome::Exited {
            status,
            stdout,
            stderr,
        }) => {
            let return_code = status.code().map(i64::from);
            let new_state = if return_code == Some(0) {
                JobState::Completed
            } else {
                JobState::Failed
            };
            info!(
                job_id = %job_id,
                state = new_state.as_str(),
                return_code,
                "job finished"
            );
            post_state(
                &scheduler,
                &job_id,
                new_state,
                return_code,
                stdout.as_deref(),
                stderr.as_deref(),
            );
        }
        Ok(Outcome::TimedOut) => {
            warn!(job_id = %job_id, timeout = ?task.timeout, "job timed out");
            post_state(&scheduler, &job_id, JobState::Timeout, None, None, None);
        }
        Ok(Outcome::Detached) => {
            debug!(job_id = %job_id, "child taken by reconciliation; nothing to post");
        }
        Err(e) => {
            error!(job_id = %job_id, error = %format!("{e:#}"), "job execution failed");
            post_state(
                &scheduler,
                &job_id,
                JobState::Failed,
                None,
                None,
                Some(&format!("{e:#}")),
            );
        }
    }

    pool.release(&worker_id, &job_id);
}

fn post_state(
    scheduler: &JobScheduler,
    job_id: &str,
    state: JobState,
    return_code: Option<i64>,
    stdout: Option<&str>,
    stderr: Option<&str>,
) {
    // A refused update means the row already reached a terminal state (for
    // example an external cancel); that is the intended winner.
    match scheduler.update_job_state(job_id, state, return_code, stdout, stderr) {
        Ok(true) => {}
        Ok(false) => debug!(job_id = %job_id, to = state.as_str(), "terminal state already posted"),
        Err(e) => error!(job_id = %job_id, error = %format!("{e:#}"), "failed to post job state"),
    }
}

fn execute(process: &SharedChild, task: &ExecutorTask) -> Result<Outcome> {
    let stdout_target = stream_target(task.output_file.as_deref())?;
    let stderr_target = stream_target(task.error_file.as_deref())?;

    if let Some(dir) = task.working_dir.as_deref() {
        if !Path::new(dir).is_dir() {
            anyhow::bail!("working directory does not exist: {dir}");
        }
    }

    let mut cmd = shell_command(&task.command);
    if let Some(dir) = task.working_dir.as_deref() {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(stdout_target);
    cmd.stderr(stderr_target);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn command: {}", task.command))?;

    // Pump piped streams on their own threads so a chatty child cannot fill
    // the pipe buffer and wedge before we reap it.
    let stdout_pump = child.stdout.take().map(pump_stream);
    let stderr_pump = child.stderr.take().map(pump_stream);

    // Attach the child to the slot; from here the dispatcher can see it.
    *process.lock().expect("slot process lock poisoned") = Some(child);

    let deadline = task
        .timeout
        .map(|secs| Instant::now() + Duration::from_secs(secs.max(0) as u64));

    loop {
        {
            let mut guard = process.lock().expect("slot process lock poisoned");
            let exit = match guard.as_mut() {
                None => return Ok(Outcome::Detached),
                Some(child) => child.try_wait().context("wait for child")?,
            };
            if let Some(status) = exit {
                guard.take();
                drop(guard);
                let stdout = stdout_pump.map(collect_pump).transpose()?;
                let stderr = stderr_pump.map(collect_pump).transpose()?;
                return Ok(Outcome::Exited {
                    status,
                    stdout,
                    stderr,
                });
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let mut child = guard.take().expect("child present");
                drop(guard);
                let _ = child.kill();
                let _ = child.wait();
                if let Some(pump) = stdout_pump {
                    let _ = pump.join();
                }
                if let Some(pump) = stderr_pump {
                    let _ = pump.join();
                }
                return Ok(Outcome::TimedOut);
            }
        }
        std::thread::sleep(WAIT_POLL);
    }
}

/// Build the platform shell invocation for a verbatim command line.
fn shell_command(command_line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

/// Destination for one output stream: a truncated file when a path was
/// requested, a pipe otherwise.
fn stream_target(path: Option<&str>) -> Result<Stdio> {
    match path {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create directory for {path}"))?;
                }
            }
            let file =
                File::create(path).with_context(|| format!("open output file {path}"))?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::piped()),
    }
}

fn pump_stream<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        buf
    })
}

fn collect_pump(pump: JoinHandle<Vec<u8>>) -> Result<String> {
    let bytes = pump
        .join()
        .map_err(|_| anyhow::anyhow!("output pump thread panicked"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

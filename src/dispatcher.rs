//! Dispatch loop: claims pending jobs for idle slots, launches executors,
//! and reconciles stored state with observed process state.
//!
//! The loop runs on its own thread. Every fallible step logs and continues;
//! a bad iteration must never take the service down. Claiming uses the
//! conditional UPDATE in [`JobScheduler::claim_job`], so several dispatchers
//! sharing one database never run the same job twice.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::executor::{self, ExecutorTask};
use crate::job::JobState;
use crate::pool::WorkerPool;
use crate::scheduler::JobScheduler;

/// How long `stop` waits for the loop thread to finish its iteration.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How long an exited child may stay attached to its slot before the
/// reconciler concludes the executor died between wait and post. Must be
/// comfortably longer than the executor's own wait-poll interval, or a job
/// that exits between executor polls gets misreported as failed.
const DEAD_EXECUTOR_GRACE: Duration = Duration::from_secs(2);

pub struct Dispatcher {
    scheduler: Arc<JobScheduler>,
    pool: Arc<WorkerPool>,
    max_workers: usize,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    loop_thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// `max_workers` defaults to the host CPU count.
    pub fn new(
        scheduler: Arc<JobScheduler>,
        max_workers: Option<usize>,
        poll_interval: Duration,
    ) -> Self {
        let max_workers = max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        Dispatcher {
            scheduler,
            pool: Arc::new(WorkerPool::new(max_workers)),
            max_workers,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            loop_thread: None,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the loop thread. A second start is a no-op.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("dispatcher already running");
            return;
        }

        info!(workers = self.max_workers, "started worker pool");

        let scheduler = Arc::clone(&self.scheduler);
        let pool = Arc::clone(&self.pool);
        let running = Arc::clone(&self.running);
        let max_workers = self.max_workers;
        let poll_interval = self.poll_interval;

        let handle = std::thread::Builder::new()
            .name("schedarray-dispatcher".to_string())
            .spawn(move || {
                run_loop(scheduler, pool, running, max_workers, poll_interval);
            })
            .expect("spawn dispatcher thread");
        self.loop_thread = Some(handle);
    }

    /// Stop the loop, then cancel and terminate whatever the slots still
    /// hold. Idempotent.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) && self.loop_thread.is_none() {
            return;
        }

        info!("stopping worker pool");

        if let Some(handle) = self.loop_thread.take() {
            let deadline = Instant::now() + STOP_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("dispatcher thread did not stop within grace period");
            }
        }

        // The reconciliation pass is gone now, so finish its job inline:
        // cancel the rows and terminate the children the slots still hold.
        for (worker_id, job_id) in self.pool.busy_jobs() {
            match self.scheduler.cancel_job(&job_id) {
                Ok(true) => info!(job_id = %job_id, "cancelled in-flight job on shutdown"),
                Ok(false) => {}
                Err(e) => error!(job_id = %job_id, error = %format!("{e:#}"), "cancel on shutdown failed"),
            }
            if let Some(handle) = self.pool.process_handle(&worker_id) {
                let child = handle.lock().expect("slot process lock poisoned").take();
                if let Some(mut child) = child {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
            self.pool.release(&worker_id, &job_id);
        }

        info!("worker pool stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    scheduler: Arc<JobScheduler>,
    pool: Arc<WorkerPool>,
    running: Arc<AtomicBool>,
    max_workers: usize,
    poll_interval: Duration,
) {
    let mut first_iteration = true;
    let mut suspects: HashMap<String, Instant> = HashMap::new();
    while running.load(Ordering::SeqCst) {
        if first_iteration {
            if let Err(e) = recover_orphans(&scheduler, &pool) {
                error!(error = %format!("{e:#}"), "orphan recovery failed");
            }
            first_iteration = false;
        }

        if let Err(e) = dispatch(&scheduler, &pool, max_workers) {
            error!(error = %format!("{e:#}"), "dispatch pass failed");
        }

        if let Err(e) = reconcile(&scheduler, &pool, &mut suspects) {
            error!(error = %format!("{e:#}"), "reconcile pass failed");
        }

        std::thread::sleep(poll_interval);
    }
    debug!("dispatcher loop exited");
}

/// Repair RUNNING rows left behind by a previous service process: no live
/// local slot holds them, so they can never finish.
fn recover_orphans(scheduler: &JobScheduler, pool: &WorkerPool) -> Result<()> {
    for job in scheduler.running_jobs()? {
        if pool.slot_for_job(&job.job_id).is_none() {
            warn!(
                job_id = %job.job_id,
                worker_id = ?job.worker_id,
                "recovering orphaned running job"
            );
            scheduler.update_job_state(
                &job.job_id,
                JobState::Failed,
                None,
                None,
                Some("job was marked running but its worker no longer exists (service restart?)"),
            )?;
        }
    }
    Ok(())
}

/// Hand the highest-priority pending jobs to idle slots.
fn dispatch(
    scheduler: &Arc<JobScheduler>,
    pool: &Arc<WorkerPool>,
    max_workers: usize,
) -> Result<()> {
    let pending = scheduler.pending_jobs(Some(max_workers as i64))?;
    for job in pending {
        let Some(worker_id) = pool.find_idle() else {
            break;
        };

        if !scheduler.claim_job(&job.job_id, &worker_id)? {
            // Another dispatcher won the race for this row.
            debug!(job_id = %job.job_id, "lost claim race");
            continue;
        }

        let Some(process) = pool.assign(&worker_id, &job.job_id) else {
            warn!(job_id = %job.job_id, worker_id = %worker_id, "claimed job but slot was taken");
            continue;
        };

        debug!(
            job_id = %job.job_id,
            job_name = %job.job_name,
            worker_id = %worker_id,
            "assigned job to worker"
        );

        let task = ExecutorTask::from_job(&job);
        let spawn = std::thread::Builder::new()
            .name(format!("executor-{}", job.job_id))
            .spawn({
                let scheduler = Arc::clone(scheduler);
                let pool = Arc::clone(pool);
                let worker_id = worker_id.clone();
                move || executor::run_job(scheduler, pool, worker_id, process, task)
            });
        if let Err(e) = spawn {
            error!(job_id = %job.job_id, error = %e, "failed to spawn executor thread");
            scheduler.update_job_state(
                &job.job_id,
                JobState::Failed,
                None,
                None,
                Some(&format!("failed to start executor: {e}")),
            )?;
            pool.release(&worker_id, &job.job_id);
        }
    }
    Ok(())
}

/// Align stored RUNNING rows with what the slots actually hold.
///
/// `suspects` remembers when an exited-but-still-attached child was first
/// seen for a job; only after the sighting persists past
/// `DEAD_EXECUTOR_GRACE` is the executor presumed dead. A healthy executor
/// removes the child from the slot in the same critical section in which it
/// observes the exit, so a persistent sighting means it died between wait
/// and post.
fn reconcile(
    scheduler: &JobScheduler,
    pool: &WorkerPool,
    suspects: &mut HashMap<String, Instant>,
) -> Result<()> {
    let mut still_suspect: HashMap<String, Instant> = HashMap::new();

    for job in scheduler.running_jobs()? {
        match pool.slot_for_job(&job.job_id) {
            None => {
                warn!(job_id = %job.job_id, "running job has no worker slot");
                scheduler.update_job_state(
                    &job.job_id,
                    JobState::Failed,
                    None,
                    None,
                    Some("job was marked running but no worker holds it"),
                )?;
            }
            Some(worker_id) => {
                let Some(handle) = pool.process_handle(&worker_id) else {
                    continue;
                };
                let first_seen = suspects
                    .get(&job.job_id)
                    .copied()
                    .unwrap_or_else(Instant::now);
                let observed = {
                    let mut guard = handle.lock().expect("slot process lock poisoned");
                    match guard.as_mut().map(|child| child.try_wait()) {
                        Some(Ok(Some(status))) => {
                            if first_seen.elapsed() >= DEAD_EXECUTOR_GRACE {
                                guard.take();
                                Some(status)
                            } else {
                                still_suspect.insert(job.job_id.clone(), first_seen);
                                None
                            }
                        }
                        _ => None,
                    }
                };
                if let Some(status) = observed {
                    let code = status.code().map(i64::from);
                    warn!(
                        job_id = %job.job_id,
                        return_code = ?code,
                        "child exited without a posted state"
                    );
                    scheduler.update_job_state(
                        &job.job_id,
                        JobState::Failed,
                        code,
                        None,
                        Some("process exited without reporting a terminal state"),
                    )?;
                    pool.release(&worker_id, &job.job_id);
                }
            }
        }
    }

    *suspects = still_suspect;

    // Rows flipped to CANCELLED from outside while a slot still holds them:
    // terminate the child and free the slot.
    for (worker_id, job_id) in pool.busy_jobs() {
        let Some(job) = scheduler.get_job_status(&job_id)? else {
            continue;
        };
        if job.state == JobState::Cancelled {
            info!(job_id = %job_id, "terminating cancelled job");
            if let Some(handle) = pool.process_handle(&worker_id) {
                let child = handle.lock().expect("slot process lock poisoned").take();
                if let Some(mut child) = child {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
            pool.release(&worker_id, &job_id);
        }
    }

    Ok(())
}

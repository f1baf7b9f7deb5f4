//! The scheduler service: one scheduler handle plus one dispatcher, wrapped
//! with signal handling and a status snapshot.
//!
//! Signal installation is best-effort; when it is refused (non-main thread,
//! exotic platform) the service still stops cleanly through
//! [`ServiceControl::stop`]. The in-process running flag is the
//! authoritative answer to "is the service running".

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::pool::SlotInfo;
use crate::scheduler::JobScheduler;

/// Granularity of the blocking loop in [`Service::run`].
const RUN_TICK: Duration = Duration::from_millis(200);

/// Last stop signal received, 0 when none. Written from the signal handler,
/// so it must stay async-signal-safe: one atomic store, nothing else.
static STOP_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_stop_signal(signum: libc::c_int) {
    STOP_SIGNAL.store(signum, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers (console ctrl handler on Windows).
/// Returns false when installation was refused; callers proceed without.
fn install_signal_handlers() -> bool {
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGINT, handle_stop_signal as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handle_stop_signal as libc::sighandler_t);
        }
        true
    }
    #[cfg(windows)]
    {
        use windows::Win32::Foundation::BOOL;
        use windows::Win32::System::Console::SetConsoleCtrlHandler;

        unsafe extern "system" fn ctrl_handler(_ctrl_type: u32) -> BOOL {
            STOP_SIGNAL.store(libc::SIGINT, Ordering::SeqCst);
            BOOL(1)
        }

        unsafe { SetConsoleCtrlHandler(Some(ctrl_handler), true).is_ok() }
    }
    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

fn take_stop_signal() -> i32 {
    STOP_SIGNAL.swap(0, Ordering::SeqCst)
}

#[derive(Debug, Serialize)]
pub struct WorkersStatus {
    pub total: usize,
    pub list: Vec<SlotInfo>,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub workers: WorkersStatus,
    pub jobs: BTreeMap<String, i64>,
}

/// Handle for requesting a stop from another thread (or a signal-free
/// embedding). Cloneable and cheap.
#[derive(Clone)]
pub struct ServiceControl {
    running: Arc<AtomicBool>,
}

impl ServiceControl {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct Service {
    scheduler: Arc<JobScheduler>,
    dispatcher: Dispatcher,
    running: Arc<AtomicBool>,
}

impl Service {
    pub fn new(
        scheduler: Arc<JobScheduler>,
        max_workers: Option<usize>,
        poll_interval: Duration,
    ) -> Self {
        let dispatcher = Dispatcher::new(Arc::clone(&scheduler), max_workers, poll_interval);
        Service {
            scheduler,
            dispatcher,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn control(&self) -> ServiceControl {
        ServiceControl {
            running: Arc::clone(&self.running),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the dispatcher and block until a stop is requested, either via
    /// [`ServiceControl::stop`] or a stop signal. Returns the signal number
    /// that ended the run, or `None` for an in-process stop.
    pub fn run(&mut self) -> Option<i32> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler service already running");
            return None;
        }

        info!("starting scheduler service");

        take_stop_signal();
        if !install_signal_handlers() {
            debug!("signal handlers not installed; stop remains reachable in-process");
        }

        self.dispatcher.start();
        info!(db = %self.scheduler.db_path().display(), "scheduler service started");

        let mut stop_signal = None;
        while self.running.load(Ordering::SeqCst) {
            let signum = take_stop_signal();
            if signum != 0 {
                info!(signal = signum, "received stop signal");
                stop_signal = Some(signum);
                break;
            }
            std::thread::sleep(RUN_TICK);
        }

        self.stop();
        stop_signal
    }

    /// Stop the service. Idempotent; safe to call whether or not `run` is
    /// blocked on this instance.
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if !was_running && !self.dispatcher.is_running() {
            return;
        }

        info!("stopping scheduler service");
        self.dispatcher.stop();
        info!("scheduler service stopped");
    }

    /// Snapshot of the service: running flag, slots, and job counts.
    pub fn status(&self) -> ServiceStatus {
        let jobs = match self.scheduler.job_counts() {
            Ok(counts) => counts,
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to count jobs");
                BTreeMap::new()
            }
        };
        let list = self.dispatcher.pool().snapshot();
        ServiceStatus {
            running: self.is_running(),
            workers: WorkersStatus {
                total: list.len(),
                list,
            },
            jobs,
        }
    }
}

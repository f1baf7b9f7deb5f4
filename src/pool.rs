//! In-memory worker slots.
//!
//! A slot is one execution lane in the service: at most one child process at
//! a time. Slots are never persisted; on restart the pool starts empty and
//! stored RUNNING rows that point at vanished slots are reconciled by the
//! dispatcher.

use serde::Serialize;
use std::collections::HashMap;
use std::process::Child;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use ulid::Ulid;

/// Child process handle shared between the executor that owns the wait and
/// the dispatcher, which may inspect liveness or take the child to kill it
/// during cancellation reconciliation.
pub type SharedChild = Arc<Mutex<Option<Child>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Idle,
    Busy,
}

pub struct WorkerSlot {
    pub worker_id: String,
    pub max_cpus: i64,
    pub available_cpus: i64,
    pub current_job_id: Option<String>,
    pub state: SlotState,
    pub process: SharedChild,
    pub last_heartbeat: Instant,
}

impl WorkerSlot {
    fn new(worker_id: String, max_cpus: i64) -> Self {
        WorkerSlot {
            worker_id,
            max_cpus,
            available_cpus: max_cpus,
            current_job_id: None,
            state: SlotState::Idle,
            process: Arc::new(Mutex::new(None)),
            last_heartbeat: Instant::now(),
        }
    }

    /// Assign a job to this slot. Fails when the slot is not idle.
    pub fn assign(&mut self, job_id: &str) -> bool {
        if self.state != SlotState::Idle || self.available_cpus < 1 {
            return false;
        }
        self.current_job_id = Some(job_id.to_string());
        self.state = SlotState::Busy;
        self.available_cpus -= 1;
        true
    }

    /// Reset the slot to idle and refresh the heartbeat.
    pub fn release(&mut self) {
        self.current_job_id = None;
        self.state = SlotState::Idle;
        self.available_cpus = self.max_cpus;
        self.last_heartbeat = Instant::now();
    }

    /// True when no child is attached, or the attached child has not exited.
    pub fn is_alive(&self) -> bool {
        let mut guard = self.process.lock().expect("slot process lock poisoned");
        match guard.as_mut() {
            None => true,
            Some(child) => matches!(child.try_wait(), Ok(None)),
        }
    }
}

/// Point-in-time view of one slot, for `service status`.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub worker_id: String,
    pub state: SlotState,
    pub current_job_id: Option<String>,
    pub available_cpus: i64,
    pub max_cpus: i64,
}

/// The bounded pool of worker slots, guarded by a single mutex.
pub struct WorkerPool {
    slots: Mutex<HashMap<String, WorkerSlot>>,
}

impl WorkerPool {
    /// Create `max_workers` idle slots, each with one CPU lane.
    pub fn new(max_workers: usize) -> Self {
        let mut slots = HashMap::with_capacity(max_workers);
        for i in 0..max_workers {
            let id = Ulid::new().to_string().to_lowercase();
            let worker_id = format!("worker_{}_{}", i + 1, &id[id.len() - 8..]);
            slots.insert(worker_id.clone(), WorkerSlot::new(worker_id, 1));
        }
        WorkerPool {
            slots: Mutex::new(slots),
        }
    }

    pub fn total(&self) -> usize {
        self.slots.lock().expect("slot map lock poisoned").len()
    }

    /// Linear scan for an idle slot.
    pub fn find_idle(&self) -> Option<String> {
        let slots = self.slots.lock().expect("slot map lock poisoned");
        slots
            .values()
            .find(|s| s.state == SlotState::Idle && s.available_cpus > 0)
            .map(|s| s.worker_id.clone())
    }

    /// Mark a slot busy with `job_id` and hand back its process handle for
    /// the executor. `None` when the slot is unknown or no longer idle.
    pub fn assign(&self, worker_id: &str, job_id: &str) -> Option<SharedChild> {
        let mut slots = self.slots.lock().expect("slot map lock poisoned");
        let slot = slots.get_mut(worker_id)?;
        if slot.assign(job_id) {
            Some(Arc::clone(&slot.process))
        } else {
            None
        }
    }

    /// Release a slot, but only while it still holds `job_id`; a late release
    /// after the slot was reconciled and reassigned is a no-op.
    pub fn release(&self, worker_id: &str, job_id: &str) {
        let mut slots = self.slots.lock().expect("slot map lock poisoned");
        if let Some(slot) = slots.get_mut(worker_id) {
            if slot.current_job_id.as_deref() == Some(job_id) {
                slot.release();
            }
        }
    }

    /// The slot currently holding `job_id`, if any.
    pub fn slot_for_job(&self, job_id: &str) -> Option<String> {
        let slots = self.slots.lock().expect("slot map lock poisoned");
        slots
            .values()
            .find(|s| s.current_job_id.as_deref() == Some(job_id))
            .map(|s| s.worker_id.clone())
    }

    pub fn process_handle(&self, worker_id: &str) -> Option<SharedChild> {
        let slots = self.slots.lock().expect("slot map lock poisoned");
        slots.get(worker_id).map(|s| Arc::clone(&s.process))
    }

    /// `(worker_id, job_id)` pairs for every busy slot.
    pub fn busy_jobs(&self) -> Vec<(String, String)> {
        let slots = self.slots.lock().expect("slot map lock poisoned");
        slots
            .values()
            .filter_map(|s| {
                s.current_job_id
                    .as_ref()
                    .map(|job| (s.worker_id.clone(), job.clone()))
            })
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        let slots = self.slots.lock().expect("slot map lock poisoned");
        slots.values().filter(|s| s.state == SlotState::Busy).count()
    }

    pub fn snapshot(&self) -> Vec<SlotInfo> {
        let slots = self.slots.lock().expect("slot map lock poisoned");
        let mut infos: Vec<SlotInfo> = slots
            .values()
            .map(|s| SlotInfo {
                worker_id: s.worker_id.clone(),
                state: s.state,
                current_job_id: s.current_job_id.clone(),
                available_cpus: s.available_cpus,
                max_cpus: s.max_cpus,
            })
            .collect();
        infos.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starts_idle() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.total(), 3);
        assert_eq!(pool.busy_count(), 0);
        assert!(pool.find_idle().is_some());
    }

    #[test]
    fn zero_worker_pool_never_has_an_idle_slot() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.total(), 0);
        assert!(pool.find_idle().is_none());
    }

    #[test]
    fn assign_marks_slot_busy_and_guards_double_assign() {
        let pool = WorkerPool::new(1);
        let worker_id = pool.find_idle().expect("one idle slot");

        assert!(pool.assign(&worker_id, "job-a").is_some());
        assert_eq!(pool.busy_count(), 1);
        assert!(pool.find_idle().is_none());
        // Busy slots refuse a second job.
        assert!(pool.assign(&worker_id, "job-b").is_none());
        assert_eq!(pool.slot_for_job("job-a"), Some(worker_id.clone()));

        pool.release(&worker_id, "job-a");
        assert_eq!(pool.busy_count(), 0);
        assert!(pool.slot_for_job("job-a").is_none());
    }

    #[test]
    fn release_ignores_stale_job_id() {
        let pool = WorkerPool::new(1);
        let worker_id = pool.find_idle().unwrap();
        pool.assign(&worker_id, "job-a").unwrap();
        pool.release(&worker_id, "job-a");
        pool.assign(&worker_id, "job-b").unwrap();

        // A late release from job-a's executor must not free job-b's slot.
        pool.release(&worker_id, "job-a");
        assert_eq!(pool.busy_count(), 1);
        assert_eq!(pool.slot_for_job("job-b"), Some(worker_id));
    }

    #[test]
    fn slot_without_child_is_alive() {
        let mut slot = WorkerSlot::new("worker_1_test".to_string(), 1);
        assert!(slot.is_alive());
        slot.assign("job-a");
        assert!(slot.is_alive());
    }

    #[test]
    fn slot_with_exited_child_is_not_alive() {
        let slot = WorkerSlot::new("worker_1_test".to_string(), 1);
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("spawn child");
        *slot.process.lock().unwrap() = Some(child);
        // Give the child a moment to exit.
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(!slot.is_alive());
        // Reap it.
        let taken = slot.process.lock().unwrap().take();
        if let Some(mut child) = taken {
            let _ = child.wait();
        }
    }

    #[test]
    fn snapshot_reports_every_slot() {
        let pool = WorkerPool::new(2);
        let worker_id = pool.find_idle().unwrap();
        pool.assign(&worker_id, "job-a").unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 2);
        let busy: Vec<_> = snapshot
            .iter()
            .filter(|s| s.state == SlotState::Busy)
            .collect();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].current_job_id.as_deref(), Some("job-a"));
    }
}

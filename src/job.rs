//! Job record and state machine.
//!
//! States are persisted as fixed lowercase tokens so that database files are
//! interchangeable between implementations. All transition legality lives in
//! [`JobState::can_transition_to`]; callers never compare state strings.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// `Completed`, `Failed`, `Cancelled`, and `Timeout` are terminal: once a
/// job reaches one of them it never leaves.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Timeout => "timeout",
        }
    }

    /// Parse a persisted state token. Unknown tokens are `None` so that a
    /// corrupted row surfaces as an error at the call site instead of a panic.
    pub fn parse(token: &str) -> Option<JobState> {
        match token {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            "timeout" => Some(JobState::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
        )
    }

    /// Single source of truth for transition legality.
    ///
    /// Terminal states are sinks. A pending job may be claimed, cancelled, or
    /// failed outright (bad working directory, spawn error before RUNNING was
    /// ever posted); a running job may reach any terminal state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            JobState::Pending => matches!(
                next,
                JobState::Running | JobState::Cancelled | JobState::Failed
            ),
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Free-form key/value bag attached to a job, serialized as JSON in the
/// `metadata` column. The keys `stdout` and `stderr` are reserved for
/// captured output when no output file was requested.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub const META_STDOUT: &str = "stdout";
pub const META_STDERR: &str = "stderr";

/// One row of the job queue.
///
/// Timestamps are RFC 3339 / ISO-8601 strings in UTC; they order
/// lexicographically, which the dispatch query relies on.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Job {
    pub job_id: String,
    pub job_name: String,
    pub command: String,
    pub working_dir: Option<String>,
    pub priority: i64,
    pub state: JobState,
    pub submitted_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    /// Advisory CPU slot count; recorded, not enforced.
    pub cpu_limit: i64,
    /// Advisory memory label such as "4G"; recorded, not enforced.
    pub memory_limit: Option<String>,
    /// Timeout in seconds; `None` = no timeout.
    pub timeout: Option<i64>,
    /// Persisted for a future retry policy; never consumed.
    pub retry_count: i64,
    pub max_retries: i64,
    pub output_file: Option<String>,
    pub error_file: Option<String>,
    pub return_code: Option<i64>,
    /// Identifier of the slot currently executing; `None` when not running.
    pub worker_id: Option<String>,
    pub metadata: Metadata,
    pub user: String,
}

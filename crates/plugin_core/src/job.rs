//! Job records owned by the [`crate::queue::JobQueue`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Notify;

/// A job's position in its lifecycle. Terminal states never transition
/// onward — `completed`, `failed`, and `cancelled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A cooperative, advisory cancel request.
///
/// Setting the flag does not interrupt anything by itself; the dispatcher
/// observes it after the underlying execute returns.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<CancelInner>);

#[derive(Debug, Default)]
struct CancelInner {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.requested.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }
}

/// A unique, opaque job identifier.
pub type JobId = uuid::Uuid;

/// One queued execution request against one plugin.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub plugin_name: String,
    pub kwargs: Map<String, Value>,
    pub priority: i64,
    pub status: JobStatus,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub cancel_signal: CancelSignal,
}

impl Job {
    pub fn new(plugin_name: String, kwargs: Map<String, Value>, priority: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            plugin_name,
            kwargs,
            priority,
            status: JobStatus::Pending,
            created_at: Instant::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            cancel_signal: CancelSignal::new(),
        }
    }
}

/// Observability projection of one pending job.
#[derive(Debug, Clone, Serialize)]
pub struct PendingView {
    pub id: JobId,
    pub plugin_name: String,
    pub priority: i64,
    /// 0-based rank in dispatch order.
    pub position: usize,
}

/// Snapshot of one currently-running job, as returned by `get_state`.
#[derive(Debug, Clone, Serialize)]
pub struct RunningView {
    pub id: JobId,
    pub plugin_name: String,
    #[serde(skip)]
    pub started_at: Instant,
}

/// Lifetime counters tracked by the queue.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn cancel_signal_is_observable_after_request() {
        let signal = CancelSignal::new();
        assert!(!signal.is_requested());
        signal.request();
        assert!(signal.is_requested());
    }

    #[test]
    fn new_job_starts_pending_with_no_timestamps_set() {
        let job = Job::new("demo".into(), Map::new(), 0);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }
}

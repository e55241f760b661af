//! Priority job queue and single dispatcher task.
//!
//! This is the heart of the host: a priority-ordered set of pending jobs,
//! a resource-class exclusivity rule, cancellation, and a bounded
//! completed-job history. `submit`/`cancel`/`wait_for_job` are the
//! suspension points a caller interacts with; the dispatcher itself is a
//! background task spawned by `start`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Map;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{HostError, HostResult};
use crate::job::{CancelSignal, Job, JobId, JobStatus, PendingView, QueueStats, RunningView};
use crate::manager::PluginManager;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot returned by [`JobQueue::get_state`].
#[derive(Debug, Clone)]
pub struct QueueStateView {
    pub running: Vec<RunningView>,
    pub pending: Vec<PendingView>,
    pub stats: QueueStats,
}

struct PendingEntry {
    job_id: JobId,
    priority: i64,
    created_at: Instant,
    resource_class: String,
}

struct QueueState {
    jobs: HashMap<JobId, Job>,
    pending: Vec<PendingEntry>,
    running: HashMap<JobId, Instant>,
    running_by_class: HashMap<String, u32>,
    history: VecDeque<JobId>,
    stats: QueueStats,
}

impl QueueState {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            pending: Vec::new(),
            running: HashMap::new(),
            running_by_class: HashMap::new(),
            history: VecDeque::new(),
            stats: QueueStats::default(),
        }
    }

    /// Inserts `job_id` into the pending order: higher priority first,
    /// FIFO (by `created_at`) within equal priority.
    fn insert_pending(&mut self, entry: PendingEntry) {
        let pos = self
            .pending
            .iter()
            .position(|e| order_key(&entry) < order_key(e))
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, entry);
    }

    fn push_history(&mut self, job_id: JobId, max_history: usize) {
        self.history.push_back(job_id);
        while self.history.len() > max_history {
            if let Some(evicted) = self.history.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }
}

/// `(priority desc, created_at asc)` as a directly comparable tuple.
fn order_key(entry: &PendingEntry) -> (std::cmp::Reverse<i64>, Instant) {
    (std::cmp::Reverse(entry.priority), entry.created_at)
}

struct Inner {
    state: Mutex<QueueState>,
    wake: Notify,
    job_done: Notify,
    started: AtomicBool,
    max_history: usize,
    max_concurrent: usize,
}

impl Inner {
    fn class_limit(&self, class: &str) -> u32 {
        if class.is_empty() || class == "cpu" {
            self.max_concurrent as u32
        } else {
            1
        }
    }
}

/// The priority queue + dispatcher driving `PluginManager::execute_plugin_async`.
#[derive(Clone)]
pub struct JobQueue {
    manager: Arc<PluginManager>,
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(manager: Arc<PluginManager>, max_history: usize) -> Self {
        let max_concurrent = manager.config().max_concurrent;
        Self {
            manager,
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::new()),
                wake: Notify::new(),
                job_done: Notify::new(),
                started: AtomicBool::new(false),
                max_history,
                max_concurrent,
            }),
        }
    }

    pub fn with_defaults(manager: Arc<PluginManager>) -> Self {
        let max_history = manager.config().max_history;
        Self::new(manager, max_history)
    }

    /// Launches the dispatcher task. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let manager = self.manager.clone();
        tokio::spawn(dispatcher_loop(inner, manager));
        self.inner.wake.notify_one();
    }

    /// Signals the dispatcher to stop pulling new jobs, waits (up to
    /// `DEFAULT_STOP_TIMEOUT`) for any currently running job to finish,
    /// then refuses further submits. A second call is a no-op.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.wake.notify_one();

        let deadline = tokio::time::Instant::now() + DEFAULT_STOP_TIMEOUT;
        loop {
            if self.inner.state.lock().unwrap().running.is_empty() {
                break;
            }
            let notified = self.inner.job_done.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
    }

    /// Submits a new pending job. Fails fast if `plugin_name` is not
    /// loaded or is disabled, or if the queue has been stopped.
    pub async fn submit(
        &self,
        plugin_name: &str,
        priority: i64,
        kwargs: Map<String, serde_json::Value>,
    ) -> HostResult<JobId> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(HostError::QueueClosed);
        }
        self.manager.ensure_executable(plugin_name).await?;
        let resource_class = self
            .manager
            .resource_class_of(plugin_name)
            .await
            .unwrap_or_default();

        let job = Job::new(plugin_name.to_string(), kwargs, priority);
        let job_id = job.id;
        let entry = PendingEntry {
            job_id,
            priority,
            created_at: job.created_at,
            resource_class,
        };

        let mut state = self.inner.state.lock().unwrap();
        state.jobs.insert(job_id, job);
        state.insert_pending(entry);
        state.stats.total_submitted += 1;
        drop(state);

        self.inner.wake.notify_one();
        Ok(job_id)
    }

    /// Cancels a job. Exact for pending jobs (they never run); advisory for
    /// running jobs (the signal is observed once execute returns). Returns
    /// `false` for terminal or unknown jobs.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        let mut state = self.inner.state.lock().unwrap();

        if let Some(idx) = state.pending.iter().position(|e| e.job_id == job_id) {
            state.pending.remove(idx);
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Instant::now());
            }
            state.stats.total_cancelled += 1;
            state.push_history(job_id, self.inner.max_history);
            drop(state);
            self.inner.job_done.notify_waiters();
            self.inner.wake.notify_one();
            return true;
        }

        match state.jobs.get(&job_id).map(|j| j.status) {
            Some(JobStatus::Running) => {
                state.jobs.get(&job_id).unwrap().cancel_signal.request();
                true
            }
            _ => false,
        }
    }

    /// Suspends until `job_id` reaches a terminal state, or `timeout`
    /// elapses — in which case the current snapshot is returned, untouched.
    pub async fn wait_for_job(&self, job_id: JobId, timeout: Option<Duration>) -> HostResult<Job> {
        loop {
            let notified = self.inner.job_done.notified();
            {
                let state = self.inner.state.lock().unwrap();
                let job = state.jobs.get(&job_id).ok_or(HostError::UnknownJob)?;
                if job.status.is_terminal() {
                    return Ok(job.clone());
                }
            }
            match timeout {
                Some(t) => {
                    if tokio::time::timeout(t, notified).await.is_err() {
                        let state = self.inner.state.lock().unwrap();
                        return Ok(state
                            .jobs
                            .get(&job_id)
                            .cloned()
                            .expect("job present before timeout"));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Snapshot of everything the queue knows about right now.
    pub fn get_state(&self) -> QueueStateView {
        let state = self.inner.state.lock().unwrap();
        let running = state
            .running
            .iter()
            .filter_map(|(id, started_at)| {
                state.jobs.get(id).map(|job| RunningView {
                    id: *id,
                    plugin_name: job.plugin_name.clone(),
                    started_at: *started_at,
                })
            })
            .collect();
        let pending = state
            .pending
            .iter()
            .enumerate()
            .map(|(position, entry)| PendingView {
                id: entry.job_id,
                plugin_name: state
                    .jobs
                    .get(&entry.job_id)
                    .map(|j| j.plugin_name.clone())
                    .unwrap_or_default(),
                priority: entry.priority,
                position,
            })
            .collect();
        QueueStateView {
            running,
            pending,
            stats: state.stats,
        }
    }

    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.inner.state.lock().unwrap().jobs.get(&job_id).cloned()
    }
}

async fn dispatcher_loop(inner: Arc<Inner>, manager: Arc<PluginManager>) {
    loop {
        let woken = inner.wake.notified();

        if !inner.started.load(Ordering::SeqCst) {
            woken.await;
            continue;
        }

        match try_dispatch_one(&inner) {
            Some((job_id, plugin_name, kwargs, class, cancel_signal)) => {
                let inner2 = inner.clone();
                let manager2 = manager.clone();
                tokio::spawn(async move {
                    let result = manager2.execute_plugin_async(&plugin_name, kwargs).await;
                    finish_job(&inner2, job_id, &class, result, &cancel_signal);
                });
                // Loop immediately: another eligible job (different class)
                // may be dispatchable right now too.
            }
            None => woken.await,
        }
    }
}

type DispatchedJob = (
    JobId,
    String,
    Map<String, serde_json::Value>,
    String,
    CancelSignal,
);

fn try_dispatch_one(inner: &Inner) -> Option<DispatchedJob> {
    let mut state = inner.state.lock().unwrap();
    let idx = state.pending.iter().position(|entry| {
        let running = state
            .running_by_class
            .get(&entry.resource_class)
            .copied()
            .unwrap_or(0);
        running < inner.class_limit(&entry.resource_class)
    })?;
    let entry = state.pending.remove(idx);
    let job = state.jobs.get_mut(&entry.job_id)?;
    job.status = JobStatus::Running;
    let started_at = Instant::now();
    job.started_at = Some(started_at);
    let plugin_name = job.plugin_name.clone();
    let kwargs = job.kwargs.clone();
    let cancel_signal = job.cancel_signal.clone();

    state.running.insert(entry.job_id, started_at);
    *state
        .running_by_class
        .entry(entry.resource_class.clone())
        .or_insert(0) += 1;

    debug!(job = %entry.job_id, plugin = %plugin_name, stage = "dispatch", "dispatching job");
    Some((entry.job_id, plugin_name, kwargs, entry.resource_class, cancel_signal))
}

fn finish_job(
    inner: &Inner,
    job_id: JobId,
    class: &str,
    result: HostResult<serde_json::Value>,
    cancel_signal: &CancelSignal,
) {
    let mut state = inner.state.lock().unwrap();
    state.running.remove(&job_id);
    if let Some(count) = state.running_by_class.get_mut(class) {
        *count = count.saturating_sub(1);
    }

    if let Some(job) = state.jobs.get_mut(&job_id) {
        job.completed_at = Some(Instant::now());
        if cancel_signal.is_requested() {
            job.status = JobStatus::Cancelled;
            job.result = None;
            job.error = None;
            state.stats.total_cancelled += 1;
        } else {
            match result {
                Ok(value) => {
                    job.status = JobStatus::Completed;
                    job.result = Some(value);
                    state.stats.total_completed += 1;
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(e.to_string());
                    state.stats.total_failed += 1;
                }
            }
        }
    }
    state.push_history(job_id, inner.max_history);
    drop(state);

    inner.job_done.notify_waiters();
    inner.wake.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginMeta;
    use serde_json::{json, Value};

    fn meta(name: &str, class: &str) -> PluginMeta {
        PluginMeta {
            name: name.into(),
            version: "0.1.0".into(),
            entry_point: format!("{} {} 0.1.0", env!("CARGO_BIN_EXE_mock_plugin"), name),
            config_schema: Value::Null,
            resource_class: class.into(),
            capabilities: vec![],
            db_path: None,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn priority_ordering_runs_higher_priority_first() {
        let manager = Arc::new(PluginManager::new());
        let m = meta("p", "cpu");
        manager.load_plugin(&m, None).await.unwrap();

        let queue = JobQueue::with_defaults(manager.clone());
        queue.start();

        let mut low_kwargs = Map::new();
        low_kwargs.insert("action".into(), json!("sleep"));
        low_kwargs.insert("ms".into(), json!(30));
        let j1 = queue.submit("p", 0, low_kwargs).await.unwrap();
        let j2 = queue.submit("p", 10, Map::new()).await.unwrap();

        let job2 = queue.wait_for_job(j2, Some(Duration::from_secs(5))).await.unwrap();
        let job1 = queue.wait_for_job(j1, Some(Duration::from_secs(5))).await.unwrap();

        assert_eq!(job2.status, JobStatus::Completed);
        assert_eq!(job1.status, JobStatus::Completed);
        assert!(job2.started_at.unwrap() < job1.started_at.unwrap());

        queue.stop().await;
        manager.unload_all().await;
    }

    #[tokio::test]
    async fn cancel_pending_job_before_dispatch() {
        let manager = Arc::new(PluginManager::new());
        let m = meta("q", "cpu");
        manager.load_plugin(&m, None).await.unwrap();

        let queue = JobQueue::with_defaults(manager.clone());
        queue.start();

        // "cpu" has one shared slot; the first job occupies it long enough
        // for the other two to sit in pending.
        let mut block = Map::new();
        block.insert("action".into(), json!("sleep"));
        block.insert("ms".into(), json!(200));
        let j1 = queue.submit("q", 5, block).await.unwrap();
        let j2 = queue.submit("q", 5, Map::new()).await.unwrap();
        let j3 = queue.submit("q", 5, Map::new()).await.unwrap();

        let cancelled = queue.cancel(j3).await;
        assert!(cancelled);

        let state = queue.get_state();
        assert_eq!(state.stats.total_cancelled, 1);
        assert_eq!(state.pending.len(), 1);

        queue.wait_for_job(j1, Some(Duration::from_secs(5))).await.unwrap();
        queue.wait_for_job(j2, Some(Duration::from_secs(5))).await.unwrap();
        queue.stop().await;
        manager.unload_all().await;
    }

    #[tokio::test]
    async fn resource_class_exclusivity_serializes_same_class_jobs() {
        let manager = Arc::new(PluginManager::new());
        manager.load_plugin(&meta("gpu_a", "gpu"), None).await.unwrap();
        manager.load_plugin(&meta("gpu_b", "gpu"), None).await.unwrap();

        let queue = JobQueue::with_defaults(manager.clone());
        queue.start();

        let mut sleepy = Map::new();
        sleepy.insert("action".into(), json!("sleep"));
        sleepy.insert("ms".into(), json!(50));
        let j1 = queue.submit("gpu_a", 0, sleepy).await.unwrap();
        let j2 = queue.submit("gpu_b", 0, Map::new()).await.unwrap();

        let job1 = queue.wait_for_job(j1, Some(Duration::from_secs(5))).await.unwrap();
        let job2 = queue.wait_for_job(j2, Some(Duration::from_secs(5))).await.unwrap();

        // Same resource class ("gpu"): j2 cannot start until j1 finishes.
        assert!(job2.started_at.unwrap() >= job1.completed_at.unwrap());

        queue.stop().await;
        manager.unload_all().await;
    }

    #[tokio::test]
    async fn child_crash_fails_job_and_breaks_proxy() {
        let manager = Arc::new(PluginManager::new());
        manager.load_plugin(&meta("crasher", "cpu"), None).await.unwrap();

        let queue = JobQueue::with_defaults(manager.clone());
        queue.start();

        let mut kwargs = Map::new();
        kwargs.insert("action".into(), json!("crash"));
        let job_id = queue.submit("crasher", 0, kwargs).await.unwrap();
        let job = queue
            .wait_for_job(job_id, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_ref().unwrap().contains("child exited"));

        queue.stop().await;
        assert!(manager.unload_plugin("crasher").await);
    }
}

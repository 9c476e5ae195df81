//! Queue implementation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::{QueueHandler, QueueItem};

/// Configuration for a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name, used in logs.
    pub name: String,
    /// Maximum number of items running at the same time.
    pub max_concurrency: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
        }
    }
}

/// Result of [`Queue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The item was pending and has been removed. Its runnable never ran and
    /// `on_complete` will not be called for it.
    Removed,
    /// The item is running; its cancellation token has been cancelled and it
    /// will reach `on_complete` on its own.
    Signalled,
    /// The item is neither pending nor running.
    NotQueued,
}

struct RunningEntry<J> {
    job: Arc<J>,
    token: CancellationToken,
}

struct QueueState<J> {
    /// Pending items in submission order.
    pending: VecDeque<Arc<J>>,
    /// Items currently owned by a worker.
    running: Vec<RunningEntry<J>>,
    /// Occupied worker slots. A slot stays busy until `on_complete` returned,
    /// so this can be larger than `running.len()`.
    busy_workers: usize,
    paused: bool,
}

impl<J: QueueItem> QueueState<J> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            running: Vec::new(),
            busy_workers: 0,
            paused: false,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.pending.iter().any(|job| job.id() == id)
            || self.running.iter().any(|entry| entry.job.id() == id)
    }
}

/// A named, bounded-concurrency FIFO queue.
pub struct Queue<J: QueueItem> {
    name: String,
    max_concurrency: usize,
    handler: Arc<dyn QueueHandler<J>>,
    /// Pending list, running set and worker accounting share this lock.
    state: Mutex<QueueState<J>>,
    /// Wakes the dispatcher on submissions, resumes and freed slots.
    notify: Notify,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl<J: QueueItem> Queue<J> {
    /// Create a queue. Nothing is dispatched until [`Queue::run`] is spawned.
    pub fn new(config: QueueConfig, handler: Arc<dyn QueueHandler<J>>) -> Self {
        if config.max_concurrency == 0 {
            warn!(queue = %config.name, "max_concurrency of 0 raised to 1");
        }

        Self {
            name: config.name,
            max_concurrency: config.max_concurrency.max(1),
            handler,
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured worker count.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Dispatcher loop.
    ///
    /// Pops pending items in FIFO order while a worker slot is free and the queue
    /// is not paused. Returns after [`Queue::shutdown`] once every in-flight
    /// worker has finished.
    pub async fn run(self: Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(queue = %self.name, "Dispatcher already running");
            return;
        }

        info!(
            queue = %self.name,
            max_concurrency = self.max_concurrency,
            "Queue dispatcher started"
        );

        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            while let Some((job, token)) = self.next_dispatch() {
                let queue = self.clone();
                workers.spawn(async move { queue.execute(job, token).await });
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!(queue = %self.name, error = %e, "Queue worker aborted");
                    }
                }
            }
        }

        if !workers.is_empty() {
            info!(
                queue = %self.name,
                workers = workers.len(),
                "Waiting for in-flight jobs before stopping"
            );
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(queue = %self.name, error = %e, "Queue worker aborted");
            }
        }

        info!(queue = %self.name, "Queue dispatcher stopped");
    }

    /// Take the next pending item if a worker slot is free.
    fn next_dispatch(&self) -> Option<(Arc<J>, CancellationToken)> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let mut state = self.state.lock();
        if state.paused || state.busy_workers >= self.max_concurrency {
            return None;
        }

        let job = state.pending.pop_front()?;
        let token = self.shutdown.child_token();
        state.busy_workers += 1;
        state.running.push(RunningEntry {
            job: job.clone(),
            token: token.clone(),
        });

        Some((job, token))
    }

    /// Worker body for one item.
    async fn execute(self: Arc<Self>, job: Arc<J>, token: CancellationToken) {
        let job_id = job.id().to_string();
        debug!(queue = %self.name, job_id = %job_id, "Worker picked up job");

        // Both the runnable construction and its execution happen in their own
        // task so a panic cannot skip the bookkeeping below.
        let handler = self.handler.clone();
        let target = job.clone();
        let outcome = tokio::spawn(async move {
            handler.create_runnable(target, token).await;
        })
        .await;
        if let Err(e) = outcome {
            error!(queue = %self.name, job_id = %job_id, error = %e, "Job runnable panicked");
        }

        self.remove_running(&job_id);

        let handler = self.handler.clone();
        let outcome = tokio::spawn(async move {
            handler.on_complete(job).await;
        })
        .await;
        if let Err(e) = outcome {
            error!(queue = %self.name, job_id = %job_id, error = %e, "Completion callback panicked");
        }

        self.release_worker();
        debug!(queue = %self.name, job_id = %job_id, "Worker finished job");
    }

    fn remove_running(&self, id: &str) {
        let mut state = self.state.lock();
        state.running.retain(|entry| entry.job.id() != id);
    }

    fn release_worker(&self) {
        {
            let mut state = self.state.lock();
            state.busy_workers = state.busy_workers.saturating_sub(1);
        }
        self.notify.notify_one();
    }

    /// Append an item to the pending list.
    ///
    /// Returns `false` without changing anything when an item with the same id
    /// is already pending or running.
    pub fn submit(&self, job: Arc<J>) -> bool {
        let job_id = job.id().to_string();
        {
            let mut state = self.state.lock();
            if state.contains(&job_id) {
                drop(state);
                debug!(queue = %self.name, job_id = %job_id, "Job already queued");
                return false;
            }
            state.pending.push_back(job);
        }

        debug!(queue = %self.name, job_id = %job_id, "Job submitted");
        self.notify.notify_one();
        true
    }

    /// Cancel an item.
    pub fn cancel(&self, job: &J) -> CancelOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if let Some(index) = state.pending.iter().position(|p| p.id() == job.id()) {
                state.pending.remove(index);
                CancelOutcome::Removed
            } else if let Some(entry) = state.running.iter().find(|r| r.job.id() == job.id()) {
                entry.token.cancel();
                CancelOutcome::Signalled
            } else {
                CancelOutcome::NotQueued
            }
        };

        match outcome {
            CancelOutcome::Removed => {
                info!(queue = %self.name, job_id = %job.id(), "Removed pending job")
            }
            CancelOutcome::Signalled => {
                info!(queue = %self.name, job_id = %job.id(), "Cancellation requested for running job")
            }
            CancelOutcome::NotQueued => {}
        }

        outcome
    }

    /// Stop dispatching pending items. Running items are not affected.
    pub fn pause(&self) {
        self.state.lock().paused = true;
        info!(queue = %self.name, "Queue paused");
    }

    /// Re-enable dispatching.
    pub fn resume(&self) {
        self.state.lock().paused = false;
        info!(queue = %self.name, "Queue resumed");
        self.notify.notify_one();
    }

    /// True once the dispatcher was started, as long as the queue is neither
    /// paused nor shut down.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.shutdown.is_cancelled()
            && !self.state.lock().paused
    }

    /// Request the dispatcher to stop.
    ///
    /// Running items see their cancellation token cancelled; pending items stay
    /// where they are.
    pub fn shutdown(&self) {
        info!(queue = %self.name, "Queue shutdown requested");
        self.shutdown.cancel();
    }

    /// Number of items currently owned by a worker.
    pub fn active_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Number of items waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Look up a pending or running item.
    pub fn get_job_by_id(&self, id: &str) -> Option<Arc<J>> {
        let state = self.state.lock();
        state
            .running
            .iter()
            .map(|entry| &entry.job)
            .chain(state.pending.iter())
            .find(|job| job.id() == id)
            .cloned()
    }

    /// Snapshot of running items followed by pending items.
    pub fn get_all_jobs(&self) -> Vec<Arc<J>> {
        let state = self.state.lock();
        state
            .running
            .iter()
            .map(|entry| entry.job.clone())
            .chain(state.pending.iter().cloned())
            .collect()
    }

    /// Snapshot of the items owned by `owner`.
    pub fn get_jobs_by_user(&self, owner: &str) -> Vec<Arc<J>> {
        let state = self.state.lock();
        state
            .running
            .iter()
            .map(|entry| &entry.job)
            .chain(state.pending.iter())
            .filter(|job| job.owner() == owner)
            .cloned()
            .collect()
    }

    /// True if the item is pending or running.
    pub fn is_in_queue(&self, job: &J) -> bool {
        self.state.lock().contains(job.id())
    }

    /// 1-based rank among pending items, or 0 if the item is not pending.
    pub fn get_position_in_queue(&self, job: &J) -> usize {
        let state = self.state.lock();
        state
            .pending
            .iter()
            .position(|p| p.id() == job.id())
            .map_or(0, |index| index + 1)
    }
}

//! Workflow engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use job_queue::{CancelOutcome, Queue, QueueConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::recorder::JobRecorder;
use super::stages::{ExecutionStage, Promotions, SetupStage};
use crate::database::Repositories;
use crate::domain::{Job, JobState};
use crate::{Error, Result};

/// Worker counts of the two stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent setup phases.
    pub setup_concurrency: usize,
    /// Concurrent executions.
    pub execution_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            setup_concurrency: 5,
            execution_concurrency: 5,
        }
    }
}

/// Two queues chained into a pipeline: setup, then execution.
///
/// Every job enters through [`WorkflowEngine::submit`] (or
/// [`WorkflowEngine::restart`]) and reaches the execution queue only after its
/// setup phase succeeded.
pub struct WorkflowEngine {
    setup_queue: Arc<Queue<Job>>,
    execution_queue: Arc<Queue<Job>>,
    promotions: Arc<Promotions>,
    recorder: Arc<JobRecorder>,
    running: AtomicBool,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, repos: Repositories) -> Self {
        let recorder = Arc::new(JobRecorder::new(repos));
        let promotions = Arc::new(Promotions::default());

        let execution_queue = Arc::new(Queue::new(
            QueueConfig::new("execution", config.execution_concurrency),
            Arc::new(ExecutionStage::new(recorder.clone())),
        ));
        let setup_queue = Arc::new(Queue::new(
            QueueConfig::new("setup", config.setup_concurrency),
            Arc::new(SetupStage::new(
                recorder.clone(),
                execution_queue.clone(),
                promotions.clone(),
            )),
        ));

        Self {
            setup_queue,
            execution_queue,
            promotions,
            recorder,
            running: AtomicBool::new(false),
            dispatchers: Mutex::new(Vec::new()),
        }
    }

    pub fn recorder(&self) -> &JobRecorder {
        &self.recorder
    }

    /// Persist the job with its parameters and queue it for setup.
    pub async fn submit(&self, job: Arc<Job>) -> Result<()> {
        if self.is_in_queue(&job) {
            return Err(Error::validation(format!(
                "Job {} is already queued.",
                job.id()
            )));
        }

        self.recorder.persist_submission(&job).await?;
        job.after_submission();
        self.setup_queue.submit(job.clone());

        info!(job_id = %job.id(), owner = %job.owner().username, "Job submitted");
        Ok(())
    }

    /// Run a dead job again from the setup phase.
    ///
    /// The caller hands in a job rebuilt with a freshly loaded definition and
    /// workspace (see [`Job::restore`]). The existing job record is updated;
    /// parameters already stored are not inserted again.
    pub async fn restart(&self, job: Arc<Job>) -> Result<()> {
        if self.is_in_queue(&job) {
            return Err(Error::validation(format!(
                "Job {} is not pending.",
                job.id()
            )));
        }

        job.prepare_restart()?;
        self.recorder.persist_restart(&job).await?;
        self.recorder.forget_unsaved(job.id());
        job.after_submission();
        self.setup_queue.submit(job.clone());

        info!(job_id = %job.id(), "Job restarted");
        Ok(())
    }

    /// Cancel a job in whichever queue holds it.
    ///
    /// A pending job is removed and marked `CANCELED` in memory only; writing
    /// that state is up to the caller. A running job, or one moving from setup
    /// to execution, is signalled and finishes through the setup or execution
    /// completion callback.
    pub fn cancel(&self, job: &Job) -> CancelOutcome {
        let mut outcome = self.promotions.cancel_or(job.id(), || {
            if self.setup_queue.is_in_queue(job) {
                job.stamp_started();
                self.setup_queue.cancel(job)
            } else {
                CancelOutcome::NotQueued
            }
        });
        if outcome == CancelOutcome::NotQueued && self.execution_queue.is_in_queue(job) {
            outcome = self.execution_queue.cancel(job);
        }

        if outcome == CancelOutcome::Removed {
            job.mark_cancelled();
        }
        if outcome != CancelOutcome::NotQueued {
            info!(job_id = %job.id(), outcome = ?outcome, "Job cancelled");
        }
        outcome
    }

    /// Start both dispatchers. Must be called from within a tokio runtime.
    pub fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut dispatchers = self.dispatchers.lock();
        dispatchers.push(tokio::spawn(self.setup_queue.clone().run()));
        dispatchers.push(tokio::spawn(self.execution_queue.clone().run()));
        info!("Workflow engine started");
    }

    /// Pause both queues. Running jobs continue.
    pub fn block(&self) {
        self.setup_queue.pause();
        self.execution_queue.pause();
        info!("Workflow engine blocked");
    }

    pub fn resume(&self) {
        self.setup_queue.resume();
        self.execution_queue.resume();
        info!("Workflow engine resumed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.setup_queue.is_running()
            && self.execution_queue.is_running()
    }

    /// Stop both dispatchers, cancelling running jobs, and wait for them.
    pub async fn shutdown(&self) {
        info!("Stopping workflow engine");
        self.setup_queue.shutdown();
        self.execution_queue.shutdown();

        let dispatchers: Vec<_> = self.dispatchers.lock().drain(..).collect();
        for handle in dispatchers {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue dispatcher failed");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Workflow engine stopped");
    }

    /// A finished job whose final write failed and is still owed.
    pub fn get_unsaved_job(&self, id: &str) -> Option<Arc<Job>> {
        self.recorder.unsaved_job(id)
    }

    /// Look a job up in the execution queue, then in hand-off, then in the
    /// setup queue.
    pub fn get_job_by_id(&self, id: &str) -> Option<Arc<Job>> {
        self.execution_queue
            .get_job_by_id(id)
            .or_else(|| self.promotions.get(id))
            .or_else(|| self.setup_queue.get_job_by_id(id))
    }

    /// Queued and running jobs of `username`, with refreshed progress.
    pub fn get_jobs_by_user(&self, username: &str) -> Vec<Arc<Job>> {
        let mut jobs = self.setup_queue.get_jobs_by_user(username);
        for job in self.promotions.by_owner(username) {
            if !jobs.iter().any(|j| j.id() == job.id()) {
                jobs.push(job);
            }
        }
        for job in self.execution_queue.get_jobs_by_user(username) {
            if !jobs.iter().any(|j| j.id() == job.id()) {
                jobs.push(job);
            }
        }
        for job in &jobs {
            job.update_progress();
        }
        jobs
    }

    pub fn get_all_jobs_in_setup_queue(&self) -> Vec<Arc<Job>> {
        self.setup_queue.get_all_jobs()
    }

    pub fn get_all_jobs_in_execution_queue(&self) -> Vec<Arc<Job>> {
        self.execution_queue.get_all_jobs()
    }

    /// Jobs owned by a worker, over both queues.
    pub fn get_active_count(&self) -> usize {
        self.setup_queue.active_count() + self.execution_queue.active_count()
    }

    /// Position among the jobs waiting for execution; 0 if not waiting there.
    pub fn get_position_in_queue(&self, job: &Job) -> usize {
        self.execution_queue.get_position_in_queue(job)
    }

    /// Sum of the counters of every job in the execution queue with `state`.
    ///
    /// Live snapshot: jobs that already left the execution queue are not
    /// counted.
    pub fn get_counters(&self, state: JobState) -> BTreeMap<String, i64> {
        let mut totals = BTreeMap::new();
        for job in self.execution_queue.get_all_jobs() {
            if job.state() != state {
                continue;
            }
            for (name, value) in job.counters() {
                *totals.entry(name).or_insert(0) += value;
            }
        }
        totals
    }

    /// True from submission until the last stage that holds the job has
    /// removed it, including the hand-off between the two stages.
    pub fn is_in_queue(&self, job: &Job) -> bool {
        self.setup_queue.is_in_queue(job)
            || self.promotions.get(job.id()).is_some()
            || self.execution_queue.is_in_queue(job)
    }
}

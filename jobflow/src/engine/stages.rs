//! Queue handlers for the setup and execution stages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use job_queue::{CancelOutcome, Queue, QueueHandler, Runnable};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::recorder::JobRecorder;
use crate::domain::{Job, JobState};

struct Promotion {
    job: Arc<Job>,
    cancelled: bool,
}

/// Jobs whose setup succeeded, between the end of their setup body and their
/// arrival in the execution queue.
///
/// A job enters while it is still running in the setup queue and leaves only
/// by being submitted to the execution queue under the same lock, so it is
/// always visible in at least one place.
#[derive(Default)]
pub(super) struct Promotions {
    jobs: Mutex<HashMap<String, Promotion>>,
}

impl Promotions {
    /// Register a job whose setup body succeeded. Refused once `token` was
    /// cancelled.
    fn enter(&self, job: &Arc<Job>, token: &CancellationToken) -> bool {
        let mut jobs = self.jobs.lock();
        if token.is_cancelled() {
            return false;
        }
        jobs.insert(
            job.id().to_string(),
            Promotion {
                job: job.clone(),
                cancelled: false,
            },
        );
        true
    }

    pub(super) fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.lock().get(id).map(|p| p.job.clone())
    }

    pub(super) fn by_owner(&self, username: &str) -> Vec<Arc<Job>> {
        self.jobs
            .lock()
            .values()
            .filter(|p| p.job.owner().username == username)
            .map(|p| p.job.clone())
            .collect()
    }

    /// Flag a job in hand-off as cancelled. Otherwise run `fallback` while no
    /// job can enter.
    pub(super) fn cancel_or(
        &self,
        id: &str,
        fallback: impl FnOnce() -> CancelOutcome,
    ) -> CancelOutcome {
        let mut jobs = self.jobs.lock();
        if let Some(promotion) = jobs.get_mut(id) {
            promotion.cancelled = true;
            return CancelOutcome::Signalled;
        }
        fallback()
    }

    /// Move a registered job to `WAITING` and into `execution`.
    ///
    /// Returns false if the job was never registered, was cancelled in
    /// hand-off (it is then marked `CANCELED`) or could not become `WAITING`.
    fn promote(&self, job: &Arc<Job>, execution: &Queue<Job>) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(promotion) = jobs.remove(job.id()) else {
            return false;
        };
        if promotion.cancelled {
            drop(jobs);
            job.mark_cancelled();
            return false;
        }
        if let Err(e) = job.set_state(JobState::Waiting) {
            drop(jobs);
            warn!(job_id = %job.id(), error = %e, "Job not promoted");
            return false;
        }
        let submitted = execution.submit(job.clone());
        drop(jobs);

        if !submitted {
            warn!(job_id = %job.id(), "Job already in the execution queue");
        }
        true
    }
}

/// Stage 1: runs the setup phase and promotes or finalizes the job.
pub(super) struct SetupStage {
    recorder: Arc<JobRecorder>,
    execution: Arc<Queue<Job>>,
    promotions: Arc<Promotions>,
}

impl SetupStage {
    pub(super) fn new(
        recorder: Arc<JobRecorder>,
        execution: Arc<Queue<Job>>,
        promotions: Arc<Promotions>,
    ) -> Self {
        Self {
            recorder,
            execution,
            promotions,
        }
    }
}

#[async_trait]
impl QueueHandler<Job> for SetupStage {
    fn create_runnable(&self, job: Arc<Job>, cancellation_token: CancellationToken) -> Runnable {
        let promotions = self.promotions.clone();
        Box::pin(async move {
            if job.execute_setup(cancellation_token.clone()).await
                && !promotions.enter(&job, &cancellation_token)
            {
                job.mark_cancelled();
            }
        })
    }

    async fn on_complete(&self, job: Arc<Job>) {
        if job.is_setup_complete() && self.promotions.promote(&job, &self.execution) {
            info!(job_id = %job.id(), "Setup succeeded, queued for execution");
            return;
        }

        if job.state() == JobState::SetupRunning {
            if let Err(e) = job.set_state(JobState::Dead) {
                warn!(job_id = %job.id(), error = %e, "Could not mark job dead");
            }
        }
        job.stamp_finished();
        job.update_progress();
        info!(job_id = %job.id(), state = %job.state(), "Setup did not succeed");

        if let Err(e) = self.recorder.persist_results(&job).await {
            self.recorder.keep_unsaved(&job, true, false, &e);
        }
    }
}

/// Stage 2: runs the job and records its results and counters.
pub(super) struct ExecutionStage {
    recorder: Arc<JobRecorder>,
}

impl ExecutionStage {
    pub(super) fn new(recorder: Arc<JobRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl QueueHandler<Job> for ExecutionStage {
    fn create_runnable(&self, job: Arc<Job>, cancellation_token: CancellationToken) -> Runnable {
        Box::pin(async move {
            job.run(cancellation_token).await;
        })
    }

    async fn on_complete(&self, job: Arc<Job>) {
        if job.state() == JobState::Running {
            // The run body never reached an outcome.
            job.set_error("Execution aborted unexpectedly.");
            if let Err(e) = job.set_state(JobState::Failed) {
                warn!(job_id = %job.id(), error = %e, "Could not mark job failed");
            }
        }
        job.stamp_finished();
        job.update_progress();

        if let Err(e) = self.recorder.persist_results(&job).await {
            // Counters wait for the results so a retry writes both in order.
            self.recorder.keep_unsaved(&job, true, true, &e);
            return;
        }
        match self.recorder.flush_counters(&job).await {
            Ok(count) => {
                info!(job_id = %job.id(), state = %job.state(), counters = count, "Job completed")
            }
            Err(e) => self.recorder.keep_unsaved(&job, false, true, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_queue::QueueConfig;

    use crate::domain::{ApplicationRef, User};
    use crate::workflow::{WorkflowDefinition, Workspace};

    struct Idle;

    #[async_trait]
    impl QueueHandler<Job> for Idle {
        fn create_runnable(&self, _job: Arc<Job>, _token: CancellationToken) -> Runnable {
            Box::pin(async {})
        }

        async fn on_complete(&self, _job: Arc<Job>) {}
    }

    fn execution_queue() -> Queue<Job> {
        Queue::new(QueueConfig::new("execution", 1), Arc::new(Idle))
    }

    async fn set_up_job(id: &str) -> Arc<Job> {
        let job = Arc::new(Job::new(
            id,
            User::new(1, "alice"),
            ApplicationRef {
                id: "demo".to_string(),
                name: "Demo".to_string(),
                version: "1.0".to_string(),
            },
            Arc::new(WorkflowDefinition::new("demo", "1.0")),
            Workspace::new(format!("/tmp/jobflow-test/{id}"), format!("/remote/{id}")),
            Vec::new(),
        ));
        assert!(job.execute_setup(CancellationToken::new()).await);
        job
    }

    #[tokio::test]
    async fn test_promotion_moves_job_into_execution() {
        let promotions = Promotions::default();
        let queue = execution_queue();
        let job = set_up_job("job-promoted").await;

        assert!(promotions.enter(&job, &CancellationToken::new()));
        assert!(promotions.get("job-promoted").is_some());
        assert_eq!(promotions.by_owner("alice").len(), 1);

        assert!(promotions.promote(&job, &queue));
        assert_eq!(job.state(), JobState::Waiting);
        assert!(queue.is_in_queue(&job));
        assert!(promotions.get("job-promoted").is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_hand_off_stops_promotion() {
        let promotions = Promotions::default();
        let queue = execution_queue();
        let job = set_up_job("job-handoff").await;
        assert!(promotions.enter(&job, &CancellationToken::new()));

        let outcome = promotions.cancel_or("job-handoff", || CancelOutcome::NotQueued);
        assert_eq!(outcome, CancelOutcome::Signalled);

        assert!(!promotions.promote(&job, &queue));
        assert_eq!(job.state(), JobState::Canceled);
        assert!(!queue.is_in_queue(&job));
        assert!(promotions.get("job-handoff").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_token_blocks_hand_off() {
        let promotions = Promotions::default();
        let job = set_up_job("job-late").await;
        let token = CancellationToken::new();
        token.cancel();

        assert!(!promotions.enter(&job, &token));
        assert!(promotions.get("job-late").is_none());
        let outcome = promotions.cancel_or("job-late", || CancelOutcome::NotQueued);
        assert_eq!(outcome, CancelOutcome::NotQueued);
    }
}

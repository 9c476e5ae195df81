//! Job submission, restart, status and cancellation on behalf of a user.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::Serialize;
use tracing::{info, warn};

use crate::database::Repositories;
use crate::database::models::ParameterDbModel;
use crate::domain::{
    ApplicationRef, Download, Job, JobProgress, JobSnapshot, JobState, Parameter,
    ParameterDirection, Step, StoredJob, User,
};
use crate::engine::{CancelOutcome, WorkflowEngine};
use crate::utils::fs::ensure_dir_all_with_op;
use crate::workflow::{WorkflowLoader, WorkspaceResolver};
use crate::{Error, Result};

/// Attempts at finding an unused job id before giving up.
const MAX_ID_ATTEMPTS: usize = 10;

/// Admission limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLimits {
    /// Jobs running over both stages.
    pub max_running_jobs: usize,
    /// Queued and running jobs of one signed-in user.
    pub max_running_jobs_per_user: usize,
    /// Salt hashed into anonymous job ids.
    pub public_id_salt: String,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            max_running_jobs: 20,
            max_running_jobs_per_user: 2,
            public_id_salt: "jobflow".to_string(),
        }
    }
}

/// Job id for a submission at `now`: `job-YYYYMMDD-HHMMSS-mmm`, with an MD5
/// suffix for anonymous submissions.
pub fn generate_job_id(now: DateTime<Utc>, anonymous_salt: Option<&str>) -> String {
    let id = format!("job-{}", now.format("%Y%m%d-%H%M%S-%3f"));
    match anonymous_salt {
        Some(salt) => {
            let digest = Md5::digest(format!("{id}-{salt}").as_bytes());
            format!("{id}-{}", hex::encode(digest))
        }
        None => id,
    }
}

/// What a status request returns.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub owner: String,
    pub application: ApplicationRef,
    pub state: JobState,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Rank among jobs waiting for execution, 0 if not waiting there.
    pub position_in_queue: usize,
    pub progress: Option<JobProgress>,
    pub inputs: Vec<Parameter>,
    pub outputs: Vec<Parameter>,
    pub steps: Vec<Step>,
    pub counters: BTreeMap<String, i64>,
    pub error: Option<String>,
    pub persistence_error: Option<String>,
    /// The job is held by the engine rather than read from the store.
    pub live: bool,
}

impl From<JobSnapshot> for JobStatus {
    fn from(job: JobSnapshot) -> Self {
        Self {
            id: job.id,
            owner: job.owner.username,
            application: job.application,
            state: job.state,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            position_in_queue: job.position_in_queue,
            progress: Some(job.progress),
            inputs: job.inputs,
            outputs: job.outputs,
            steps: job.steps,
            counters: job.counters,
            error: job.error,
            persistence_error: job.persistence_error,
            live: true,
        }
    }
}

/// Everything the API layer needs to act on jobs.
pub struct JobService {
    engine: Arc<WorkflowEngine>,
    loader: Arc<dyn WorkflowLoader>,
    workspaces: Arc<dyn WorkspaceResolver>,
    repos: Repositories,
    limits: JobLimits,
    public_user: User,
}

impl JobService {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        loader: Arc<dyn WorkflowLoader>,
        workspaces: Arc<dyn WorkspaceResolver>,
        repos: Repositories,
        limits: JobLimits,
    ) -> Self {
        Self {
            engine,
            loader,
            workspaces,
            repos,
            limits,
            public_user: User::public(0),
        }
    }

    /// Account anonymous submissions run under.
    pub fn with_public_user(mut self, user: User) -> Self {
        self.public_user = user;
        self
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Create a job from submitted form values and hand it to the engine.
    ///
    /// `user` is `None` for anonymous submissions.
    pub async fn submit(
        &self,
        user: Option<&User>,
        app_id: &str,
        values: &HashMap<String, String>,
    ) -> Result<Arc<Job>> {
        let application = self.loader.load(app_id, user).await?;

        if let Some(user) = user {
            let queued = self.engine.get_jobs_by_user(&user.username).len();
            if queued >= self.limits.max_running_jobs_per_user {
                return Err(Error::admission(format!(
                    "Only {} jobs per user can be executed simultaneously.",
                    self.limits.max_running_jobs_per_user
                )));
            }
        }
        if self.engine.get_active_count() >= self.limits.max_running_jobs {
            return Err(Error::admission(format!(
                "More than {} jobs are currently in the queue.",
                self.limits.max_running_jobs
            )));
        }

        let owner = user.cloned().unwrap_or_else(|| self.public_user.clone());
        let id = self.next_job_id(user.is_none()).await?;
        let inputs = application.definition.resolve_inputs(values)?;

        let workspace = self.workspaces.resolve(&id);
        ensure_dir_all_with_op("creating workspace", &workspace.local).await?;

        let job = Arc::new(Job::new(
            id,
            owner,
            application.reference(),
            application.definition.clone(),
            workspace,
            inputs,
        ));
        self.engine.submit(job.clone()).await?;

        info!(job_id = %job.id(), app_id = %app_id, "Submission accepted");
        Ok(job)
    }

    /// Run a dead job again.
    pub async fn restart(&self, user: &User, job_id: &str) -> Result<Arc<Job>> {
        if let Some(job) = self.engine.get_job_by_id(job_id) {
            if !user.can_access(job.owner()) {
                return Err(Error::AccessDenied);
            }
            return Err(Error::validation(format!("Job {job_id} is not pending.")));
        }

        if let Some(job) = self.engine.get_unsaved_job(job_id) {
            if !user.can_access(job.owner()) {
                return Err(Error::AccessDenied);
            }
            // The stored record is stale until the owed write lands.
            let job = self.engine.recorder().retry_unsaved(job_id).await.unwrap_or(job);
            if let Some(e) = job.persistence_error() {
                return Err(Error::Database(e));
            }
        }

        let stored = self.repos.jobs.get_job(job_id).await?.to_stored()?;
        if !user.can_access(&stored.owner) {
            return Err(Error::AccessDenied);
        }
        if !stored.state.is_restartable() {
            return Err(Error::validation(format!("Job {job_id} is not pending.")));
        }

        let application = self
            .loader
            .load(&stored.application.id, Some(&stored.owner))
            .await?;
        let workspace = self.workspaces.resolve(job_id);
        ensure_dir_all_with_op("creating workspace", &workspace.local).await?;
        let parameters = self.stored_parameters(job_id).await?;

        let job = Arc::new(Job::restore(
            stored,
            application.definition.clone(),
            workspace,
            parameters,
        ));
        self.engine.restart(job.clone()).await?;
        Ok(job)
    }

    /// Live status when the engine holds the job, the stored record otherwise.
    ///
    /// A finished job whose final write failed is retried first and reported
    /// from memory, with the persistence error if the retry failed again.
    pub async fn status(&self, user: &User, job_id: &str) -> Result<JobStatus> {
        if let Some(job) = self.engine.get_job_by_id(job_id) {
            if !user.can_access(job.owner()) {
                return Err(Error::AccessDenied);
            }
            job.update_progress();
            job.set_position_in_queue(self.engine.get_position_in_queue(&job));
            return Ok(job.snapshot().into());
        }

        if let Some(job) = self.engine.get_unsaved_job(job_id) {
            if !user.can_access(job.owner()) {
                return Err(Error::AccessDenied);
            }
            let job = self.engine.recorder().retry_unsaved(job_id).await.unwrap_or(job);
            job.set_position_in_queue(0);
            job.update_progress();
            return Ok(job.snapshot().into());
        }

        let stored = self.repos.jobs.get_job(job_id).await?.to_stored()?;
        if !user.can_access(&stored.owner) {
            return Err(Error::AccessDenied);
        }
        self.stored_status(stored).await
    }

    /// Cancel a queued or running job.
    pub async fn cancel(&self, user: &User, job_id: &str) -> Result<CancelOutcome> {
        let Some(job) = self.engine.get_job_by_id(job_id) else {
            let stored = self.repos.jobs.get_job(job_id).await?.to_stored()?;
            if !user.can_access(&stored.owner) {
                return Err(Error::AccessDenied);
            }
            return Err(Error::validation(format!("Job {job_id} is not running.")));
        };

        if !user.can_access(job.owner()) {
            return Err(Error::AccessDenied);
        }

        let outcome = self.engine.cancel(&job);
        if outcome == CancelOutcome::Removed {
            // The job left its queue without a completion callback.
            self.engine
                .recorder()
                .persist_results(&job)
                .await
                .inspect_err(|e| {
                    warn!(job_id = %job_id, "Cancelled job kept in memory until it is stored");
                    self.engine.recorder().keep_unsaved(&job, true, false, e);
                })?;
        }
        Ok(outcome)
    }

    /// Live counter totals of jobs in the execution queue with `state`.
    pub fn counters(&self, state: JobState) -> BTreeMap<String, i64> {
        self.engine.get_counters(state)
    }

    /// Counter totals over every finished job.
    pub async fn historical_counters(&self) -> Result<BTreeMap<String, i64>> {
        self.repos.counters.totals().await
    }

    async fn next_job_id(&self, anonymous: bool) -> Result<String> {
        let salt = anonymous.then_some(self.limits.public_id_salt.as_str());
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_job_id(Utc::now(), salt);
            if self.engine.get_job_by_id(&id).is_some() {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                continue;
            }
            match self.repos.jobs.get_job(&id).await {
                Err(Error::NotFound { .. }) => return Ok(id),
                Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(1)).await,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Other("Could not allocate a job id".to_string()))
    }

    async fn stored_parameters(&self, job_id: &str) -> Result<Vec<Parameter>> {
        self.repos
            .parameters
            .list_parameters(job_id)
            .await?
            .iter()
            .map(ParameterDbModel::to_parameter)
            .collect()
    }

    async fn stored_status(&self, stored: StoredJob) -> Result<JobStatus> {
        let mut parameters = self.stored_parameters(&stored.id).await?;
        let downloads = self.repos.downloads.list_downloads(&stored.id).await?;
        for param in &mut parameters {
            param.files = downloads
                .iter()
                .filter(|d| Some(d.parameter_id) == param.id)
                .map(|d| Download {
                    name: d.name.clone(),
                    path: d.path.clone(),
                    size: u64::try_from(d.size).unwrap_or_default(),
                })
                .collect();
        }
        let (inputs, outputs): (Vec<_>, Vec<_>) = parameters
            .into_iter()
            .partition(|p| p.direction == ParameterDirection::Input);

        let mut steps = Vec::new();
        for record in self.repos.steps.list_steps(&stored.id).await? {
            let messages = self.repos.steps.list_messages(record.id).await?;
            steps.push(record.to_step(&messages)?);
        }

        let mut counters = BTreeMap::new();
        for counter in self.repos.counters.list_counters(&stored.id).await? {
            *counters.entry(counter.name).or_insert(0) += counter.value;
        }

        Ok(JobStatus {
            id: stored.id,
            owner: stored.owner.username,
            application: stored.application,
            state: stored.state,
            submitted_at: stored.submitted_at,
            started_at: stored.started_at,
            finished_at: stored.finished_at,
            position_in_queue: 0,
            progress: None,
            inputs,
            outputs,
            steps,
            counters,
            error: stored.error,
            persistence_error: None,
            live: false,
        })
    }
}

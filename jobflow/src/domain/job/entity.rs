//! The job aggregate.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use job_queue::QueueItem;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::StepContext;
use super::state::JobState;
use crate::domain::parameter::{Download, Parameter, ParameterDirection};
use crate::domain::step::{Message, MessageLevel, Step};
use crate::domain::user::User;
use crate::utils::fs::list_files_recursive;
use crate::workflow::{Workspace, WorkflowDefinition, WorkflowStep};
use crate::{Error, Result};

/// Name of the step recorded by the built-in input validation.
pub const INPUT_VALIDATION_STEP: &str = "Input Validation";

/// Number of trailing messages kept in the progress snapshot.
const LOG_TAIL_LEN: usize = 5;

/// The application a job was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRef {
    pub id: String,
    pub name: String,
    pub version: String,
}

/// Progress derived from the current step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    pub current_step: Option<String>,
    pub log_tail: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A job as read back from the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: String,
    pub owner: User,
    pub application: ApplicationRef,
    pub state: JobState,
    pub local_workspace: String,
    pub remote_workspace: String,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Serializable view of a job at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub owner: User,
    pub application: ApplicationRef,
    pub state: JobState,
    pub workspace: Workspace,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub setup_complete: bool,
    pub position_in_queue: usize,
    pub progress: JobProgress,
    pub inputs: Vec<Parameter>,
    pub outputs: Vec<Parameter>,
    pub steps: Vec<Step>,
    pub counters: BTreeMap<String, i64>,
    pub error: Option<String>,
    pub persistence_error: Option<String>,
}

struct JobInner {
    state: JobState,
    definition: Arc<WorkflowDefinition>,
    workspace: Workspace,
    submitted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    setup_complete: bool,
    inputs: Vec<Parameter>,
    outputs: Vec<Parameter>,
    steps: Vec<Step>,
    counters: BTreeMap<String, i64>,
    counters_flushed: bool,
    position_in_queue: usize,
    progress: JobProgress,
    error: Option<String>,
    persistence_error: Option<String>,
}

/// One submitted unit of work.
///
/// Identity, owner and application never change. Everything else sits behind
/// a lock and is mutated by the queue worker that currently owns the job, the
/// engine callbacks and API reads.
pub struct Job {
    id: String,
    owner: User,
    application: ApplicationRef,
    inner: RwLock<JobInner>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("owner", &self.owner.username)
            .field("application", &self.application.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Job {
    /// Create a new job in `INCOMING` state. Output parameters are derived
    /// from the definition and the workspace.
    pub fn new(
        id: impl Into<String>,
        owner: User,
        application: ApplicationRef,
        definition: Arc<WorkflowDefinition>,
        workspace: Workspace,
        inputs: Vec<Parameter>,
    ) -> Self {
        let outputs = definition.output_parameters(&workspace);
        Self {
            id: id.into(),
            owner,
            application,
            inner: RwLock::new(JobInner {
                state: JobState::Incoming,
                definition,
                workspace,
                submitted_at: None,
                started_at: None,
                finished_at: None,
                setup_complete: false,
                inputs,
                outputs,
                steps: Vec::new(),
                counters: BTreeMap::new(),
                counters_flushed: false,
                position_in_queue: 0,
                progress: JobProgress::default(),
                error: None,
                persistence_error: None,
            }),
        }
    }

    /// Rebuild a job from its stored record.
    ///
    /// `definition` and `workspace` are freshly loaded by the caller; stored
    /// parameters keep their store ids so they are not inserted again.
    pub fn restore(
        stored: StoredJob,
        definition: Arc<WorkflowDefinition>,
        workspace: Workspace,
        parameters: Vec<Parameter>,
    ) -> Self {
        let (inputs, outputs): (Vec<_>, Vec<_>) = parameters
            .into_iter()
            .partition(|p| p.direction == ParameterDirection::Input);
        let outputs = if outputs.is_empty() {
            definition.output_parameters(&workspace)
        } else {
            outputs
        };

        Self {
            id: stored.id,
            owner: stored.owner,
            application: stored.application,
            inner: RwLock::new(JobInner {
                state: stored.state,
                definition,
                workspace,
                submitted_at: stored.submitted_at,
                started_at: stored.started_at,
                finished_at: stored.finished_at,
                setup_complete: false,
                inputs,
                outputs,
                steps: Vec::new(),
                counters: BTreeMap::new(),
                counters_flushed: false,
                position_in_queue: 0,
                progress: JobProgress::default(),
                error: stored.error,
                persistence_error: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &User {
        &self.owner
    }

    pub fn application(&self) -> &ApplicationRef {
        &self.application
    }

    pub fn state(&self) -> JobState {
        self.inner.read().state
    }

    /// Move to `target`, validating the transition.
    pub fn set_state(&self, target: JobState) -> Result<()> {
        let mut inner = self.inner.write();
        let from = inner.state;
        inner.state = from.transition_to(target)?;
        if from != target {
            debug!(job_id = %self.id, from = %from, to = %target, "Job state changed");
        }
        Ok(())
    }

    pub fn workspace(&self) -> Workspace {
        self.inner.read().workspace.clone()
    }

    pub fn definition(&self) -> Arc<WorkflowDefinition> {
        self.inner.read().definition.clone()
    }

    pub fn is_setup_complete(&self) -> bool {
        self.inner.read().setup_complete
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().submitted_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().finished_at
    }

    /// Set the start time unless it is already set.
    pub fn stamp_started(&self) {
        let mut inner = self.inner.write();
        if inner.started_at.is_none() {
            inner.started_at = Some(Utc::now());
        }
    }

    /// Set the end time unless it is already set. Never earlier than the start.
    pub fn stamp_finished(&self) {
        let mut inner = self.inner.write();
        if inner.finished_at.is_none() {
            let now = Utc::now();
            let started = *inner.started_at.get_or_insert(now);
            inner.finished_at = Some(now.max(started));
        }
    }

    pub fn inputs(&self) -> Vec<Parameter> {
        self.inner.read().inputs.clone()
    }

    pub fn outputs(&self) -> Vec<Parameter> {
        self.inner.read().outputs.clone()
    }

    /// Value of an input or output parameter.
    pub fn parameter_value(&self, name: &str) -> Option<String> {
        let inner = self.inner.read();
        inner
            .inputs
            .iter()
            .chain(inner.outputs.iter())
            .find(|p| p.name == name)
            .map(|p| p.value.clone())
    }

    /// Record the store id of a persisted parameter.
    pub fn set_parameter_id(&self, direction: ParameterDirection, name: &str, id: i64) {
        let mut inner = self.inner.write();
        let params = match direction {
            ParameterDirection::Input => &mut inner.inputs,
            ParameterDirection::Output => &mut inner.outputs,
        };
        if let Some(param) = params.iter_mut().find(|p| p.name == name) {
            param.id = Some(id);
        }
    }

    pub fn steps(&self) -> Vec<Step> {
        self.inner.read().steps.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.inner.write().error = Some(error.into());
    }

    pub fn persistence_error(&self) -> Option<String> {
        self.inner.read().persistence_error.clone()
    }

    /// Remember (or clear) the last failed durable write for this job.
    pub fn set_persistence_error(&self, error: Option<String>) {
        self.inner.write().persistence_error = error;
    }

    pub fn position_in_queue(&self) -> usize {
        self.inner.read().position_in_queue
    }

    pub fn set_position_in_queue(&self, position: usize) {
        self.inner.write().position_in_queue = position;
    }

    pub fn progress(&self) -> JobProgress {
        self.inner.read().progress.clone()
    }

    /// Add `delta` to the named counter.
    pub fn increment_counter(&self, name: &str, delta: i64) {
        let mut inner = self.inner.write();
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Snapshot of the counter map.
    pub fn counters(&self) -> BTreeMap<String, i64> {
        self.inner.read().counters.clone()
    }

    /// Hand out the counters for the durable flush.
    ///
    /// Returns `None` once the counters of the current attempt were taken.
    pub fn take_counters_for_flush(&self) -> Option<BTreeMap<String, i64>> {
        let mut inner = self.inner.write();
        if inner.counters_flushed {
            return None;
        }
        inner.counters_flushed = true;
        Some(inner.counters.clone())
    }

    /// Hand the counters back after a failed flush so a retry writes them.
    pub fn release_counters_flush(&self) {
        self.inner.write().counters_flushed = false;
    }

    /// Lifecycle hook run by the engine right after the job was admitted.
    pub fn after_submission(&self) {
        let mut inner = self.inner.write();
        if inner.submitted_at.is_none() {
            inner.submitted_at = Some(Utc::now());
        }
        inner.position_in_queue = 0;
        inner.progress = JobProgress::default();
        inner.persistence_error = None;
    }

    /// Reset the job for another attempt and move it back into setup.
    ///
    /// Only dead jobs can be restarted; identity, workspace and parameters are
    /// kept.
    pub fn prepare_restart(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.state.is_restartable() {
            return Err(Error::validation(format!("Job {} is not pending.", self.id)));
        }

        inner.state = inner.state.transition_to(JobState::SetupRunning)?;
        inner.setup_complete = false;
        inner.steps.clear();
        inner.counters.clear();
        inner.counters_flushed = false;
        inner.started_at = None;
        inner.finished_at = None;
        inner.error = None;
        for output in &mut inner.outputs {
            output.files.clear();
        }

        info!(job_id = %self.id, "Job prepared for restart");
        Ok(())
    }

    /// Refresh the progress snapshot from the current step.
    pub fn update_progress(&self) {
        let mut inner = self.inner.write();
        let total = 1 + inner.definition.setup.len() + inner.definition.steps.len();
        let finished = inner.steps.iter().filter(|s| s.is_finished()).count();

        let percent = if inner.state == JobState::Success {
            100
        } else {
            ((finished * 100) / total).min(100) as u8
        };

        let current = inner.steps.last();
        let current_step = current.map(|s| s.name.clone());
        let log_tail = current
            .map(|s| {
                let skip = s.messages.len().saturating_sub(LOG_TAIL_LEN);
                s.messages.iter().skip(skip).map(|m| m.text.clone()).collect()
            })
            .unwrap_or_default();

        inner.progress = JobProgress {
            percent,
            current_step,
            log_tail,
            updated_at: Some(Utc::now()),
        };
    }

    /// Serializable view of the job.
    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.inner.read();
        JobSnapshot {
            id: self.id.clone(),
            owner: self.owner.clone(),
            application: self.application.clone(),
            state: inner.state,
            workspace: inner.workspace.clone(),
            submitted_at: inner.submitted_at,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            setup_complete: inner.setup_complete,
            position_in_queue: inner.position_in_queue,
            progress: inner.progress.clone(),
            inputs: inner.inputs.clone(),
            outputs: inner.outputs.clone(),
            steps: inner.steps.clone(),
            counters: inner.counters.clone(),
            error: inner.error.clone(),
            persistence_error: inner.persistence_error.clone(),
        }
    }

    /// Setup phase body.
    ///
    /// Validates the inputs, then runs the definition's setup steps. Returns
    /// true and sets the setup-complete flag only if every part succeeded. A
    /// cancelled token leaves the job `CANCELED`.
    pub async fn execute_setup(&self, token: CancellationToken) -> bool {
        if let Err(e) = self.set_state(JobState::SetupRunning) {
            warn!(job_id = %self.id, error = %e, "Job cannot enter setup");
            return false;
        }
        self.stamp_started();

        if token.is_cancelled() {
            self.mark_cancelled();
            return false;
        }

        if !self.validate_inputs() {
            return false;
        }

        let setup_steps = self.definition().setup.clone();
        for step in setup_steps {
            if token.is_cancelled() {
                self.mark_cancelled();
                return false;
            }
            if !self.run_step(step.as_ref(), &token).await {
                if token.is_cancelled() {
                    self.mark_cancelled();
                }
                return false;
            }
        }

        // A cancel that arrived during the last step still wins.
        if token.is_cancelled() {
            self.mark_cancelled();
            return false;
        }

        self.inner.write().setup_complete = true;
        debug!(job_id = %self.id, "Setup complete");
        true
    }

    /// Execution phase body.
    ///
    /// Runs every step in order and checks the cancellation token at each step
    /// boundary and once more after the last step. Ends in `SUCCESS`, `FAILED` or `CANCELED`.
    pub async fn run(&self, token: CancellationToken) {
        if let Err(e) = self.set_state(JobState::Running) {
            warn!(job_id = %self.id, error = %e, "Job cannot start running");
            return;
        }
        self.stamp_started();
        info!(job_id = %self.id, "Job running");

        let steps = self.definition().steps.clone();
        let mut outcome = JobState::Success;
        for step in steps {
            if token.is_cancelled() {
                outcome = JobState::Canceled;
                break;
            }
            if !self.run_step(step.as_ref(), &token).await {
                outcome = if token.is_cancelled() {
                    JobState::Canceled
                } else {
                    JobState::Failed
                };
                break;
            }
            self.update_progress();
        }
        if outcome == JobState::Success && token.is_cancelled() {
            outcome = JobState::Canceled;
        }

        if outcome == JobState::Canceled {
            self.mark_cancelled();
        } else if let Err(e) = self.set_state(outcome) {
            warn!(job_id = %self.id, error = %e, "Could not record job outcome");
        }

        self.collect_downloads().await;
        self.stamp_finished();
        self.update_progress();
        info!(job_id = %self.id, state = %self.state(), "Job finished");
    }

    /// Mark as cancelled, stamping the end time.
    pub fn mark_cancelled(&self) {
        match self.set_state(JobState::Canceled) {
            Ok(()) => {
                self.set_error("Job was cancelled.");
                self.stamp_finished();
            }
            Err(e) => debug!(job_id = %self.id, error = %e, "Job not cancelled"),
        }
    }

    /// Record the built-in validation step. Missing required inputs fail it.
    fn validate_inputs(&self) -> bool {
        let index = self.begin_step(INPUT_VALIDATION_STEP);
        let definition = self.definition();
        let inputs = self.inputs();

        let missing: Vec<&str> = definition
            .inputs
            .iter()
            .filter(|def| def.required)
            .filter(|def| {
                inputs
                    .iter()
                    .find(|p| p.name == def.id)
                    .is_none_or(|p| p.value.trim().is_empty())
            })
            .map(|def| def.id.as_str())
            .collect();

        let ok = if missing.is_empty() {
            self.push_message(index, Message::info("Input validation successful."));
            true
        } else {
            let text = format!("Missing required parameters: {}", missing.join(", "));
            self.push_message(index, Message::error(text.clone()));
            self.set_error(text);
            false
        };
        self.finish_step(index);
        ok
    }

    async fn run_step(&self, step: &dyn WorkflowStep, token: &CancellationToken) -> bool {
        let index = self.begin_step(step.name());
        let ctx = StepContext::new(self, index, token);

        let ok = match step.run(&ctx).await {
            Ok(true) => true,
            Ok(false) => {
                if !token.is_cancelled() {
                    self.set_error(format!("Step '{}' failed.", step.name()));
                }
                false
            }
            Err(e) => {
                ctx.log(MessageLevel::Error, e.to_string());
                self.set_error(format!("Step '{}' failed: {e}", step.name()));
                false
            }
        };

        self.finish_step(index);
        ok
    }

    /// Collect download records for download-producing outputs that live in
    /// the local workspace.
    async fn collect_downloads(&self) {
        let outputs = self.outputs();
        for (position, output) in outputs.iter().enumerate() {
            if !output.download || !output.kind.is_local_path() {
                continue;
            }

            let root = Path::new(&output.value);
            let files = match list_files_recursive(root).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(job_id = %self.id, output = %output.name, error = %e, "Could not collect downloads");
                    continue;
                }
            };

            let mut downloads = Vec::with_capacity(files.len());
            for file in files {
                let size = tokio::fs::metadata(&file).await.map(|m| m.len()).unwrap_or(0);
                let name = file
                    .strip_prefix(root)
                    .ok()
                    .filter(|rel| !rel.as_os_str().is_empty())
                    .or_else(|| file.file_name().map(Path::new))
                    .map(|rel| rel.to_string_lossy().into_owned())
                    .unwrap_or_default();
                downloads.push(Download {
                    name,
                    path: file.to_string_lossy().into_owned(),
                    size,
                });
            }

            if let Some(param) = self.inner.write().outputs.get_mut(position) {
                param.files = downloads;
            }
        }
    }

    pub(super) fn begin_step(&self, name: &str) -> usize {
        let mut inner = self.inner.write();
        let order = inner.steps.len();
        inner.steps.push(Step::new(name, order));
        order
    }

    pub(super) fn finish_step(&self, index: usize) {
        if let Some(step) = self.inner.write().steps.get_mut(index) {
            step.finished_at = Some(Utc::now());
        }
    }

    pub(super) fn push_message(&self, index: usize, message: Message) {
        if let Some(step) = self.inner.write().steps.get_mut(index) {
            step.messages.push(message);
        }
    }
}

impl QueueItem for Job {
    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &str {
        &self.owner.username
    }
}

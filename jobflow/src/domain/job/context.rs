//! What a workflow step sees of its job.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use super::entity::Job;
use crate::domain::step::{Message, MessageLevel};
use crate::workflow::Workspace;

/// Per-step view of a running job.
///
/// Messages logged through the context land in the step being executed.
pub struct StepContext<'a> {
    job: &'a Job,
    step_index: usize,
    token: &'a CancellationToken,
}

impl<'a> StepContext<'a> {
    pub(super) fn new(job: &'a Job, step_index: usize, token: &'a CancellationToken) -> Self {
        Self {
            job,
            step_index,
            token,
        }
    }

    pub fn job_id(&self) -> &str {
        self.job.id()
    }

    /// Value of an input parameter.
    pub fn input(&self, name: &str) -> Option<String> {
        self.job
            .inputs()
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }

    /// Path of an output parameter.
    pub fn output(&self, name: &str) -> Option<String> {
        self.job
            .outputs()
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }

    pub fn workspace(&self) -> Workspace {
        self.job.workspace()
    }

    /// Placeholder values available to commands: every parameter plus
    /// `job_id`, `local_workspace` and `remote_workspace`.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let workspace = self.job.workspace();
        let mut vars: BTreeMap<String, String> = self
            .job
            .inputs()
            .into_iter()
            .chain(self.job.outputs())
            .map(|p| (p.name, p.value))
            .collect();
        vars.insert("job_id".to_string(), self.job.id().to_string());
        vars.insert(
            "local_workspace".to_string(),
            workspace.local.to_string_lossy().into_owned(),
        );
        vars.insert("remote_workspace".to_string(), workspace.remote);
        vars
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.token
    }

    pub fn log(&self, level: MessageLevel, text: impl Into<String>) {
        self.job.push_message(self.step_index, Message::new(level, text));
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log(MessageLevel::Info, text);
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.log(MessageLevel::Warn, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(MessageLevel::Error, text);
    }

    pub fn increment_counter(&self, name: &str, delta: i64) {
        self.job.increment_counter(name, delta);
    }
}

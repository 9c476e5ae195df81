//! Job database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{format_time, parse_time};
use crate::domain::{ApplicationRef, JobSnapshot, JobState, StoredJob, User};
use crate::{Error, Result};

/// Job database model.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub user_id: i64,
    pub username: String,
    pub admin: bool,
    pub application_id: String,
    pub application_name: String,
    pub application_version: String,
    /// INCOMING, SETUP_RUNNING, WAITING, RUNNING, SUCCESS, FAILED, CANCELED, DEAD
    pub state: String,
    pub local_workspace: String,
    pub remote_workspace: String,
    pub submitted_at: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobDbModel {
    pub fn from_snapshot(job: &JobSnapshot) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: job.id.clone(),
            user_id: job.owner.id,
            username: job.owner.username.clone(),
            admin: job.owner.admin,
            application_id: job.application.id.clone(),
            application_name: job.application.name.clone(),
            application_version: job.application.version.clone(),
            state: job.state.as_str().to_string(),
            local_workspace: job.workspace.local.to_string_lossy().into_owned(),
            remote_workspace: job.workspace.remote.clone(),
            submitted_at: format_time(job.submitted_at),
            started_at: format_time(job.started_at),
            finished_at: format_time(job.finished_at),
            error: job.error.clone(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn to_stored(&self) -> Result<StoredJob> {
        let state = JobState::parse(&self.state)
            .ok_or_else(|| Error::Database(format!("Unknown job state '{}'", self.state)))?;

        Ok(StoredJob {
            id: self.id.clone(),
            owner: User::new(self.user_id, self.username.clone()).with_admin(self.admin),
            application: ApplicationRef {
                id: self.application_id.clone(),
                name: self.application_name.clone(),
                version: self.application_version.clone(),
            },
            state,
            local_workspace: self.local_workspace.clone(),
            remote_workspace: self.remote_workspace.clone(),
            submitted_at: parse_time(self.submitted_at.as_deref())?,
            started_at: parse_time(self.started_at.as_deref())?,
            finished_at: parse_time(self.finished_at.as_deref())?,
            error: self.error.clone(),
        })
    }
}

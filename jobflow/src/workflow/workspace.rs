//! Job workspace paths.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Staging locations of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// Local staging directory.
    pub local: PathBuf,
    /// Staging location on the distributed file system.
    pub remote: String,
}

impl Workspace {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Local path of a named entry inside the workspace.
    pub fn local_path(&self, name: &str) -> PathBuf {
        self.local.join(name)
    }

    /// Remote path of a named entry inside the workspace.
    pub fn remote_path(&self, name: &str) -> String {
        format!("{}/{}", self.remote.trim_end_matches('/'), name)
    }
}

/// Maps a job id to its workspace.
pub trait WorkspaceResolver: Send + Sync {
    fn resolve(&self, job_id: &str) -> Workspace;
}

/// `<local_root>/<job id>` and `<remote_root>/<job id>`.
#[derive(Debug, Clone)]
pub struct DirectoryWorkspaceResolver {
    local_root: PathBuf,
    remote_root: String,
}

impl DirectoryWorkspaceResolver {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root: remote_root.into(),
        }
    }
}

impl WorkspaceResolver for DirectoryWorkspaceResolver {
    fn resolve(&self, job_id: &str) -> Workspace {
        Workspace {
            local: self.local_root.join(job_id),
            remote: format!("{}/{}", self.remote_root.trim_end_matches('/'), job_id),
        }
    }
}

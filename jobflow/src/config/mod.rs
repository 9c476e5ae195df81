//! Runtime settings.
//!
//! Defaults are overridden by `JOBFLOW_*` environment variables (a `.env`
//! file is loaded by `main` first).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::{Error, Result};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "JOBFLOW_";

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Global cap on running jobs (both stages).
    pub max_running_jobs: usize,
    /// Queued and running jobs allowed per user.
    pub max_running_jobs_per_user: usize,
    pub engine: EngineConfig,
    /// Root of the local job workspaces.
    pub local_workspace: PathBuf,
    /// Root of the remote job workspaces.
    pub remote_workspace: String,
    pub database_url: String,
    pub log_dir: PathBuf,
    /// JSON console logs.
    pub log_json: bool,
    /// Directory of JSON application manifests.
    pub apps_dir: PathBuf,
    /// Salt for anonymous job ids.
    pub public_id_salt: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_running_jobs: 20,
            max_running_jobs_per_user: 2,
            engine: EngineConfig::default(),
            local_workspace: PathBuf::from("./workspace"),
            remote_workspace: "/user/jobflow/workspace".to_string(),
            database_url: "sqlite:jobflow.db?mode=rwc".to_string(),
            log_dir: PathBuf::from("./logs"),
            log_json: false,
            apps_dir: PathBuf::from("./apps"),
            public_id_salt: "jobflow".to_string(),
        }
    }
}

impl Settings {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup(<JOBFLOW_ name>)`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut settings = Self::default();

        if let Some(value) = var("MAX_RUNNING_JOBS") {
            settings.max_running_jobs = parse_number("MAX_RUNNING_JOBS", &value)?;
        }
        if let Some(value) = var("MAX_RUNNING_JOBS_PER_USER") {
            settings.max_running_jobs_per_user =
                parse_number("MAX_RUNNING_JOBS_PER_USER", &value)?;
        }
        if let Some(value) = var("SETUP_THREADS") {
            settings.engine.setup_concurrency = parse_number("SETUP_THREADS", &value)?;
        }
        if let Some(value) = var("EXECUTION_THREADS") {
            settings.engine.execution_concurrency = parse_number("EXECUTION_THREADS", &value)?;
        }
        if let Some(value) = var("LOCAL_WORKSPACE") {
            settings.local_workspace = PathBuf::from(value);
        }
        if let Some(value) = var("REMOTE_WORKSPACE") {
            settings.remote_workspace = value;
        }
        if let Some(value) = var("DATABASE_URL") {
            settings.database_url = value;
        }
        if let Some(value) = var("LOG_DIR") {
            settings.log_dir = PathBuf::from(value);
        }
        if let Some(value) = var("LOG_JSON") {
            settings.log_json = parse_flag("LOG_JSON", &value)?;
        }
        if let Some(value) = var("APPS_DIR") {
            settings.apps_dir = PathBuf::from(value);
        }
        if let Some(value) = var("PUBLIC_ID_SALT") {
            settings.public_id_salt = value;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.setup_concurrency == 0 || self.engine.execution_concurrency == 0 {
            return Err(Error::config("worker counts must be at least 1"));
        }
        if self.max_running_jobs_per_user == 0 {
            return Err(Error::config("per-user job limit must be at least 1"));
        }
        Ok(())
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{ENV_PREFIX}{name} must be a number, got '{value}'")))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "{ENV_PREFIX}{name} must be true or false, got '{value}'"
        ))),
    }
}

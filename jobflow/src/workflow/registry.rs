//! Application lookup.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::definition::WorkflowDefinition;
use super::manifest::ApplicationManifest;
use crate::domain::{ApplicationRef, User};
use crate::{Error, Result};

/// Who may run an application.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Anyone, including anonymous submissions.
    Public,
    /// Any signed-in user.
    #[default]
    User,
    /// Administrators only.
    Admin,
}

impl Permission {
    pub fn allows(&self, user: Option<&User>) -> bool {
        match self {
            Self::Public => true,
            Self::User => user.is_some_and(|u| !u.is_public()),
            Self::Admin => user.is_some_and(|u| u.admin),
        }
    }
}

/// A runnable application.
#[derive(Debug, Clone)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub version: String,
    pub permission: Permission,
    pub enabled: bool,
    pub definition: Arc<WorkflowDefinition>,
}

impl Application {
    pub fn reference(&self) -> ApplicationRef {
        ApplicationRef {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

/// Resolves an application id into a definition the user may run.
#[async_trait]
pub trait WorkflowLoader: Send + Sync {
    /// Fails with [`Error::ApplicationNotFound`] when the application is
    /// unknown, disabled or not accessible to `user`.
    async fn load(&self, app_id: &str, user: Option<&User>) -> Result<Application>;
}

/// In-memory application registry.
#[derive(Default)]
pub struct ApplicationRegistry {
    applications: RwLock<BTreeMap<String, Application>>,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an application.
    pub fn register(&self, application: Application) {
        debug!(app_id = %application.id, "Registered application");
        self.applications
            .write()
            .insert(application.id.clone(), application);
    }

    pub fn get(&self, app_id: &str) -> Option<Application> {
        self.applications.read().get(app_id).cloned()
    }

    pub fn list(&self) -> Vec<Application> {
        self.applications.read().values().cloned().collect()
    }

    /// Register every `*.json` manifest in `dir`. Returns how many were loaded.
    ///
    /// A missing directory loads nothing; unreadable manifests are skipped.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %dir.display(), "Applications directory does not exist");
                return Ok(0);
            }
            Err(e) => return Err(Error::io_path("listing", dir, e)),
        };

        let mut loaded = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io_path("listing", dir, e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let manifest = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::io_path("reading", &path, e))
                .and_then(|raw| {
                    serde_json::from_str::<ApplicationManifest>(&raw).map_err(Error::from)
                });
            match manifest {
                Ok(manifest) => {
                    self.register(manifest.into_application());
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid application manifest")
                }
            }
        }

        info!(path = %dir.display(), count = loaded, "Loaded applications");
        Ok(loaded)
    }
}

#[async_trait]
impl WorkflowLoader for ApplicationRegistry {
    async fn load(&self, app_id: &str, user: Option<&User>) -> Result<Application> {
        self.get(app_id)
            .filter(|app| app.enabled && app.permission.allows(user))
            .ok_or_else(|| Error::ApplicationNotFound(app_id.to_string()))
    }
}

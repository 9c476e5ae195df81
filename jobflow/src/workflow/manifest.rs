//! JSON application manifests.
//!
//! ```json
//! {
//!   "id": "wordcount",
//!   "name": "Word Count",
//!   "version": "1.0",
//!   "permission": "public",
//!   "inputs": [{ "id": "text", "kind": "local_file", "required": true }],
//!   "outputs": [{ "id": "results", "kind": "local_folder", "download": true }],
//!   "steps": [{ "name": "Count", "command": "mkdir -p \"${results}\" && wc -w \"${text}\" > \"${results}/count.txt\"" }]
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::command::CommandStep;
use super::definition::{ParameterDef, WorkflowDefinition};
use super::registry::{Application, Permission};

/// A shell command step as written in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepManifest {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Counters added when the command succeeds.
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
}

impl StepManifest {
    fn into_step(self) -> CommandStep {
        let mut step = CommandStep::new(self.name, self.command);
        if let Some(secs) = self.timeout_secs {
            step = step.with_timeout(Duration::from_secs(secs));
        }
        for (name, delta) in self.counters {
            step = step.with_counter(name, delta);
        }
        step
    }
}

fn default_enabled() -> bool {
    true
}

/// One application file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub permission: Permission,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub inputs: Vec<ParameterDef>,
    #[serde(default)]
    pub outputs: Vec<ParameterDef>,
    #[serde(default)]
    pub setup: Vec<StepManifest>,
    #[serde(default)]
    pub steps: Vec<StepManifest>,
}

impl ApplicationManifest {
    pub fn into_application(self) -> Application {
        let mut definition = WorkflowDefinition::new(self.name.clone(), self.version.clone());
        definition.inputs = self.inputs;
        definition.outputs = self.outputs;
        for step in self.setup {
            definition = definition.with_setup_step(step.into_step());
        }
        for step in self.steps {
            definition = definition.with_step(step.into_step());
        }

        Application {
            id: self.id,
            name: self.name,
            version: self.version,
            permission: self.permission,
            enabled: self.enabled,
            definition: Arc::new(definition),
        }
    }
}

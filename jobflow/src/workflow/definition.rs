//! Workflow definitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::step::WorkflowStep;
use super::workspace::Workspace;
use crate::domain::{Parameter, ParameterKind};
use crate::{Error, Result};

/// Declaration of an input or output parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: ParameterKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// Output produces downloadable files.
    #[serde(default)]
    pub download: bool,
    /// Choices of a list, or the `true`/`false` mapping of a checkbox.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl ParameterDef {
    pub fn new(id: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            kind,
            required: false,
            default: None,
            download: false,
            values: BTreeMap::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_download(mut self) -> Self {
        self.download = true;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Mapped value of a checkbox in the given position.
    fn checkbox_value(&self, checked: bool) -> String {
        let key = if checked { "true" } else { "false" };
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }
}

/// A parsed workflow: parameters plus setup and execution steps.
#[derive(Clone, Default)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    pub inputs: Vec<ParameterDef>,
    pub outputs: Vec<ParameterDef>,
    /// Run by the setup stage, after input validation.
    pub setup: Vec<Arc<dyn WorkflowStep>>,
    /// Run by the execution stage.
    pub steps: Vec<Arc<dyn WorkflowStep>>,
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |steps: &[Arc<dyn WorkflowStep>]| {
            steps.iter().map(|s| s.name().to_string()).collect::<Vec<_>>()
        };
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("setup", &names(&self.setup))
            .field("steps", &names(&self.steps))
            .finish()
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: ParameterDef) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: ParameterDef) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_setup_step(mut self, step: impl WorkflowStep) -> Self {
        self.setup.push(Arc::new(step));
        self
    }

    pub fn with_step(mut self, step: impl WorkflowStep) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// `"<name> <version>"`.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.name, self.version)
    }

    /// Map submitted form values onto the declared inputs.
    ///
    /// A checkbox maps to its `true` value when submitted and to its `false`
    /// value otherwise. Absent inputs fall back to their default; absent inputs
    /// without a default are left out. Unknown keys are ignored.
    pub fn resolve_inputs(&self, submitted: &HashMap<String, String>) -> Result<Vec<Parameter>> {
        let mut params = Vec::with_capacity(self.inputs.len());

        for def in &self.inputs {
            let value = match (def.kind, submitted.get(&def.id)) {
                (ParameterKind::Checkbox, submitted) => def.checkbox_value(submitted.is_some()),
                (_, Some(value)) => value.clone(),
                (_, None) => match &def.default {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };

            match def.kind {
                ParameterKind::Number if !value.trim().is_empty() => {
                    if value.trim().parse::<f64>().is_err() {
                        return Err(Error::validation(format!(
                            "Parameter '{}' is not a number: {value}",
                            def.id
                        )));
                    }
                }
                ParameterKind::List if !def.values.is_empty() => {
                    if !def.values.contains_key(&value) {
                        return Err(Error::validation(format!(
                            "Parameter '{}' has no option '{value}'",
                            def.id
                        )));
                    }
                }
                _ => {}
            }

            params.push(Parameter::input(def.id.clone(), def.kind, value));
        }

        Ok(params)
    }

    /// Output parameters placed inside the job workspace.
    pub fn output_parameters(&self, workspace: &Workspace) -> Vec<Parameter> {
        self.outputs
            .iter()
            .map(|def| {
                let value = if def.kind.is_remote() {
                    workspace.remote_path(&def.id)
                } else {
                    workspace.local_path(&def.id).to_string_lossy().into_owned()
                };
                Parameter::output(def.id.clone(), def.kind, value, def.download)
            })
            .collect()
    }
}

//! Workflow definitions and the contracts used to load them.
//!
//! A definition is an ordered list of input/output parameters plus the setup
//! and execution steps a job runs. Definitions come from a [`WorkflowLoader`];
//! [`ApplicationRegistry`] is the in-process implementation backed by JSON
//! manifests.

mod command;
mod definition;
mod manifest;
mod registry;
mod step;
mod workspace;

pub use command::CommandStep;
pub use definition::{ParameterDef, WorkflowDefinition};
pub use manifest::{ApplicationManifest, StepManifest};
pub use registry::{Application, ApplicationRegistry, Permission, WorkflowLoader};
pub use step::{StepFn, WorkflowStep};
pub use workspace::{DirectoryWorkspaceResolver, Workspace, WorkspaceResolver};

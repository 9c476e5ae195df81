//! Job aggregate and its lifecycle.

mod context;
mod entity;
mod state;

pub use context::StepContext;
pub use entity::{ApplicationRef, INPUT_VALIDATION_STEP, Job, JobProgress, JobSnapshot, StoredJob};
pub use state::JobState;

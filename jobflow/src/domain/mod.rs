//! Domain layer for jobflow.
//!
//! Entities and value objects of the job lifecycle.

pub mod job;
pub mod parameter;
pub mod step;
pub mod user;

pub use job::{
    ApplicationRef, INPUT_VALIDATION_STEP, Job, JobProgress, JobSnapshot, JobState, StepContext,
    StoredJob,
};
pub use parameter::{Download, Parameter, ParameterDirection, ParameterKind};
pub use step::{Message, MessageLevel, Step};
pub use user::User;

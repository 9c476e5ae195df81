//! The two-stage scheduling engine.
//!
//! A setup queue validates jobs and promotes successful ones into an
//! execution queue. Both queues are [`job_queue::Queue`] instances with the
//! stage behavior injected as a [`job_queue::QueueHandler`].

mod recorder;
mod stages;
mod workflow_engine;

pub use job_queue::CancelOutcome;
pub use recorder::JobRecorder;
pub use workflow_engine::{EngineConfig, WorkflowEngine};

//! Facade used by the API layer.

mod jobs;

pub use jobs::{JobLimits, JobService, JobStatus, generate_job_id};

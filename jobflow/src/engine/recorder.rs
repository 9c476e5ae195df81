//! Durable records of a job.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::database::Repositories;
use crate::database::models::{
    CounterDbModel, DownloadDbModel, JobDbModel, MessageDbModel, ParameterDbModel, StepDbModel,
};
use crate::domain::Job;
use crate::{Error, Result};

/// A finished job whose final records could not be written.
struct UnsavedJob {
    job: Arc<Job>,
    results: bool,
    counters: bool,
}

/// Writes job, parameter, step, message, download and counter records.
///
/// Finished jobs whose final write failed are held here until a retry
/// succeeds, so reads keep seeing their in-memory outcome.
pub struct JobRecorder {
    repos: Repositories,
    unsaved: Mutex<HashMap<String, UnsavedJob>>,
}

impl JobRecorder {
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            unsaved: Mutex::new(HashMap::new()),
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    /// Insert the job record and its parameter records.
    pub async fn persist_submission(&self, job: &Job) -> Result<()> {
        let snapshot = job.snapshot();
        self.repos
            .jobs
            .insert_job(&JobDbModel::from_snapshot(&snapshot))
            .await?;
        self.persist_new_parameters(job).await?;
        debug!(job_id = %job.id(), "Persisted submission");
        Ok(())
    }

    /// Update the existing job record for a restarted job. Parameters that
    /// already have a store id are left alone.
    pub async fn persist_restart(&self, job: &Job) -> Result<()> {
        self.persist_state(job).await?;
        self.persist_new_parameters(job).await
    }

    /// Update the job record only.
    pub async fn persist_state(&self, job: &Job) -> Result<()> {
        let snapshot = job.snapshot();
        self.repos
            .jobs
            .update_job(&JobDbModel::from_snapshot(&snapshot))
            .await
    }

    /// Update the job record, then insert download records and every step
    /// with its messages.
    pub async fn persist_results(&self, job: &Job) -> Result<()> {
        let snapshot = job.snapshot();
        self.repos
            .jobs
            .update_job(&JobDbModel::from_snapshot(&snapshot))
            .await?;

        for output in snapshot.outputs.iter().filter(|p| p.has_downloads()) {
            let Some(parameter_id) = output.id else {
                warn!(job_id = %job.id(), output = %output.name, "Output parameter was never stored, skipping downloads");
                continue;
            };
            for file in &output.files {
                self.repos
                    .downloads
                    .insert_download(&DownloadDbModel::new(job.id(), parameter_id, file))
                    .await?;
            }
        }

        for step in &snapshot.steps {
            let step_id = self
                .repos
                .steps
                .insert_step(&StepDbModel::from_step(job.id(), step))
                .await?;
            for message in &step.messages {
                self.repos
                    .steps
                    .insert_message(&MessageDbModel::from_message(step_id, message))
                    .await?;
            }
        }

        debug!(job_id = %job.id(), steps = snapshot.steps.len(), "Persisted results");
        Ok(())
    }

    /// Write the counters of the current attempt. A second call for the same
    /// attempt writes nothing. Returns the number of counters written.
    pub async fn flush_counters(&self, job: &Job) -> Result<usize> {
        let Some(counters) = job.take_counters_for_flush() else {
            return Ok(0);
        };

        for (name, value) in &counters {
            let written = self
                .repos
                .counters
                .insert_counter(&CounterDbModel::new(job.id(), name.clone(), *value))
                .await;
            if let Err(e) = written {
                job.release_counters_flush();
                return Err(e);
            }
        }
        Ok(counters.len())
    }

    /// Log a failed final write, report it on the job and hold the job for a
    /// retry. `results` and `counters` name the writes still owed.
    pub fn keep_unsaved(&self, job: &Arc<Job>, results: bool, counters: bool, e: &Error) {
        let what = if results { "results" } else { "counters" };
        error!(job_id = %job.id(), error = %e, "Failed to persist {what}");
        job.set_persistence_error(Some(format!("Failed to persist {what}: {e}")));

        let mut unsaved = self.unsaved.lock();
        let entry = unsaved.entry(job.id().to_string()).or_insert_with(|| UnsavedJob {
            job: job.clone(),
            results: false,
            counters: false,
        });
        entry.results |= results;
        entry.counters |= counters;
    }

    /// A finished job whose final write is still owed.
    pub fn unsaved_job(&self, id: &str) -> Option<Arc<Job>> {
        self.unsaved.lock().get(id).map(|entry| entry.job.clone())
    }

    /// Drop a held job without writing it.
    pub fn forget_unsaved(&self, id: &str) {
        self.unsaved.lock().remove(id);
    }

    /// Write what is still owed for a held job.
    ///
    /// On success the job is released and its persistence error cleared; on
    /// failure it stays held with the new error. Returns the job, or `None`
    /// if nothing was held under `id`.
    pub async fn retry_unsaved(&self, id: &str) -> Option<Arc<Job>> {
        let UnsavedJob {
            job,
            results,
            counters,
        } = self.unsaved.lock().remove(id)?;

        if results {
            if let Err(e) = self.persist_results(&job).await {
                self.keep_unsaved(&job, true, counters, &e);
                return Some(job);
            }
        }
        if counters {
            if let Err(e) = self.flush_counters(&job).await {
                self.keep_unsaved(&job, false, true, &e);
                return Some(job);
            }
        }

        job.set_persistence_error(None);
        info!(job_id = %id, state = %job.state(), "Persisted job on retry");
        Some(job)
    }

    async fn persist_new_parameters(&self, job: &Job) -> Result<()> {
        for param in job.inputs().iter().chain(job.outputs().iter()) {
            if param.id.is_some() {
                continue;
            }
            let id = self
                .repos
                .parameters
                .insert_parameter(&ParameterDbModel::from_parameter(job.id(), param))
                .await?;
            job.set_parameter_id(param.direction, &param.name, id);
        }
        Ok(())
    }
}

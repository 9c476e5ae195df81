//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use jobflow::database::Repositories;
use jobflow::database::models::{
    CounterDbModel, DownloadDbModel, JobDbModel, MessageDbModel, ParameterDbModel, StepDbModel,
};
use jobflow::database::repositories::{
    CounterRepository, DownloadRepository, JobRepository, ParameterRepository, StepRepository,
};
use jobflow::domain::{ApplicationRef, Job, StepContext, User};
use jobflow::engine::{EngineConfig, WorkflowEngine};
use jobflow::workflow::{WorkflowDefinition, WorkflowStep, Workspace};
use jobflow::{Error, Result};

/// One write against the store, for asserting what was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    InsertJob(String),
    UpdateJob(String, String),
    InsertParameter(String),
    InsertDownload(String),
    InsertStep(String),
    InsertCounter(String),
}

impl Write {
    pub fn job_id(&self) -> &str {
        match self {
            Self::InsertJob(id)
            | Self::UpdateJob(id, _)
            | Self::InsertParameter(id)
            | Self::InsertDownload(id)
            | Self::InsertStep(id)
            | Self::InsertCounter(id) => id,
        }
    }
}

/// In-memory record store implementing every repository trait.
#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    jobs: Mutex<BTreeMap<String, JobDbModel>>,
    parameters: Mutex<Vec<ParameterDbModel>>,
    downloads: Mutex<Vec<DownloadDbModel>>,
    steps: Mutex<Vec<StepDbModel>>,
    messages: Mutex<Vec<MessageDbModel>>,
    counters: Mutex<Vec<CounterDbModel>>,
    writes: Mutex<Vec<Write>>,
    /// Make `update_job` fail.
    pub fail_updates: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            jobs: self.clone(),
            parameters: self.clone(),
            downloads: self.clone(),
            steps: self.clone(),
            counters: self.clone(),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, write: Write) {
        self.writes.lock().push(write);
    }

    pub fn writes_for(&self, job_id: &str) -> Vec<Write> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.job_id() == job_id)
            .cloned()
            .collect()
    }

    pub fn job(&self, job_id: &str) -> Option<JobDbModel> {
        self.jobs.lock().get(job_id).cloned()
    }

    pub fn stored_state(&self, job_id: &str) -> Option<String> {
        self.job(job_id).map(|j| j.state)
    }

    pub fn parameters_for(&self, job_id: &str) -> Vec<ParameterDbModel> {
        self.parameters
            .lock()
            .iter()
            .filter(|p| p.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn downloads_for(&self, job_id: &str) -> Vec<DownloadDbModel> {
        self.downloads
            .lock()
            .iter()
            .filter(|d| d.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn step_names(&self, job_id: &str) -> Vec<String> {
        self.steps
            .lock()
            .iter()
            .filter(|s| s.job_id == job_id)
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn messages_for(&self, job_id: &str) -> Vec<MessageDbModel> {
        let step_ids: Vec<i64> = self
            .steps
            .lock()
            .iter()
            .filter(|s| s.job_id == job_id)
            .map(|s| s.id)
            .collect();
        self.messages
            .lock()
            .iter()
            .filter(|m| step_ids.contains(&m.step_id))
            .cloned()
            .collect()
    }

    pub fn counters_for(&self, job_id: &str) -> Vec<CounterDbModel> {
        self.counters
            .lock()
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        self.job(id).ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_jobs_by_user(&self, user_id: i64) -> Result<Vec<JobDbModel>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_jobs_by_state(&self, state: &str) -> Result<Vec<JobDbModel>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect())
    }

    async fn insert_job(&self, job: &JobDbModel) -> Result<()> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(Error::Database(format!("duplicate job id {}", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        drop(jobs);
        self.record(Write::InsertJob(job.id.clone()));
        Ok(())
    }

    async fn update_job(&self, job: &JobDbModel) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::Database("store unreachable".to_string()));
        }
        let mut jobs = self.jobs.lock();
        let Some(existing) = jobs.get_mut(&job.id) else {
            return Err(Error::not_found("Job", &job.id));
        };
        let created_at = existing.created_at.clone();
        *existing = JobDbModel {
            created_at,
            ..job.clone()
        };
        drop(jobs);
        self.record(Write::UpdateJob(job.id.clone(), job.state.clone()));
        Ok(())
    }
}

#[async_trait]
impl ParameterRepository for MemoryStore {
    async fn insert_parameter(&self, param: &ParameterDbModel) -> Result<i64> {
        let id = self.next_id();
        self.parameters.lock().push(ParameterDbModel {
            id,
            ..param.clone()
        });
        self.record(Write::InsertParameter(param.job_id.clone()));
        Ok(id)
    }

    async fn list_parameters(&self, job_id: &str) -> Result<Vec<ParameterDbModel>> {
        Ok(self.parameters_for(job_id))
    }
}

#[async_trait]
impl DownloadRepository for MemoryStore {
    async fn insert_download(&self, download: &DownloadDbModel) -> Result<i64> {
        let id = self.next_id();
        self.downloads.lock().push(DownloadDbModel {
            id,
            ..download.clone()
        });
        self.record(Write::InsertDownload(download.job_id.clone()));
        Ok(id)
    }

    async fn list_downloads(&self, job_id: &str) -> Result<Vec<DownloadDbModel>> {
        Ok(self.downloads_for(job_id))
    }
}

#[async_trait]
impl StepRepository for MemoryStore {
    async fn insert_step(&self, step: &StepDbModel) -> Result<i64> {
        let id = self.next_id();
        self.steps.lock().push(StepDbModel {
            id,
            ..step.clone()
        });
        self.record(Write::InsertStep(step.job_id.clone()));
        Ok(id)
    }

    async fn insert_message(&self, message: &MessageDbModel) -> Result<()> {
        let id = self.next_id();
        self.messages.lock().push(MessageDbModel {
            id,
            ..message.clone()
        });
        Ok(())
    }

    async fn list_steps(&self, job_id: &str) -> Result<Vec<StepDbModel>> {
        Ok(self
            .steps
            .lock()
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_messages(&self, step_id: i64) -> Result<Vec<MessageDbModel>> {
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| m.step_id == step_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CounterRepository for MemoryStore {
    async fn insert_counter(&self, counter: &CounterDbModel) -> Result<()> {
        let id = self.next_id();
        self.counters.lock().push(CounterDbModel {
            id,
            ..counter.clone()
        });
        self.record(Write::InsertCounter(counter.job_id.clone()));
        Ok(())
    }

    async fn list_counters(&self, job_id: &str) -> Result<Vec<CounterDbModel>> {
        Ok(self.counters_for(job_id))
    }

    async fn totals(&self) -> Result<BTreeMap<String, i64>> {
        let mut totals = BTreeMap::new();
        for counter in self.counters.lock().iter() {
            *totals.entry(counter.name.clone()).or_insert(0) += counter.value;
        }
        Ok(totals)
    }
}

/// A step that blocks until the shared gate hands out a permit, or fails when
/// the job is cancelled.
pub struct GateStep {
    name: String,
    gate: Arc<Semaphore>,
    watch_cancel: bool,
}

impl GateStep {
    pub fn new(name: &str, gate: Arc<Semaphore>) -> Self {
        Self {
            name: name.to_string(),
            gate,
            watch_cancel: true,
        }
    }

    /// Keep waiting for the gate after the job was cancelled.
    pub fn ignore_cancellation(mut self) -> Self {
        self.watch_cancel = false;
        self
    }
}

#[async_trait]
impl WorkflowStep for GateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<bool> {
        tokio::select! {
            permit = self.gate.acquire() => {
                permit.map_err(|e| Error::Other(e.to_string()))?.forget();
                ctx.info("gate opened");
                Ok(true)
            }
            _ = ctx.cancellation_token().cancelled(), if self.watch_cancel => {
                ctx.warn("cancelled while waiting");
                Ok(false)
            }
        }
    }
}

pub fn alice() -> User {
    User::new(1, "alice")
}

pub fn bob() -> User {
    User::new(2, "bob")
}

pub fn admin() -> User {
    User::new(99, "root").with_admin(true)
}

pub fn app_ref(definition: &WorkflowDefinition) -> ApplicationRef {
    ApplicationRef {
        id: definition.name.clone(),
        name: definition.name.clone(),
        version: definition.version.clone(),
    }
}

pub fn make_job(id: &str, owner: User, definition: WorkflowDefinition, root: &Path) -> Arc<Job> {
    let local = root.join(id);
    std::fs::create_dir_all(&local).unwrap();
    let application = app_ref(&definition);
    Arc::new(Job::new(
        id,
        owner,
        application,
        Arc::new(definition),
        Workspace::new(local, format!("/remote/{id}")),
        Vec::new(),
    ))
}

pub fn start_engine(store: &Arc<MemoryStore>, config: EngineConfig) -> Arc<WorkflowEngine> {
    let engine = Arc::new(WorkflowEngine::new(config, store.repositories()));
    engine.run();
    engine
}

pub fn config(setup: usize, execution: usize) -> EngineConfig {
    EngineConfig {
        setup_concurrency: setup,
        execution_concurrency: execution,
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use jobflow::domain::{INPUT_VALIDATION_STEP, JobState, Parameter, ParameterKind};
use jobflow::engine::{CancelOutcome, EngineConfig};
use jobflow::workflow::{ParameterDef, StepFn, WorkflowDefinition};
use jobflow::Error;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use common::{GateStep, MemoryStore, Write, alice, bob, config, make_job, start_engine, wait_until};

fn gated(name: &str, gate: &Arc<Semaphore>) -> WorkflowDefinition {
    WorkflowDefinition::new(name, "1.0").with_step(GateStep::new("wait", gate.clone()))
}

#[tokio::test]
async fn test_successful_job_is_recorded_once() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());

    let definition = WorkflowDefinition::new("count", "1.0")
        .with_output(ParameterDef::new("results", ParameterKind::LocalFolder).with_download())
        .with_step(StepFn::new("write", |ctx| {
            let results = ctx.output("results").unwrap();
            std::fs::create_dir_all(&results)?;
            std::fs::write(format!("{results}/summary.txt"), "42")?;
            ctx.increment_counter("samples", 42);
            ctx.info("wrote summary");
            Ok(true)
        }));
    let job = make_job("job-j1", alice(), definition, dir.path());

    engine.submit(job.clone()).await.unwrap();
    assert!(engine.is_in_queue(&job));

    wait_until(|| !store.counters_for("job-j1").is_empty()).await;

    assert_eq!(job.state(), JobState::Success);
    assert!(!engine.is_in_queue(&job));
    assert!(job.finished_at() >= job.started_at());

    assert_eq!(store.stored_state("job-j1").as_deref(), Some("SUCCESS"));
    assert_eq!(store.step_names("job-j1"), vec![INPUT_VALIDATION_STEP, "write"]);
    assert!(
        store
            .messages_for("job-j1")
            .iter()
            .any(|m| m.text == "wrote summary")
    );

    let downloads = store.downloads_for("job-j1");
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].name, "summary.txt");
    assert_eq!(downloads[0].size, 2);
    let results_param = store
        .parameters_for("job-j1")
        .into_iter()
        .find(|p| p.name == "results")
        .unwrap();
    assert_eq!(downloads[0].parameter_id, results_param.id);

    let counters = store.counters_for("job-j1");
    assert_eq!(counters.len(), 1);
    assert_eq!((counters[0].name.as_str(), counters[0].value), ("samples", 42));

    let inserts = store
        .writes_for("job-j1")
        .into_iter()
        .filter(|w| matches!(w, Write::InsertJob(_)))
        .count();
    assert_eq!(inserts, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_setup_failure_marks_job_dead() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());

    let executed = Arc::new(AtomicUsize::new(0));
    let counter = executed.clone();
    let definition = WorkflowDefinition::new("needs-input", "1.0")
        .with_input(ParameterDef::new("file", ParameterKind::LocalFile).required())
        .with_step(StepFn::new("never", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }));
    let job = make_job("job-j2", alice(), definition, dir.path());

    engine.submit(job.clone()).await.unwrap();
    wait_until(|| store.stored_state("job-j2").as_deref() == Some("DEAD")).await;

    assert_eq!(job.state(), JobState::Dead);
    assert!(!job.is_setup_complete());
    assert!(!engine.is_in_queue(&job));
    assert!(engine.get_all_jobs_in_execution_queue().is_empty());
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    assert_eq!(store.step_names("job-j2"), vec![INPUT_VALIDATION_STEP]);
    let messages = store.messages_for("job-j2");
    assert!(messages.iter().any(|m| m.level == "ERROR" && m.text.contains("file")));
    assert!(store.counters_for("job-j2").is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_sixth_job_waits_for_an_execution_worker() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());
    let gate = Arc::new(Semaphore::new(0));

    let jobs: Vec<_> = (0..6)
        .map(|i| make_job(&format!("job-{i}"), alice(), gated("gated", &gate), dir.path()))
        .collect();
    for job in &jobs {
        engine.submit(job.clone()).await.unwrap();
    }

    wait_until(|| {
        jobs.iter().filter(|j| j.state() == JobState::Running).count() == 5
            && jobs.iter().filter(|j| j.state() == JobState::Waiting).count() == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(engine.get_active_count(), 5);
    let waiting = jobs
        .iter()
        .find(|j| j.state() == JobState::Waiting)
        .unwrap()
        .clone();
    assert_eq!(engine.get_position_in_queue(&waiting), 1);
    assert_eq!(engine.get_all_jobs_in_execution_queue().len(), 6);
    assert!(engine.get_all_jobs_in_setup_queue().is_empty());

    gate.add_permits(1);
    wait_until(|| waiting.state() == JobState::Running).await;
    assert_eq!(engine.get_position_in_queue(&waiting), 0);
    assert!(engine.get_active_count() <= 5);

    gate.add_permits(5);
    wait_until(|| jobs.iter().all(|j| j.state() == JobState::Success)).await;
    wait_until(|| jobs.iter().all(|j| !engine.is_in_queue(j))).await;

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_pending_job_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, config(5, 1));
    let gate = Arc::new(Semaphore::new(0));

    let first = make_job("job-first", alice(), gated("gated", &gate), dir.path());
    let second = make_job("job-second", alice(), gated("gated", &gate), dir.path());
    engine.submit(first.clone()).await.unwrap();
    engine.submit(second.clone()).await.unwrap();
    wait_until(|| first.state() == JobState::Running && second.state() == JobState::Waiting)
        .await;
    let writes_before = store.writes_for("job-second");

    assert_eq!(engine.cancel(&second), CancelOutcome::Removed);
    assert!(!engine.is_in_queue(&second));
    assert_eq!(second.state(), JobState::Canceled);

    gate.add_permits(1);
    wait_until(|| store.stored_state("job-first").as_deref() == Some("SUCCESS")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(store.writes_for("job-second"), writes_before);
    assert_eq!(store.stored_state("job-second").as_deref(), Some("INCOMING"));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_job_pending_in_setup() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());
    engine.block();

    let job = make_job("job-blocked", bob(), WorkflowDefinition::new("noop", "1"), dir.path());
    engine.submit(job.clone()).await.unwrap();
    assert!(engine.get_all_jobs_in_setup_queue().iter().any(|j| j.id() == job.id()));

    assert_eq!(engine.cancel(&job), CancelOutcome::Removed);
    assert_eq!(job.state(), JobState::Canceled);
    assert!(job.started_at().is_some());
    assert!(!engine.is_in_queue(&job));
    assert_eq!(engine.cancel(&job), CancelOutcome::NotQueued);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_job_finishes_once() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());
    let gate = Arc::new(Semaphore::new(0));

    let definition = gated("gated", &gate).with_step(StepFn::new("after", |_| Ok(true)));
    let job = make_job("job-running", alice(), definition, dir.path());
    engine.submit(job.clone()).await.unwrap();
    wait_until(|| job.state() == JobState::Running).await;

    assert_eq!(engine.cancel(&job), CancelOutcome::Signalled);
    wait_until(|| store.stored_state("job-running").as_deref() == Some("CANCELED")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(job.state(), JobState::Canceled);
    assert_eq!(store.step_names("job-running"), vec![INPUT_VALIDATION_STEP, "wait"]);
    let updates = store
        .writes_for("job-running")
        .into_iter()
        .filter(|w| matches!(w, Write::UpdateJob(..)))
        .count();
    assert_eq!(updates, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_last_setup_step() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());
    let gate = Arc::new(Semaphore::new(0));

    let executed = Arc::new(AtomicUsize::new(0));
    let counter = executed.clone();
    let definition = WorkflowDefinition::new("slow-setup", "1.0")
        .with_setup_step(GateStep::new("prepare", gate.clone()).ignore_cancellation())
        .with_step(StepFn::new("run", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }));
    let job = make_job("job-late-cancel", alice(), definition, dir.path());
    engine.submit(job.clone()).await.unwrap();
    wait_until(|| job.steps().len() == 2).await;

    assert_eq!(engine.cancel(&job), CancelOutcome::Signalled);
    gate.add_permits(1);
    wait_until(|| store.stored_state("job-late-cancel").as_deref() == Some("CANCELED")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(job.state(), JobState::Canceled);
    assert!(!job.is_setup_complete());
    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert!(!engine.is_in_queue(&job));
    assert!(engine.get_all_jobs_in_execution_queue().is_empty());
    assert_eq!(store.step_names("job-late-cancel"), vec![INPUT_VALIDATION_STEP, "prepare"]);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_restart_dead_job() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());

    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let definition = WorkflowDefinition::new("flaky", "1.0")
        .with_input(ParameterDef::new("name", ParameterKind::Text))
        .with_setup_step(StepFn::new("check", move |ctx| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                ctx.error("reference data not ready");
            }
            Ok(attempt > 0)
        }))
        .with_step(StepFn::new("run", |ctx| {
            ctx.increment_counter("runs", 1);
            Ok(true)
        }));
    let local = dir.path().join("job-flaky");
    std::fs::create_dir_all(&local).unwrap();
    let job = Arc::new(jobflow::domain::Job::new(
        "job-flaky",
        alice(),
        common::app_ref(&definition),
        Arc::new(definition),
        jobflow::workflow::Workspace::new(local, "/remote/job-flaky"),
        vec![Parameter::input("name", ParameterKind::Text, "x")],
    ));

    engine.submit(job.clone()).await.unwrap();
    wait_until(|| store.stored_state("job-flaky").as_deref() == Some("DEAD")).await;
    let params_before = store.parameters_for("job-flaky").len();

    engine.block();
    engine.restart(job.clone()).await.unwrap();

    assert_eq!(job.state(), JobState::SetupRunning);
    assert!(!job.is_setup_complete());
    assert!(job.steps().is_empty());
    assert!(engine.get_all_jobs_in_setup_queue().iter().any(|j| j.id() == "job-flaky"));

    engine.resume();
    wait_until(|| store.stored_state("job-flaky").as_deref() == Some("SUCCESS")).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(store.parameters_for("job-flaky").len(), params_before);
    let inserts = store
        .writes_for("job-flaky")
        .into_iter()
        .filter(|w| matches!(w, Write::InsertJob(_)))
        .count();
    assert_eq!(inserts, 1);
    wait_until(|| store.counters_for("job-flaky").len() == 1).await;

    let err = engine.restart(job.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(msg) if msg == "Job job-flaky is not pending."));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_counters_are_a_live_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());
    let gate = Arc::new(Semaphore::new(0));

    let definition = || {
        WorkflowDefinition::new("reads", "1.0")
            .with_step(StepFn::new("count", |ctx| {
                ctx.increment_counter("reads", 10);
                Ok(true)
            }))
            .with_step(GateStep::new("wait", gate.clone()))
    };
    let a = make_job("job-a", alice(), definition(), dir.path());
    let b = make_job("job-b", bob(), definition(), dir.path());
    engine.submit(a.clone()).await.unwrap();
    engine.submit(b.clone()).await.unwrap();

    wait_until(|| engine.get_counters(JobState::Running).get("reads") == Some(&20)).await;
    assert!(engine.get_counters(JobState::Waiting).is_empty());

    gate.add_permits(2);
    wait_until(|| store.counters_for("job-a").len() == 1 && store.counters_for("job-b").len() == 1)
        .await;

    assert!(engine.get_counters(JobState::Running).is_empty());
    assert!(engine.get_counters(JobState::Success).is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_block_holds_back_new_jobs() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());
    wait_until(|| engine.is_running()).await;

    engine.block();
    assert!(!engine.is_running());

    let job = make_job("job-held", alice(), WorkflowDefinition::new("noop", "1"), dir.path());
    engine.submit(job.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(engine.get_active_count(), 0);
    assert_eq!(job.state(), JobState::Incoming);
    assert_eq!(engine.get_jobs_by_user("alice").len(), 1);

    engine.resume();
    assert!(engine.is_running());
    wait_until(|| store.stored_state("job-held").as_deref() == Some("SUCCESS")).await;
    assert!(engine.get_jobs_by_user("alice").is_empty());

    engine.shutdown().await;
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_persistence_failure_does_not_stop_the_engine() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());
    store.fail_updates.store(true, Ordering::SeqCst);

    let broken = make_job("job-unsaved", alice(), WorkflowDefinition::new("noop", "1"), dir.path());
    engine.submit(broken.clone()).await.unwrap();
    wait_until(|| broken.persistence_error().is_some()).await;

    assert_eq!(broken.state(), JobState::Success);
    assert!(broken.persistence_error().unwrap().contains("store unreachable"));
    assert_eq!(store.stored_state("job-unsaved").as_deref(), Some("INCOMING"));
    wait_until(|| engine.get_unsaved_job("job-unsaved").is_some()).await;

    let retried = engine.recorder().retry_unsaved("job-unsaved").await.unwrap();
    assert!(Arc::ptr_eq(&retried, &broken));
    assert!(broken.persistence_error().is_some());
    assert!(engine.get_unsaved_job("job-unsaved").is_some());

    store.fail_updates.store(false, Ordering::SeqCst);
    engine.recorder().retry_unsaved("job-unsaved").await.unwrap();
    assert!(broken.persistence_error().is_none());
    assert!(engine.get_unsaved_job("job-unsaved").is_none());
    assert_eq!(store.stored_state("job-unsaved").as_deref(), Some("SUCCESS"));
    assert!(engine.recorder().retry_unsaved("job-unsaved").await.is_none());

    let healthy = make_job("job-saved", alice(), WorkflowDefinition::new("noop", "1"), dir.path());
    engine.submit(healthy.clone()).await.unwrap();
    wait_until(|| store.stored_state("job-saved").as_deref() == Some("SUCCESS")).await;
    assert!(healthy.persistence_error().is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_submission_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let engine = start_engine(&store, EngineConfig::default());
    engine.block();

    let job = make_job("job-dup", alice(), WorkflowDefinition::new("noop", "1"), dir.path());
    engine.submit(job.clone()).await.unwrap();
    assert!(engine.submit(job.clone()).await.is_err());
    assert_eq!(engine.get_all_jobs_in_setup_queue().len(), 1);

    engine.shutdown().await;
}

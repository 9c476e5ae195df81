use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use jobflow::config::Settings;
use jobflow::database::{self, Repositories};
use jobflow::engine::WorkflowEngine;
use jobflow::logging;
use jobflow::service::{JobLimits, JobService};
use jobflow::utils::fs::ensure_dir_all_with_op;
use jobflow::workflow::{ApplicationRegistry, DirectoryWorkspaceResolver};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let settings = Settings::from_env().context("invalid settings")?;

    let (logging_config, _log_guard) = logging::init_logging(&settings.log_dir, settings.log_json)?;
    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    let pool = database::init_pool(&settings.database_url).await?;
    database::run_migrations(&pool).await?;
    let repos = Repositories::sqlx(pool.clone());

    ensure_dir_all_with_op("creating workspace root", &settings.local_workspace).await?;
    let registry = Arc::new(ApplicationRegistry::new());
    registry.load_dir(&settings.apps_dir).await?;

    let engine = Arc::new(WorkflowEngine::new(settings.engine.clone(), repos.clone()));
    engine.run();

    let service = JobService::new(
        engine.clone(),
        registry.clone(),
        Arc::new(DirectoryWorkspaceResolver::new(
            settings.local_workspace.clone(),
            settings.remote_workspace.clone(),
        )),
        repos,
        JobLimits {
            max_running_jobs: settings.max_running_jobs,
            max_running_jobs_per_user: settings.max_running_jobs_per_user,
            public_id_salt: settings.public_id_salt.clone(),
        },
    );

    tracing::info!(
        applications = registry.list().len(),
        setup_workers = settings.engine.setup_concurrency,
        execution_workers = settings.engine.execution_concurrency,
        "jobflow initialized successfully"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!(
        active_jobs = service.engine().get_active_count(),
        "Shutdown requested"
    );
    shutdown.cancel();
    engine.shutdown().await;
    pool.close().await;

    Ok(())
}

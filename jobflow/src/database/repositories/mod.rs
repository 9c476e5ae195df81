//! Repository layer for database access.

pub mod counter;
pub mod job;
pub mod parameter;
pub mod step;

pub use counter::*;
pub use job::*;
pub use parameter::*;
pub use step::*;

use std::sync::Arc;

use sqlx::SqlitePool;

/// The record stores the engine and service write to.
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub parameters: Arc<dyn ParameterRepository>,
    pub downloads: Arc<dyn DownloadRepository>,
    pub steps: Arc<dyn StepRepository>,
    pub counters: Arc<dyn CounterRepository>,
}

impl Repositories {
    /// SQLite-backed repositories sharing one pool.
    pub fn sqlx(pool: SqlitePool) -> Self {
        Self {
            jobs: Arc::new(SqlxJobRepository::new(pool.clone())),
            parameters: Arc::new(SqlxParameterRepository::new(pool.clone())),
            downloads: Arc::new(SqlxDownloadRepository::new(pool.clone())),
            steps: Arc::new(SqlxStepRepository::new(pool.clone())),
            counters: Arc::new(SqlxCounterRepository::new(pool)),
        }
    }
}

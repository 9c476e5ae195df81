//! Counter repository.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::CounterDbModel;

/// Counter repository trait.
#[async_trait]
pub trait CounterRepository: Send + Sync {
    async fn insert_counter(&self, counter: &CounterDbModel) -> Result<()>;
    async fn list_counters(&self, job_id: &str) -> Result<Vec<CounterDbModel>>;
    /// Sum per counter name over every job.
    async fn totals(&self) -> Result<BTreeMap<String, i64>>;
}

/// SQLx implementation of CounterRepository.
pub struct SqlxCounterRepository {
    pool: SqlitePool,
}

impl SqlxCounterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterRepository for SqlxCounterRepository {
    async fn insert_counter(&self, counter: &CounterDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO counter (job_id, name, value, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&counter.job_id)
        .bind(&counter.name)
        .bind(counter.value)
        .bind(&counter.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_counters(&self, job_id: &str) -> Result<Vec<CounterDbModel>> {
        let counters = sqlx::query_as::<_, CounterDbModel>(
            "SELECT * FROM counter WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(counters)
    }

    async fn totals(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT name, CAST(SUM(value) AS INTEGER) FROM counter GROUP BY name ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }
}

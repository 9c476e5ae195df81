//! Step and message repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{MessageDbModel, StepDbModel};

/// Step repository trait.
#[async_trait]
pub trait StepRepository: Send + Sync {
    /// Insert and return the new id.
    async fn insert_step(&self, step: &StepDbModel) -> Result<i64>;
    async fn insert_message(&self, message: &MessageDbModel) -> Result<()>;
    async fn list_steps(&self, job_id: &str) -> Result<Vec<StepDbModel>>;
    async fn list_messages(&self, step_id: i64) -> Result<Vec<MessageDbModel>>;
}

/// SQLx implementation of StepRepository.
pub struct SqlxStepRepository {
    pool: SqlitePool,
}

impl SqlxStepRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StepRepository for SqlxStepRepository {
    async fn insert_step(&self, step: &StepDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO step (job_id, name, position, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&step.job_id)
        .bind(&step.name)
        .bind(step.position)
        .bind(&step.started_at)
        .bind(&step.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn insert_message(&self, message: &MessageDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO message (step_id, level, text, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(message.step_id)
        .bind(&message.level)
        .bind(&message.text)
        .bind(&message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_steps(&self, job_id: &str) -> Result<Vec<StepDbModel>> {
        let steps = sqlx::query_as::<_, StepDbModel>(
            "SELECT * FROM step WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(steps)
    }

    async fn list_messages(&self, step_id: i64) -> Result<Vec<MessageDbModel>> {
        let messages = sqlx::query_as::<_, MessageDbModel>(
            "SELECT * FROM message WHERE step_id = ? ORDER BY id",
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }
}

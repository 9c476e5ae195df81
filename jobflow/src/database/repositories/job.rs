//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::JobDbModel;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn list_jobs_by_user(&self, user_id: i64) -> Result<Vec<JobDbModel>>;
    async fn list_jobs_by_state(&self, state: &str) -> Result<Vec<JobDbModel>>;
    async fn insert_job(&self, job: &JobDbModel) -> Result<()>;
    async fn update_job(&self, job: &JobDbModel) -> Result<()>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_jobs_by_user(&self, user_id: i64) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_jobs_by_state(&self, state: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE state = ? ORDER BY created_at DESC",
        )
        .bind(state)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn insert_job(&self, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job (
                id, user_id, username, admin, application_id, application_name,
                application_version, state, local_workspace, remote_workspace,
                submitted_at, started_at, finished_at, error, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.user_id)
        .bind(&job.username)
        .bind(job.admin)
        .bind(&job.application_id)
        .bind(&job.application_name)
        .bind(&job.application_version)
        .bind(&job.state)
        .bind(&job.local_workspace)
        .bind(&job.remote_workspace)
        .bind(&job.submitted_at)
        .bind(&job.started_at)
        .bind(&job.finished_at)
        .bind(&job.error)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &JobDbModel) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE job SET
                state = ?,
                local_workspace = ?,
                remote_workspace = ?,
                submitted_at = ?,
                started_at = ?,
                finished_at = ?,
                error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.state)
        .bind(&job.local_workspace)
        .bind(&job.remote_workspace)
        .bind(&job.submitted_at)
        .bind(&job.started_at)
        .bind(&job.finished_at)
        .bind(&job.error)
        .bind(&now)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", &job.id));
        }
        Ok(())
    }
}

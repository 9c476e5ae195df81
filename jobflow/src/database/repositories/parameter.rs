//! Parameter and download repositories.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{DownloadDbModel, ParameterDbModel};

/// Parameter repository trait.
#[async_trait]
pub trait ParameterRepository: Send + Sync {
    /// Insert and return the new id.
    async fn insert_parameter(&self, param: &ParameterDbModel) -> Result<i64>;
    async fn list_parameters(&self, job_id: &str) -> Result<Vec<ParameterDbModel>>;
}

/// Download repository trait.
#[async_trait]
pub trait DownloadRepository: Send + Sync {
    async fn insert_download(&self, download: &DownloadDbModel) -> Result<i64>;
    async fn list_downloads(&self, job_id: &str) -> Result<Vec<DownloadDbModel>>;
}

/// SQLx implementation of ParameterRepository.
pub struct SqlxParameterRepository {
    pool: SqlitePool,
}

impl SqlxParameterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ParameterRepository for SqlxParameterRepository {
    async fn insert_parameter(&self, param: &ParameterDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO parameter (job_id, name, direction, kind, value, download)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&param.job_id)
        .bind(&param.name)
        .bind(&param.direction)
        .bind(&param.kind)
        .bind(&param.value)
        .bind(param.download)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_parameters(&self, job_id: &str) -> Result<Vec<ParameterDbModel>> {
        let params = sqlx::query_as::<_, ParameterDbModel>(
            "SELECT * FROM parameter WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(params)
    }
}

/// SQLx implementation of DownloadRepository.
pub struct SqlxDownloadRepository {
    pool: SqlitePool,
}

impl SqlxDownloadRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DownloadRepository for SqlxDownloadRepository {
    async fn insert_download(&self, download: &DownloadDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO download (job_id, parameter_id, name, path, size, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&download.job_id)
        .bind(download.parameter_id)
        .bind(&download.name)
        .bind(&download.path)
        .bind(download.size)
        .bind(&download.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_downloads(&self, job_id: &str) -> Result<Vec<DownloadDbModel>> {
        let downloads = sqlx::query_as::<_, DownloadDbModel>(
            "SELECT * FROM download WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(downloads)
    }
}

//! Parameter, download and counter database models.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{Download, Parameter, ParameterDirection, ParameterKind};
use crate::{Error, Result};

/// Parameter database model.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ParameterDbModel {
    pub id: i64,
    pub job_id: String,
    pub name: String,
    /// INPUT, OUTPUT
    pub direction: String,
    pub kind: String,
    pub value: String,
    pub download: bool,
}

impl ParameterDbModel {
    pub fn from_parameter(job_id: &str, param: &Parameter) -> Self {
        Self {
            id: param.id.unwrap_or_default(),
            job_id: job_id.to_string(),
            name: param.name.clone(),
            direction: param.direction.to_string(),
            kind: param.kind.to_string(),
            value: param.value.clone(),
            download: param.download,
        }
    }

    pub fn to_parameter(&self) -> Result<Parameter> {
        let direction = ParameterDirection::from_str(&self.direction).map_err(|_| {
            Error::Database(format!("Unknown parameter direction '{}'", self.direction))
        })?;
        let kind = ParameterKind::from_str(&self.kind)
            .map_err(|_| Error::Database(format!("Unknown parameter kind '{}'", self.kind)))?;

        Ok(Parameter {
            id: Some(self.id),
            name: self.name.clone(),
            direction,
            kind,
            value: self.value.clone(),
            download: self.download,
            files: Vec::new(),
        })
    }
}

/// Download database model.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DownloadDbModel {
    pub id: i64,
    pub job_id: String,
    pub parameter_id: i64,
    pub name: String,
    pub path: String,
    pub size: i64,
    pub created_at: String,
}

impl DownloadDbModel {
    pub fn new(job_id: &str, parameter_id: i64, download: &Download) -> Self {
        Self {
            id: 0,
            job_id: job_id.to_string(),
            parameter_id,
            name: download.name.clone(),
            path: download.path.clone(),
            size: i64::try_from(download.size).unwrap_or(i64::MAX),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Counter database model. One row per job and counter name.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct CounterDbModel {
    pub id: i64,
    pub job_id: String,
    pub name: String,
    pub value: i64,
    pub created_at: String,
}

impl CounterDbModel {
    pub fn new(job_id: &str, name: impl Into<String>, value: i64) -> Self {
        Self {
            id: 0,
            job_id: job_id.to_string(),
            name: name.into(),
            value,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

//! Step and message database models.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{format_time, parse_time};
use crate::domain::{Message, MessageLevel, Step};
use crate::{Error, Result};

/// Step database model.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct StepDbModel {
    pub id: i64,
    pub job_id: String,
    pub name: String,
    pub position: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl StepDbModel {
    pub fn from_step(job_id: &str, step: &Step) -> Self {
        Self {
            id: 0,
            job_id: job_id.to_string(),
            name: step.name.clone(),
            position: step.order as i64,
            started_at: step.started_at.to_rfc3339(),
            finished_at: format_time(step.finished_at),
        }
    }

    /// Rebuild the step with its messages.
    pub fn to_step(&self, messages: &[MessageDbModel]) -> Result<Step> {
        let started_at = parse_time(Some(&self.started_at))?
            .ok_or_else(|| Error::Database("Step without start time".to_string()))?;
        Ok(Step {
            name: self.name.clone(),
            order: usize::try_from(self.position).unwrap_or_default(),
            started_at,
            finished_at: parse_time(self.finished_at.as_deref())?,
            messages: messages
                .iter()
                .map(MessageDbModel::to_message)
                .collect::<Result<_>>()?,
        })
    }
}

/// Message database model.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct MessageDbModel {
    pub id: i64,
    pub step_id: i64,
    /// DEBUG, INFO, WARN, ERROR
    pub level: String,
    pub text: String,
    pub created_at: String,
}

impl MessageDbModel {
    pub fn from_message(step_id: i64, message: &Message) -> Self {
        Self {
            id: 0,
            step_id,
            level: message.level.to_string(),
            text: message.text.clone(),
            created_at: message.timestamp.to_rfc3339(),
        }
    }

    pub fn to_message(&self) -> Result<Message> {
        let level = MessageLevel::from_str(&self.level)
            .map_err(|_| Error::Database(format!("Unknown message level '{}'", self.level)))?;
        let timestamp = parse_time(Some(&self.created_at))?
            .ok_or_else(|| Error::Database("Message without timestamp".to_string()))?;
        Ok(Message {
            timestamp,
            level,
            text: self.text.clone(),
        })
    }
}

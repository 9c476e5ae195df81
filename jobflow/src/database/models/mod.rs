//! Database models.
//!
//! Plain row structs. Timestamps are stored as RFC 3339 strings.

pub mod job;
pub mod parameter;
pub mod step;

pub use job::*;
pub use parameter::*;
pub use step::*;

use chrono::{DateTime, Utc};

use crate::{Error, Result};

pub(crate) fn format_time(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|t| t.to_rfc3339())
}

pub(crate) fn parse_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Database(format!("Invalid timestamp '{v}': {e}")))
        })
        .transpose()
}

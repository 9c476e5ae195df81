//! Job parameters and produced-file records.

use serde::{Deserialize, Serialize};

/// Whether a parameter is consumed or produced by a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterDirection {
    Input,
    Output,
}

/// Parameter types understood by the scheduler.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    #[default]
    Text,
    Number,
    Checkbox,
    List,
    LocalFile,
    LocalFolder,
    RemoteFile,
    RemoteFolder,
}

impl ParameterKind {
    /// Lives on the remote (distributed) file system.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteFile | Self::RemoteFolder)
    }

    /// Lives on the local file system.
    pub fn is_local_path(&self) -> bool {
        matches!(self, Self::LocalFile | Self::LocalFolder)
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Self::LocalFolder | Self::RemoteFolder)
    }
}

/// A file produced by an output parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub name: String,
    pub path: String,
    pub size: u64,
}

/// A named value attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Store id, assigned once the record was inserted.
    pub id: Option<i64>,
    pub name: String,
    pub direction: ParameterDirection,
    pub kind: ParameterKind,
    pub value: String,
    /// Output produces downloadable files.
    pub download: bool,
    /// Files collected for a download-producing output.
    pub files: Vec<Download>,
}

impl Parameter {
    pub fn input(name: impl Into<String>, kind: ParameterKind, value: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            direction: ParameterDirection::Input,
            kind,
            value: value.into(),
            download: false,
            files: Vec::new(),
        }
    }

    pub fn output(
        name: impl Into<String>,
        kind: ParameterKind,
        value: impl Into<String>,
        download: bool,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            direction: ParameterDirection::Output,
            kind,
            value: value.into(),
            download,
            files: Vec::new(),
        }
    }

    /// Output parameter with collected files that should be recorded.
    pub fn has_downloads(&self) -> bool {
        self.direction == ParameterDirection::Output && self.download && !self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_kind_strings() {
        assert_eq!(ParameterKind::RemoteFolder.to_string(), "remote_folder");
        assert_eq!(
            ParameterKind::from_str("local_file").unwrap(),
            ParameterKind::LocalFile
        );
        assert!(ParameterKind::RemoteFile.is_remote());
        assert!(ParameterKind::LocalFolder.is_folder());
        assert!(!ParameterKind::Checkbox.is_local_path());
    }

    #[test]
    fn test_has_downloads() {
        let mut output = Parameter::output("results", ParameterKind::LocalFolder, "/w/results", true);
        assert!(!output.has_downloads());

        output.files.push(Download {
            name: "a.txt".to_string(),
            path: "/w/results/a.txt".to_string(),
            size: 3,
        });
        assert!(output.has_downloads());

        let input = Parameter::input("file", ParameterKind::LocalFile, "/in");
        assert!(!input.has_downloads());
    }
}

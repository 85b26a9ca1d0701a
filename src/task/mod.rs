pub mod config;

pub use config::{Variables, substitute_variables};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskerError};
use crate::name::validate_name;
use crate::util::parse_timeout;

/// A named shell command that jobs refer to by name.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Task {
    #[serde(default, skip_serializing)]
    pub(crate) name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Task {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout: None,
            working_dir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.command.trim().is_empty() {
            return Err(TaskerError::Validation(format!(
                "task '{}' has an empty command",
                self.name
            )));
        }

        if let Some(timeout) = &self.timeout {
            parse_timeout(timeout)?;
        }

        Ok(())
    }
}

use std::path::PathBuf;

use thiserror::Error;

use crate::util::CommandError;

#[derive(Debug, Error)]
pub enum TaskerError {
    #[error("Invalid name '{0}': names must match [A-Za-z0-9_-]+")]
    InvalidName(String),

    #[error("Invalid variable name '{0}': names must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidVariable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} '{name}' already exists")]
    DuplicateName { kind: EntityKind, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntityKind, name: String },

    #[error("Unknown task(s): {}", .0.join(", "))]
    UnknownTask(Vec<String>),

    #[error("Task '{task}' is used by job(s): {}", .jobs.join(", "))]
    TaskInUse { task: String, jobs: Vec<String> },

    #[error("Job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Persistence error on {}: {message}", .path.display())]
    Persistence { path: PathBuf, message: String },

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Job,
    Task,
    Run,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Job => write!(f, "Job"),
            EntityKind::Task => write!(f, "Task"),
            EntityKind::Run => write!(f, "Run"),
        }
    }
}

impl TaskerError {
    pub fn duplicate_job(name: impl Into<String>) -> Self {
        TaskerError::DuplicateName {
            kind: EntityKind::Job,
            name: name.into(),
        }
    }

    pub fn job_not_found(name: impl Into<String>) -> Self {
        TaskerError::NotFound {
            kind: EntityKind::Job,
            name: name.into(),
        }
    }

    pub fn task_not_found(name: impl Into<String>) -> Self {
        TaskerError::NotFound {
            kind: EntityKind::Task,
            name: name.into(),
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        TaskerError::Persistence {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskerError>;

//! Run records: one execution attempt of a job and its per-task results.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RunId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => f.pad("running"),
            RunStatus::Success => f.pad("success"),
            RunStatus::Failure => f.pad("failure"),
        }
    }
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failure,
    /// Never started because an earlier task failed or the run was stopped.
    Skipped,
    /// Interrupted by a stop signal while running.
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Success => f.pad("success"),
            TaskStatus::Failure => f.pad("failure"),
            TaskStatus::Skipped => f.pad("skipped"),
            TaskStatus::Cancelled => f.pad("cancelled"),
        }
    }
}

/// What a task executor reports for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            exit_code: Some(0),
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            exit_code: None,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: TaskStatus::Cancelled,
            exit_code: None,
            output: String::new(),
            error: Some("cancelled by stop signal".to_string()),
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn skipped(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            status: TaskStatus::Skipped,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            exit_code: None,
            output: String::new(),
            error: None,
        }
    }

    pub fn finished(
        task: impl Into<String>,
        outcome: TaskOutcome,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms = (finished_at - started_at)
            .to_std()
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            task: task.into(),
            status: outcome.status,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            duration_ms,
            exit_code: outcome.exit_code,
            output: outcome.output,
            error: outcome.error,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// A finished run. Fields are read-only; runs are produced by
/// [`PendingRun::finish`] or loaded from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    run_id: RunId,
    job_name: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    status: RunStatus,
    #[serde(default)]
    task_results: Vec<TaskResult>,
}

impl Run {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn task_results(&self) -> &[TaskResult] {
        &self.task_results
    }

    pub fn result_for(&self, task: &str) -> Option<&TaskResult> {
        self.task_results.iter().find(|r| r.task == task)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// The job was renamed; the run follows it.
    pub(crate) fn rename_job(&mut self, job_name: &str) {
        self.job_name = job_name.to_string();
    }
}

/// A run in state `running`, collecting task results in order.
#[derive(Debug)]
pub struct PendingRun {
    run_id: RunId,
    job_name: String,
    started_at: DateTime<Utc>,
    task_results: Vec<TaskResult>,
}

impl PendingRun {
    pub fn start(run_id: RunId, job_name: impl Into<String>) -> Self {
        Self {
            run_id,
            job_name: job_name.into(),
            started_at: Utc::now(),
            task_results: Vec::new(),
        }
    }

    pub fn record(&mut self, result: TaskResult) {
        self.task_results.push(result);
    }

    /// Success only when every task succeeded; an empty job succeeds.
    pub fn finish(self) -> Run {
        let status = if self
            .task_results
            .iter()
            .all(|r| r.status == TaskStatus::Success)
        {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };

        Run {
            run_id: self.run_id,
            job_name: self.job_name,
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
            task_results: self.task_results,
        }
    }
}

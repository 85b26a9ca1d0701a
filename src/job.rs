use std::{cmp::Ordering, fmt};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskerError};
use crate::name::validate_name;
use crate::run::{Run, RunId, RunStatus};

fn first_run_id() -> RunId {
    1
}

/// TOML integers are `i64`; the next id after this must still be storable.
const MAX_RUN_ID: RunId = i64::MAX as RunId - 1;

/// A named, ordered sequence of task references plus its run history.
///
/// `status` and `last_run` are derived from the newest run, so they cannot
/// drift from the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, skip_serializing)]
    pub(crate) name: String,
    #[serde(default)]
    tasks: Vec<String>,
    #[serde(default = "first_run_id")]
    next_run_id: RunId,
    #[serde(default)]
    runs: Vec<Run>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Success,
    Failure,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::New => f.pad("new"),
            JobStatus::Success => f.pad("success"),
            JobStatus::Failure => f.pad("failure"),
        }
    }
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            next_run_id: first_run_id(),
            runs: Vec::new(),
        }
    }

    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn get_run(&self, run_id: RunId) -> Option<&Run> {
        self.runs.iter().find(|run| run.run_id() == run_id)
    }

    pub fn latest_run(&self) -> Option<&Run> {
        self.runs.last()
    }

    pub fn status(&self) -> JobStatus {
        match self.latest_run().map(Run::status) {
            None | Some(RunStatus::Running) => JobStatus::New,
            Some(RunStatus::Success) => JobStatus::Success,
            Some(RunStatus::Failure) => JobStatus::Failure,
        }
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.latest_run().map(Run::started_at)
    }

    /// Id the next run of this job will get.
    pub fn next_run_id(&self) -> RunId {
        self.next_run_id
    }

    /// Replaces the task list. Every name must satisfy `is_known`; otherwise
    /// nothing changes and all missing names are reported.
    pub fn update_tasks<I, S, F>(&mut self, tasks: I, is_known: F) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&str) -> bool,
    {
        let tasks: Vec<String> = tasks.into_iter().map(Into::into).collect();

        let mut missing: Vec<String> = Vec::new();
        for task in &tasks {
            if !is_known(task) && !missing.contains(task) {
                missing.push(task.clone());
            }
        }

        if !missing.is_empty() {
            return Err(TaskerError::UnknownTask(missing));
        }

        self.tasks = tasks;
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        let mut previous: Option<RunId> = None;
        for run in &self.runs {
            if !run.status().is_terminal() {
                return Err(TaskerError::Validation(format!(
                    "job '{}' has unfinished run {} in its history",
                    self.name,
                    run.run_id()
                )));
            }
            if run.run_id() > MAX_RUN_ID {
                return Err(TaskerError::Validation(format!(
                    "job '{}' has run id {} beyond the storable range",
                    self.name,
                    run.run_id()
                )));
            }
            if previous.is_some_and(|prev| run.run_id() <= prev) {
                return Err(TaskerError::Validation(format!(
                    "job '{}' has out-of-order run id {}",
                    self.name,
                    run.run_id()
                )));
            }
            previous = Some(run.run_id());
        }

        Ok(())
    }

    /// Keeps `next_run_id` ahead of every recorded run, e.g. for a
    /// hand-edited store that omits it.
    pub(crate) fn repair_run_counter(&mut self) {
        if let Some(last) = self.runs.last() {
            self.next_run_id = self.next_run_id.max(last.run_id() + 1);
        }
    }

    pub(crate) fn references(&self, task: &str) -> bool {
        self.tasks.iter().any(|t| t == task)
    }

    pub(crate) fn rename(&mut self, name: &str) {
        self.name = name.to_string();
        for run in &mut self.runs {
            run.rename_job(name);
        }
    }

    /// Appends a finished run and trims history to `history_limit` newest runs.
    pub(crate) fn append_run(&mut self, run: Run, history_limit: Option<usize>) -> Result<()> {
        if !run.status().is_terminal() {
            return Err(TaskerError::Validation(format!(
                "run {} of job '{}' is still running",
                run.run_id(),
                self.name
            )));
        }
        if run.run_id() > MAX_RUN_ID {
            return Err(TaskerError::Validation(format!(
                "run id {} of job '{}' is beyond the storable range",
                run.run_id(),
                self.name
            )));
        }
        if run.run_id() < self.next_run_id {
            return Err(TaskerError::Validation(format!(
                "run id {} of job '{}' was already used",
                run.run_id(),
                self.name
            )));
        }

        self.next_run_id = run.run_id() + 1;
        self.runs.push(run);

        if let Some(limit) = history_limit {
            if self.runs.len() > limit {
                let excess = self.runs.len() - limit;
                self.runs.drain(..excess);
            }
        }

        Ok(())
    }

    /// Keeps the run history when a definition replaces an existing job.
    pub(crate) fn inherit_history(&mut self, previous: &Job) {
        self.runs = previous.runs.clone();
        self.next_run_id = self.next_run_id.max(previous.next_run_id);
    }
}

/// Column a job listing can be ordered by.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Name,
    Status,
    LastRun,
}

impl SortKey {
    /// Ties on status or last_run fall back to name.
    pub fn compare(self, a: &Job, b: &Job) -> Ordering {
        let primary = match self {
            SortKey::Name => Ordering::Equal,
            SortKey::Status => a.status().cmp(&b.status()),
            SortKey::LastRun => a.last_run().cmp(&b.last_run()),
        };
        primary.then_with(|| a.name().cmp(b.name()))
    }
}

pub fn sort_jobs(jobs: &mut [Job], key: SortKey, descending: bool) {
    jobs.sort_by(|a, b| {
        let ordering = key.compare(a, b);
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

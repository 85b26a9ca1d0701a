//! Jobs made of named tasks, executed in order, with a durable run history.
//!
//! [`ConfigurationStore`] owns every [`Job`] and [`Task`] and persists them
//! as one TOML document. [`JobRunner`] executes a job through a
//! [`TaskExecutor`] and appends the resulting [`Run`] to the job.

pub mod error;
pub mod execution;
pub mod job;
pub mod name;
pub mod run;
pub mod store;
pub mod task;
pub mod util;

pub use error::{EntityKind, Result, TaskerError};
pub use execution::{
    ExecutionContext, JobRunner, RunExecutor, RunHandle, ShellExecutor, StopHandle, StopSignal,
    TaskExecutor,
};
pub use job::{Job, JobStatus, SortKey};
pub use run::{Run, RunId, RunStatus, TaskOutcome, TaskResult, TaskStatus};
pub use store::{AddMode, ConfigurationStore, Settings};
pub use task::Task;

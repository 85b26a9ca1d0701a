use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tasker::SortKey;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Store file to use
    #[arg(short = 'f', long = "file", default_value = "tasker.toml")]
    pub file: PathBuf,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// How to print results
    #[arg(long = "format", value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage jobs
    #[command(subcommand)]
    Job(JobCommand),

    /// Inspect runs
    #[command(subcommand)]
    Run(RunCommand),

    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommand),
}

#[derive(Subcommand)]
pub enum JobCommand {
    /// List jobs
    List {
        /// Column to sort by
        #[arg(long = "sort", value_enum)]
        sort: Option<SortKey>,

        /// Sort in descending order
        #[arg(long = "desc")]
        desc: bool,
    },

    /// Create an empty job
    Create { name: String },

    /// Delete a job and its history
    Delete { name: String },

    /// Rename a job
    Rename { old: String, new: String },

    /// Replace the ordered task list of a job
    SetTasks {
        name: String,
        #[arg(required = true)]
        tasks: Vec<String>,
    },

    /// Show a job and its runs
    Show { name: String },

    /// Run a job now and wait for it to finish
    Run { name: String },
}

#[derive(Subcommand)]
pub enum RunCommand {
    /// Show one run of a job
    Show { job: String, run_id: u64 },
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Define a task, or redefine it with --replace
    Add(TaskArgs),

    /// Delete a task no job refers to
    Remove { name: String },

    /// List tasks
    List,
}

#[derive(Args)]
pub struct TaskArgs {
    pub name: String,

    /// Shell command the task runs
    #[arg(short = 'c', long = "command")]
    pub command: String,

    /// Timeout (e.g., "5m", "30s", "1h30m")
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<String>,

    /// Directory to run the command in
    #[arg(long = "workdir")]
    pub workdir: Option<PathBuf>,

    /// Overwrite an existing task of the same name
    #[arg(long = "replace")]
    pub replace: bool,
}

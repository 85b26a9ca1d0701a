use clap::Parser;
use std::{process::ExitCode, sync::Arc};
use tracing_subscriber::EnvFilter;

mod cli;
mod output;

use cli::{Cli, Command, JobCommand, RunCommand, TaskArgs, TaskCommand};
use output::OutputFormat;
use tasker::{AddMode, ConfigurationStore, Job, JobRunner, Result, Task, TaskerError};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_logging(args.verbose);

    match run_tasker(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "tasker=debug" } else { "tasker=warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run_tasker(args: Cli) -> Result<ExitCode> {
    let store = Arc::new(ConfigurationStore::load(&args.file).await?);
    let format = args.format;

    match args.command {
        Command::Job(command) => run_job_command(store, command, format).await,
        Command::Run(RunCommand::Show { job, run_id }) => {
            let job = store
                .get_one(&job)
                .await
                .ok_or_else(|| TaskerError::job_not_found(&job))?;
            let run = job.get_run(run_id).ok_or_else(|| TaskerError::NotFound {
                kind: tasker::EntityKind::Run,
                name: format!("{}#{}", job.name(), run_id),
            })?;
            output::print_run(run, format);
            Ok(ExitCode::SUCCESS)
        }
        Command::Task(command) => {
            run_task_command(&store, command, format).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_job_command(
    store: Arc<ConfigurationStore>,
    command: JobCommand,
    format: OutputFormat,
) -> Result<ExitCode> {
    match command {
        JobCommand::List { sort, desc } => {
            let jobs = store.get_list(sort, desc).await;
            output::print_jobs(&jobs, format);
        }
        JobCommand::Create { name } => {
            store.add(Job::new(&name), AddMode::Create).await?;
            println!("Created job '{}'.", name);
        }
        JobCommand::Delete { name } => {
            store.remove(&name).await?;
            println!("Deleted job '{}'.", name);
        }
        JobCommand::Rename { old, new } => {
            store.rename(&old, &new).await?;
            println!("Renamed job '{}' to '{}'.", old, new);
        }
        JobCommand::SetTasks { name, tasks } => {
            let job = store.update_tasks(&name, tasks).await?;
            output::print_job(&job, format);
        }
        JobCommand::Show { name } => {
            let job = store
                .get_one(&name)
                .await
                .ok_or_else(|| TaskerError::job_not_found(&name))?;
            output::print_job(&job, format);
        }
        JobCommand::Run { name } => {
            let runner = JobRunner::with_shell(store);
            let handle = runner.start(&name).await?;

            let stop = handle.stop_handle();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Stopping run...");
                    stop.stop();
                }
            });

            let result = handle.wait().await;
            interrupt.abort();

            let run = result?;
            output::print_run(&run, format);
            if !run.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_task_command(
    store: &ConfigurationStore,
    command: TaskCommand,
    format: OutputFormat,
) -> Result<()> {
    match command {
        TaskCommand::Add(TaskArgs {
            name,
            command,
            timeout,
            workdir,
            replace,
        }) => {
            let mut task = Task::new(&name, command);
            if let Some(timeout) = timeout {
                task = task.with_timeout(timeout);
            }
            if let Some(dir) = workdir {
                task = task.with_working_dir(dir);
            }
            let mode = if replace {
                AddMode::Replace
            } else {
                AddMode::Create
            };
            store.add_task(task, mode).await?;
            println!("Saved task '{}'.", name);
        }
        TaskCommand::Remove { name } => {
            store.remove_task(&name).await?;
            println!("Removed task '{}'.", name);
        }
        TaskCommand::List => {
            let tasks = store.task_list().await;
            output::print_tasks(&tasks, format);
        }
    }

    Ok(())
}

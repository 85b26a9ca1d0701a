use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use tasker::{Job, JobStatus, Run, RunId, Task, TaskResult};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable lines.
    Text,
    /// One JSON document per command.
    Json,
}

#[derive(Serialize)]
struct JobView<'a> {
    name: &'a str,
    tasks: &'a [String],
    status: JobStatus,
    last_run: Option<DateTime<Utc>>,
    next_run_id: RunId,
    runs: usize,
}

impl<'a> From<&'a Job> for JobView<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            name: job.name(),
            tasks: job.tasks(),
            status: job.status(),
            last_run: job.last_run(),
            next_run_id: job.next_run_id(),
            runs: job.runs().len(),
        }
    }
}

#[derive(Serialize)]
struct TaskView<'a> {
    name: &'a str,
    #[serde(flatten)]
    task: &'a Task,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error: failed to render JSON: {}", e),
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn print_jobs(jobs: &[Job], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let views: Vec<JobView> = jobs.iter().map(JobView::from).collect();
            print_json(&views);
        }
        OutputFormat::Text => {
            if jobs.is_empty() {
                println!("No jobs defined.");
                return;
            }
            println!("{:<24} {:>5}  {:<8} {}", "NAME", "TASKS", "STATUS", "LAST RUN");
            for job in jobs {
                println!(
                    "{:<24} {:>5}  {:<8} {}",
                    job.name(),
                    job.tasks().len(),
                    job.status(),
                    format_time(job.last_run())
                );
            }
        }
    }
}

pub fn print_job(job: &Job, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&JobView::from(job)),
        OutputFormat::Text => {
            println!("Job:      {}", job.name());
            println!("Status:   {}", job.status());
            println!("Last run: {}", format_time(job.last_run()));
            println!("Tasks:    {}", job.tasks().join(" -> "));
            if job.runs().is_empty() {
                return;
            }
            println!("Runs:");
            for run in job.runs().iter().rev() {
                println!(
                    "  #{:<5} {:<8} {}  ({:.1}s)",
                    run.run_id(),
                    run.status(),
                    format_time(Some(run.started_at())),
                    run.duration().as_secs_f64()
                );
            }
        }
    }
}

pub fn print_run(run: &Run, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(run),
        OutputFormat::Text => {
            println!(
                "Run #{} of '{}': {}",
                run.run_id(),
                run.job_name(),
                run.status()
            );
            println!(
                "Started {}, took {:.1}s",
                format_time(Some(run.started_at())),
                run.duration().as_secs_f64()
            );
            for result in run.task_results() {
                print_task_result(result);
            }
        }
    }
}

fn print_task_result(result: &TaskResult) {
    let code = result
        .exit_code
        .map(|c| format!(" exit={}", c))
        .unwrap_or_default();
    println!(
        "  {:<24} {:<9} {:>7}ms{}",
        result.task,
        result.status,
        result.duration_ms,
        code
    );

    let output = result.output.trim_end();
    if !output.is_empty() {
        for line in output.lines() {
            println!("    | {}", line);
        }
    }
    if let Some(error) = result.error.as_deref().map(str::trim_end) {
        if !error.is_empty() {
            for line in error.lines() {
                println!("    ! {}", line);
            }
        }
    }
}

pub fn print_tasks(tasks: &[Task], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let views: Vec<TaskView> = tasks
                .iter()
                .map(|task| TaskView {
                    name: task.name(),
                    task,
                })
                .collect();
            print_json(&views);
        }
        OutputFormat::Text => {
            if tasks.is_empty() {
                println!("No tasks defined.");
                return;
            }
            for task in tasks {
                let timeout = task
                    .timeout
                    .as_deref()
                    .map(|t| format!(" (timeout {})", t))
                    .unwrap_or_default();
                println!("{:<24} {}{}", task.name(), task.command, timeout);
            }
        }
    }
}

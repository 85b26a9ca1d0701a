use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, TaskerError},
    run::{PendingRun, Run, RunId, TaskOutcome, TaskResult, TaskStatus},
    store::ConfigurationStore,
    task::{Task, Variables, substitute_variables},
    util::{CommandError, resolve_timeout, run_command},
};

/// Receiving side of a stop request. Cloning is cheap; every clone observes
/// the same request.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side of a stop request.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn new() -> (StopHandle, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop is requested. Never resolves if every handle
    /// was dropped without stopping.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Store-level settings a run is executed with, captured when it starts.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub default_timeout: Option<String>,
    pub max_output_bytes: usize,
    pub variables: Variables,
}

/// Runs one task. Errors are faults of the task, not of the run: the run
/// executor turns them into failed task results.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        stop: &mut StopSignal,
    ) -> Result<TaskOutcome>;
}

/// Executes `task.command` through the platform shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        stop: &mut StopSignal,
    ) -> Result<TaskOutcome> {
        let command = substitute_variables(&task.command, &ctx.variables);
        let timeout = resolve_timeout(task.timeout.as_deref(), ctx.default_timeout.as_deref())?;

        debug!(task = task.name(), %command, "spawning task command");

        match run_command(
            &command,
            task.working_dir(),
            timeout,
            ctx.max_output_bytes,
            stop,
        )
        .await
        {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let code = output.status.code();

                if output.status.success() {
                    Ok(TaskOutcome::success(stdout).with_exit_code(code))
                } else {
                    let message = if stderr.trim().is_empty() {
                        format!("exited with {}", output.status)
                    } else {
                        stderr
                    };
                    Ok(TaskOutcome::failure(message)
                        .with_exit_code(code)
                        .with_output(stdout))
                }
            }
            Err(CommandError::Cancelled) => Ok(TaskOutcome::cancelled()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One slot of a run: the referenced name and its definition, if it exists.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub name: String,
    pub task: Option<Task>,
}

/// Everything needed to execute a run, detached from the store.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: RunId,
    pub job_name: String,
    pub steps: Vec<PlannedTask>,
    pub context: Arc<ExecutionContext>,
}

/// Executes a run plan in order, stopping at the first failure.
#[derive(Clone)]
pub struct RunExecutor {
    executor: Arc<dyn TaskExecutor>,
}

impl RunExecutor {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self { executor }
    }

    /// Always returns a finished run. Tasks after a failure are `skipped`;
    /// a stop marks the in-flight task `cancelled`.
    pub async fn execute(&self, plan: RunPlan, stop: StopSignal) -> Run {
        let mut run = PendingRun::start(plan.run_id, plan.job_name.clone());
        let mut halted = false;

        for step in plan.steps {
            if halted {
                debug!(job = %plan.job_name, task = %step.name, "skipping task");
                run.record(TaskResult::skipped(step.name));
                continue;
            }

            let started_at = Utc::now();
            let outcome = if stop.is_stopped() {
                TaskOutcome::cancelled()
            } else {
                match step.task {
                    Some(task) => {
                        self.execute_task(task, Arc::clone(&plan.context), stop.clone())
                            .await
                    }
                    None => TaskOutcome::failure(format!("task '{}' is not defined", step.name)),
                }
            };
            let finished_at = Utc::now();

            if outcome.status != TaskStatus::Success {
                warn!(
                    job = %plan.job_name,
                    task = %step.name,
                    status = ?outcome.status,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "task did not succeed"
                );
                halted = true;
            }

            run.record(TaskResult::finished(
                step.name,
                outcome,
                started_at,
                finished_at,
            ));
        }

        run.finish()
    }

    async fn execute_task(
        &self,
        task: Task,
        context: Arc<ExecutionContext>,
        mut stop: StopSignal,
    ) -> TaskOutcome {
        let executor = Arc::clone(&self.executor);
        let mut task_stop = stop.clone();
        let mut handle = tokio::spawn(async move {
            executor.execute(&task, &context, &mut task_stop).await
        });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(fault)) => TaskOutcome::failure(fault.to_string()),
                Err(e) if e.is_panic() => TaskOutcome::failure("task executor panicked"),
                Err(e) => TaskOutcome::failure(format!("task aborted: {}", e)),
            },
            _ = stop.stopped() => {
                // Wait for the aborted task to drop so its process group is gone.
                handle.abort();
                let _ = handle.await;
                TaskOutcome::cancelled()
            }
        }
    }
}

/// Starts job runs against a store, one run per job at a time.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<ConfigurationStore>,
    executor: RunExecutor,
}

impl JobRunner {
    pub fn new(store: Arc<ConfigurationStore>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            store,
            executor: RunExecutor::new(executor),
        }
    }

    pub fn with_shell(store: Arc<ConfigurationStore>) -> Self {
        Self::new(store, Arc::new(ShellExecutor))
    }

    /// Claims the job and spawns its run. Fails with `AlreadyRunning` when a
    /// run of the same job is in progress.
    pub async fn start(&self, job_name: &str) -> Result<RunHandle> {
        let lease = self.store.begin_run(job_name).await?;
        let run_id = lease.plan.run_id;
        let (stop_handle, stop) = StopHandle::new();

        info!(job = job_name, run_id, "starting run");

        let store = Arc::clone(&self.store);
        let executor = self.executor.clone();
        let join = tokio::spawn(async move {
            let RunLease { plan, guard } = lease;
            let run = executor.execute(plan, stop).await;
            info!(
                job = run.job_name(),
                run_id = run.run_id(),
                status = ?run.status(),
                "run finished"
            );
            let committed = store.finish_run(run).await;
            drop(guard);
            committed
        });

        Ok(RunHandle {
            job_name: job_name.to_string(),
            run_id,
            stop: stop_handle,
            join,
        })
    }

    /// Runs the job to completion.
    pub async fn run(&self, job_name: &str) -> Result<Run> {
        self.start(job_name).await?.wait().await
    }
}

/// Claim on a job's run slot, held for the whole run.
pub(crate) struct RunLease {
    pub(crate) plan: RunPlan,
    pub(crate) guard: tokio::sync::OwnedMutexGuard<()>,
}

/// A run in progress.
pub struct RunHandle {
    job_name: String,
    run_id: RunId,
    stop: StopHandle,
    join: JoinHandle<Result<Run>>,
}

impl RunHandle {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn cancel(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub async fn wait(self) -> Result<Run> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(TaskerError::Internal(format!(
                "run {} of job '{}' was aborted: {}",
                self.run_id, self.job_name, e
            ))),
        }
    }
}

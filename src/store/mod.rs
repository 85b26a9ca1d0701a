//! The configuration store: every job and task, persisted as one document.
//!
//! Mutations run as transactions on a staged copy of the state. The copy is
//! validated, written to disk, and only then swapped in, so a failed write
//! leaves memory and disk agreeing on the previous state. Jobs sit behind
//! `Arc` in the copy; only a job the transaction touches is cloned. All mutations and
//! saves hold the store's write lock; readers never see a half-applied
//! rename.

mod document;

pub use document::Settings;

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::{
    error::{EntityKind, Result, TaskerError},
    execution::{ExecutionContext, PlannedTask, RunLease, RunPlan},
    job::{Job, SortKey, sort_jobs},
    name::{validate_name, validate_variable_name},
    run::Run,
    task::{Task, Variables},
    util::{parse_timeout, write_atomic},
};

use document::{StoreDocument, StoreDocumentRef};

/// How `add` treats an existing entry with the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Fail with `DuplicateName`.
    Create,
    /// Replace the definition. A replaced job keeps its run history.
    Replace,
}

#[derive(Debug, Clone)]
struct JobSlot {
    job: Arc<Job>,
    run_guard: Arc<Mutex<()>>,
}

impl JobSlot {
    fn new(job: Job) -> Self {
        Self {
            job: Arc::new(job),
            run_guard: Arc::new(Mutex::new(())),
        }
    }

    fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_running() {
            Err(TaskerError::AlreadyRunning(self.job.name().to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    settings: Settings,
    variables: BTreeMap<String, String>,
    tasks: HashMap<String, Task>,
    jobs: HashMap<String, JobSlot>,
}

impl StoreState {
    fn from_document(document: StoreDocument) -> Result<Self> {
        validate_settings(&document.config)?;
        for name in document.variables.keys() {
            validate_variable_name(name)?;
        }

        let mut tasks = HashMap::new();
        for (name, mut task) in document.tasks {
            task.name = name;
            task.validate()?;
            tasks.insert(task.name.clone(), task);
        }

        let mut state = StoreState {
            settings: document.config,
            variables: document.variables,
            tasks,
            jobs: HashMap::new(),
        };

        for (name, mut job) in document.jobs {
            job.rename(&name);
            job.validate()?;
            job.repair_run_counter();
            state.check_references(&job)?;
            state.jobs.insert(name, JobSlot::new(job));
        }

        Ok(state)
    }

    fn document(&self) -> StoreDocumentRef<'_> {
        StoreDocumentRef {
            config: &self.settings,
            variables: self
                .variables
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            tasks: self.tasks.iter().map(|(k, t)| (k.as_str(), t)).collect(),
            jobs: self
                .jobs
                .iter()
                .map(|(k, slot)| (k.as_str(), slot.job.as_ref()))
                .collect(),
        }
    }

    fn check_references(&self, job: &Job) -> Result<()> {
        let mut missing: Vec<String> = Vec::new();
        for task in job.tasks() {
            if !self.tasks.contains_key(task) && !missing.contains(task) {
                missing.push(task.clone());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TaskerError::UnknownTask(missing))
        }
    }

    fn slot(&self, name: &str) -> Result<&JobSlot> {
        self.jobs
            .get(name)
            .ok_or_else(|| TaskerError::job_not_found(name))
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut JobSlot> {
        self.jobs
            .get_mut(name)
            .ok_or_else(|| TaskerError::job_not_found(name))
    }
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if let Some(timeout) = &settings.default_timeout {
        parse_timeout(timeout)?;
    }
    if settings.history_limit == Some(0) {
        return Err(TaskerError::Validation(
            "history_limit must be at least 1".to_string(),
        ));
    }
    Ok(())
}

pub struct ConfigurationStore {
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
}

impl ConfigurationStore {
    /// A store that lives only in memory; `save` is a no-op.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Loads the store at `path`. A missing file gives an empty store that
    /// will be created on the first save.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let document = document::parse(&contents)
                    .map_err(|e| TaskerError::persistence(&path, e))?;
                StoreState::from_document(document)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "store file missing, starting empty");
                StoreState::default()
            }
            Err(e) => return Err(TaskerError::persistence(&path, e)),
        };

        info!(
            path = %path.display(),
            jobs = state.jobs.len(),
            tasks = state.tasks.len(),
            "loaded store"
        );

        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the whole store atomically.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.write().await;
        self.persist(&state).await
    }

    pub async fn get_one(&self, name: &str) -> Option<Job> {
        let state = self.state.read().await;
        state.jobs.get(name).map(|slot| Job::clone(&slot.job))
    }

    /// Jobs ordered by `sort` (name when `None`).
    pub async fn get_list(&self, sort: Option<SortKey>, descending: bool) -> Vec<Job> {
        let mut jobs: Vec<Job> = {
            let state = self.state.read().await;
            state.jobs.values().map(|slot| Job::clone(&slot.job)).collect()
        };
        sort_jobs(&mut jobs, sort.unwrap_or_default(), descending);
        jobs
    }

    pub async fn jobs(&self) -> HashMap<String, Job> {
        let state = self.state.read().await;
        state
            .jobs
            .iter()
            .map(|(name, slot)| (name.clone(), Job::clone(&slot.job)))
            .collect()
    }

    pub async fn tasks(&self) -> HashMap<String, Task> {
        self.state.read().await.tasks.clone()
    }

    pub async fn get_task(&self, name: &str) -> Option<Task> {
        self.state.read().await.tasks.get(name).cloned()
    }

    pub async fn task_list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.state.read().await.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.name().cmp(b.name()));
        tasks
    }

    pub async fn settings(&self) -> Settings {
        self.state.read().await.settings.clone()
    }

    pub async fn is_running(&self, name: &str) -> bool {
        let state = self.state.read().await;
        state.jobs.get(name).is_some_and(JobSlot::is_running)
    }

    pub async fn set_settings(&self, settings: Settings) -> Result<()> {
        validate_settings(&settings)?;
        self.transact(|state| {
            state.settings = settings;
            Ok(())
        })
        .await
    }

    pub async fn set_variable(&self, name: &str, value: impl Into<String>) -> Result<()> {
        validate_variable_name(name)?;
        let value = value.into();
        self.transact(|state| {
            state.variables.insert(name.to_string(), value);
            Ok(())
        })
        .await
    }

    pub async fn add(&self, job: Job, mode: AddMode) -> Result<()> {
        job.validate()?;
        let name = job.name().to_string();

        self.transact(|state| {
            state.check_references(&job)?;

            match state.jobs.get_mut(&name) {
                Some(_) if mode == AddMode::Create => Err(TaskerError::duplicate_job(&name)),
                Some(slot) => {
                    slot.ensure_idle()?;
                    let mut job = job;
                    job.inherit_history(&slot.job);
                    slot.job = Arc::new(job);
                    Ok(())
                }
                None => {
                    state.jobs.insert(name.clone(), JobSlot::new(job));
                    Ok(())
                }
            }
        })
        .await?;

        info!(job = %name, ?mode, "job saved");
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<Job> {
        let removed = self
            .transact(|state| {
                state.slot(name)?.ensure_idle()?;
                state
                    .jobs
                    .remove(name)
                    .map(|slot| Arc::unwrap_or_clone(slot.job))
                    .ok_or_else(|| TaskerError::job_not_found(name))
            })
            .await?;

        info!(job = name, "job removed");
        Ok(removed)
    }

    /// Re-keys a job. Fails without changes when `new_name` is taken or the
    /// job is running.
    pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        validate_name(new_name)?;

        self.transact(|state| {
            state.slot(old_name)?.ensure_idle()?;
            if old_name == new_name {
                return Ok(());
            }
            if state.jobs.contains_key(new_name) {
                return Err(TaskerError::duplicate_job(new_name));
            }

            let mut slot = state
                .jobs
                .remove(old_name)
                .ok_or_else(|| TaskerError::job_not_found(old_name))?;
            Arc::make_mut(&mut slot.job).rename(new_name);
            state.jobs.insert(new_name.to_string(), slot);
            Ok(())
        })
        .await?;

        info!(from = old_name, to = new_name, "job renamed");
        Ok(())
    }

    /// Replaces a job's task list. An unknown name fails the whole update.
    pub async fn update_tasks<I, S>(&self, name: &str, tasks: I) -> Result<Job>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tasks: Vec<String> = tasks.into_iter().map(Into::into).collect();

        let job = self
            .transact(|state| {
                let StoreState {
                    tasks: known, jobs, ..
                } = state;
                let slot = jobs
                    .get_mut(name)
                    .ok_or_else(|| TaskerError::job_not_found(name))?;
                Arc::make_mut(&mut slot.job)
                    .update_tasks(tasks, |task| known.contains_key(task))?;
                Ok(Job::clone(&slot.job))
            })
            .await?;

        info!(job = name, tasks = ?job.tasks(), "job tasks updated");
        Ok(job)
    }

    pub async fn add_task(&self, task: Task, mode: AddMode) -> Result<()> {
        task.validate()?;
        let name = task.name().to_string();

        self.transact(|state| {
            if mode == AddMode::Create && state.tasks.contains_key(&name) {
                return Err(TaskerError::DuplicateName {
                    kind: EntityKind::Task,
                    name: name.clone(),
                });
            }
            state.tasks.insert(name.clone(), task);
            Ok(())
        })
        .await?;

        info!(task = %name, ?mode, "task saved");
        Ok(())
    }

    /// Deletes a task. Refused while any job references it.
    pub async fn remove_task(&self, name: &str) -> Result<Task> {
        let removed = self
            .transact(|state| {
                if !state.tasks.contains_key(name) {
                    return Err(TaskerError::task_not_found(name));
                }

                let mut users: Vec<String> = state
                    .jobs
                    .values()
                    .filter(|slot| slot.job.references(name))
                    .map(|slot| slot.job.name().to_string())
                    .collect();
                if !users.is_empty() {
                    users.sort();
                    return Err(TaskerError::TaskInUse {
                        task: name.to_string(),
                        jobs: users,
                    });
                }

                state
                    .tasks
                    .remove(name)
                    .ok_or_else(|| TaskerError::task_not_found(name))
            })
            .await?;

        info!(task = name, "task removed");
        Ok(removed)
    }

    /// Claims the job's run slot and snapshots what the run will execute.
    pub(crate) async fn begin_run(&self, name: &str) -> Result<RunLease> {
        let state = self.state.read().await;
        let slot = state.slot(name)?;

        let guard = Arc::clone(&slot.run_guard)
            .try_lock_owned()
            .map_err(|_| TaskerError::AlreadyRunning(name.to_string()))?;

        let steps = slot
            .job
            .tasks()
            .iter()
            .map(|task| PlannedTask {
                name: task.clone(),
                task: state.tasks.get(task).cloned(),
            })
            .collect();

        let context = ExecutionContext {
            default_timeout: state.settings.default_timeout.clone(),
            max_output_bytes: state.settings.max_output_bytes,
            variables: Variables::with_builtins(&state.variables),
        };

        Ok(RunLease {
            plan: RunPlan {
                run_id: slot.job.next_run_id(),
                job_name: name.to_string(),
                steps,
                context: Arc::new(context),
            },
            guard,
        })
    }

    /// Appends a finished run to its job's history and persists it.
    pub(crate) async fn finish_run(&self, run: Run) -> Result<Run> {
        let job_name = run.job_name().to_string();
        let run_id = run.run_id();

        let result = self
            .transact(|state| {
                let limit = state.settings.history_limit;
                let slot = state.slot_mut(&job_name)?;
                Arc::make_mut(&mut slot.job).append_run(run.clone(), limit)
            })
            .await;

        if let Err(e) = &result {
            error!(job = %job_name, run_id, "failed to record run: {}", e);
        }

        result.map(|()| run)
    }

    async fn transact<T, F>(&self, apply: F) -> Result<T>
    where
        F: FnOnce(&mut StoreState) -> Result<T>,
    {
        let mut state = self.state.write().await;
        let mut staged = state.clone();
        let value = apply(&mut staged)?;
        self.persist(&staged).await?;
        *state = staged;
        Ok(value)
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let contents =
            document::render(&state.document()).map_err(|e| TaskerError::persistence(path, e))?;

        write_atomic(path, &contents).await.map_err(|e| {
            error!(path = %path.display(), "failed to write store: {}", e);
            TaskerError::persistence(path, e)
        })?;

        debug!(path = %path.display(), bytes = contents.len(), "store written");
        Ok(())
    }
}

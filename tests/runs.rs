use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use tasker::{
    AddMode, ConfigurationStore, ExecutionContext, Job, JobRunner, JobStatus, Result, RunStatus,
    Settings, StopSignal, Task, TaskExecutor, TaskOutcome, TaskStatus, TaskerError,
};
use tokio::sync::Notify;

/// Fails tasks listed in `failing`; tasks listed in `gated` wait for `gate`
/// (or a stop) before succeeding.
#[derive(Default)]
struct FakeExecutor {
    failing: HashSet<&'static str>,
    gated: HashSet<&'static str>,
    gate: Arc<Notify>,
}

#[async_trait]
impl TaskExecutor for FakeExecutor {
    async fn execute(
        &self,
        task: &Task,
        _ctx: &ExecutionContext,
        stop: &mut StopSignal,
    ) -> Result<TaskOutcome> {
        if self.gated.contains(task.name()) {
            tokio::select! {
                _ = self.gate.notified() => {}
                _ = stop.stopped() => return Ok(TaskOutcome::cancelled()),
            }
        }
        if self.failing.contains(task.name()) {
            Ok(TaskOutcome::failure("exit status 1").with_exit_code(Some(1)))
        } else {
            Ok(TaskOutcome::success(format!("{} done", task.name())))
        }
    }
}

async fn store_with(tasks: &[&str], jobs: &[(&str, &[&str])]) -> Arc<ConfigurationStore> {
    let store = ConfigurationStore::in_memory();
    for name in tasks {
        store
            .add_task(Task::new(*name, format!("run {name}")), AddMode::Create)
            .await
            .unwrap();
    }
    for (name, job_tasks) in jobs {
        store
            .add(Job::new(*name).with_tasks(job_tasks.iter().copied()), AddMode::Create)
            .await
            .unwrap();
    }
    Arc::new(store)
}

fn statuses(run: &tasker::Run) -> Vec<(String, TaskStatus)> {
    run.task_results()
        .iter()
        .map(|r| (r.task.clone(), r.status))
        .collect()
}

#[tokio::test]
async fn failure_stops_the_run_and_skips_the_rest() {
    let store = store_with(&["t1", "t2", "t3"], &[("ci", &["t1", "t2", "t3"])]).await;
    let executor = FakeExecutor {
        failing: HashSet::from(["t2"]),
        ..Default::default()
    };
    let runner = JobRunner::new(Arc::clone(&store), Arc::new(executor));

    let run = runner.run("ci").await.unwrap();

    assert_eq!(run.status(), RunStatus::Failure);
    assert_eq!(
        statuses(&run),
        vec![
            ("t1".to_string(), TaskStatus::Success),
            ("t2".to_string(), TaskStatus::Failure),
            ("t3".to_string(), TaskStatus::Skipped),
        ]
    );

    let job = store.get_one("ci").await.unwrap();
    assert_eq!(job.status(), JobStatus::Failure);
    assert_eq!(job.last_run(), Some(run.started_at()));
    assert_eq!(job.get_run(run.run_id()), Some(&run));
}

#[tokio::test]
async fn runs_get_increasing_ids_and_status_follows_latest() {
    let store = store_with(&["t1"], &[("ci", &["t1"])]).await;
    let runner = JobRunner::new(Arc::clone(&store), Arc::new(FakeExecutor::default()));

    let first = runner.run("ci").await.unwrap();
    let second = runner.run("ci").await.unwrap();

    assert_eq!(first.run_id(), 1);
    assert_eq!(second.run_id(), 2);
    assert!(second.is_success());

    let job = store.get_one("ci").await.unwrap();
    assert_eq!(job.status(), JobStatus::Success);
    assert_eq!(job.runs().len(), 2);
    assert_eq!(job.next_run_id(), 3);
}

#[tokio::test]
async fn overlapping_run_of_same_job_is_rejected() {
    let store = store_with(&["slow", "quick"], &[("a", &["slow"]), ("b", &["quick"])]).await;
    let gate = Arc::new(Notify::new());
    let executor = FakeExecutor {
        gated: HashSet::from(["slow"]),
        gate: Arc::clone(&gate),
        ..Default::default()
    };
    let runner = JobRunner::new(Arc::clone(&store), Arc::new(executor));

    let first = runner.start("a").await.unwrap();
    assert!(store.is_running("a").await);

    let second = runner.start("a").await;
    assert!(matches!(second, Err(TaskerError::AlreadyRunning(ref name)) if name == "a"));

    // Other jobs are not blocked by the busy one.
    let other = runner.run("b").await.unwrap();
    assert!(other.is_success());

    gate.notify_one();
    let run = first.wait().await.unwrap();
    assert!(run.is_success());
    assert!(!store.is_running("a").await);

    let job = store.get_one("a").await.unwrap();
    assert_eq!(job.runs().len(), 1);
    assert_eq!(job.runs()[0].run_id(), 1);
}

#[tokio::test]
async fn simultaneous_starts_produce_one_run() {
    let store = store_with(&["slow"], &[("a", &["slow"])]).await;
    let gate = Arc::new(Notify::new());
    let executor = FakeExecutor {
        gated: HashSet::from(["slow"]),
        gate: Arc::clone(&gate),
        ..Default::default()
    };
    let runner = JobRunner::new(Arc::clone(&store), Arc::new(executor));

    let (left, right) = tokio::join!(runner.start("a"), runner.start("a"));
    let (handle, rejected) = match (left, right) {
        (Ok(handle), Err(err)) | (Err(err), Ok(handle)) => (handle, err),
        _ => panic!("exactly one start must succeed"),
    };
    assert!(matches!(rejected, TaskerError::AlreadyRunning(_)));

    gate.notify_one();
    handle.wait().await.unwrap();
    assert_eq!(store.get_one("a").await.unwrap().runs().len(), 1);
}

#[tokio::test]
async fn cancelling_marks_in_flight_task_cancelled() {
    let store = store_with(&["t1", "slow", "t3"], &[("ci", &["t1", "slow", "t3"])]).await;
    let executor = FakeExecutor {
        gated: HashSet::from(["slow"]),
        ..Default::default()
    };
    let runner = JobRunner::new(Arc::clone(&store), Arc::new(executor));

    let handle = runner.start("ci").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let run = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled run finishes")
        .unwrap();

    assert_eq!(run.status(), RunStatus::Failure);
    assert_eq!(
        statuses(&run),
        vec![
            ("t1".to_string(), TaskStatus::Success),
            ("slow".to_string(), TaskStatus::Cancelled),
            ("t3".to_string(), TaskStatus::Skipped),
        ]
    );
    assert_eq!(store.get_one("ci").await.unwrap().status(), JobStatus::Failure);
    assert!(!store.is_running("ci").await);
}

#[tokio::test]
async fn running_unknown_job_is_not_found() {
    let store = store_with(&[], &[]).await;
    let runner = JobRunner::new(store, Arc::new(FakeExecutor::default()));
    assert!(matches!(
        runner.run("ghost").await,
        Err(TaskerError::NotFound { .. })
    ));
}

#[tokio::test]
async fn job_with_no_tasks_succeeds() {
    let store = store_with(&[], &[("empty", &[])]).await;
    let runner = JobRunner::new(Arc::clone(&store), Arc::new(FakeExecutor::default()));

    let run = runner.run("empty").await.unwrap();
    assert!(run.is_success());
    assert!(run.task_results().is_empty());
}

#[tokio::test]
async fn history_limit_trims_old_runs() {
    let store = store_with(&["t1"], &[("ci", &["t1"])]).await;
    store
        .set_settings(Settings {
            history_limit: Some(2),
            ..Settings::default()
        })
        .await
        .unwrap();
    let runner = JobRunner::new(Arc::clone(&store), Arc::new(FakeExecutor::default()));

    for _ in 0..4 {
        runner.run("ci").await.unwrap();
    }

    let job = store.get_one("ci").await.unwrap();
    let ids: Vec<u64> = job.runs().iter().map(|r| r.run_id()).collect();
    assert_eq!(ids, vec![3, 4]);
    assert_eq!(job.next_run_id(), 5);
}

#[tokio::test]
async fn duplicate_task_references_run_each_time() {
    let store = store_with(&["t1", "t2"], &[("ci", &["t1", "t2", "t1"])]).await;
    let runner = JobRunner::new(Arc::clone(&store), Arc::new(FakeExecutor::default()));

    let run = runner.run("ci").await.unwrap();
    let names: Vec<&str> = run.task_results().iter().map(|r| r.task.as_str()).collect();
    assert_eq!(names, vec!["t1", "t2", "t1"]);
}

#[cfg(unix)]
#[tokio::test]
async fn shell_runner_uses_store_variables() {
    let store = ConfigurationStore::in_memory();
    store.set_variable("GREETING", "hi").await.unwrap();
    store
        .add_task(Task::new("say", "echo ${GREETING} there"), AddMode::Create)
        .await
        .unwrap();
    store
        .add_task(Task::new("fail", "exit 4"), AddMode::Create)
        .await
        .unwrap();
    store
        .add(Job::new("hello").with_tasks(["say", "fail", "say"]), AddMode::Create)
        .await
        .unwrap();
    let runner = JobRunner::with_shell(Arc::new(store));

    let run = runner.run("hello").await.unwrap();

    let results = run.task_results();
    assert_eq!(results[0].status, TaskStatus::Success);
    assert_eq!(results[0].output.trim(), "hi there");
    assert_eq!(results[1].status, TaskStatus::Failure);
    assert_eq!(results[1].exit_code, Some(4));
    assert_eq!(results[2].status, TaskStatus::Skipped);
}

#[cfg(target_os = "linux")]
fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.trim_start().chars().next())
            == Some('Z'),
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn cancelled_shell_run_leaves_no_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("sleeper.pid");

    let store = ConfigurationStore::in_memory();
    store
        .add_task(
            Task::new(
                "nap",
                format!("sleep 30 & echo $! > '{}'; wait; true", pid_file.display()),
            ),
            AddMode::Create,
        )
        .await
        .unwrap();
    store
        .add(Job::new("naps").with_tasks(["nap"]), AddMode::Create)
        .await
        .unwrap();
    let store = Arc::new(store);
    let runner = JobRunner::with_shell(Arc::clone(&store));

    let handle = runner.start("naps").await.unwrap();
    let mut pid = None;
    for _ in 0..100 {
        if let Some(found) = std::fs::read_to_string(&pid_file)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok())
        {
            pid = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let pid = pid.expect("task wrote the sleeper pid");

    handle.cancel();
    let run = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled run finishes")
        .unwrap();
    assert_eq!(run.task_results()[0].status, TaskStatus::Cancelled);

    let mut gone = false;
    for _ in 0..50 {
        if process_gone(pid) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "sleep {pid} survived the cancelled run");
}

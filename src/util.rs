use std::{
    io::Error as IoError,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command as TokioCommand};

use crate::error::{Result, TaskerError};
use crate::execution::StopSignal;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command execution error: {0}")]
    Io(#[from] IoError),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Command cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Parses a humantime duration. `"0"` and `""` mean "no timeout".
pub fn parse_timeout(timeout: &str) -> Result<Option<Duration>> {
    if timeout == "0" || timeout.is_empty() {
        return Ok(None);
    }

    timeout
        .parse::<humantime::Duration>()
        .map(|duration| Some(duration.into()))
        .map_err(|e| {
            TaskerError::Validation(format!(
                "invalid timeout '{}': {} (use a duration like '5m', '30s', '1h30m')",
                timeout, e
            ))
        })
}

pub fn resolve_timeout(
    task_timeout: Option<&str>,
    default_timeout: Option<&str>,
) -> Result<Option<Duration>> {
    match task_timeout.or(default_timeout) {
        Some(timeout) => parse_timeout(timeout),
        None => Ok(None),
    }
}

/// Runs `command` through the platform shell in its own process group.
///
/// The timeout and `stop` cover the whole command, including draining its
/// pipes, so a backgrounded descendant holding stdout cannot keep it alive.
/// On timeout, stop, or when the returned future is dropped, the entire
/// group is killed.
pub async fn run_command(
    command: &str,
    working_dir: Option<&Path>,
    timeout: Option<Duration>,
    max_output_bytes: usize,
    stop: &mut StopSignal,
) -> std::result::Result<CommandOutput, CommandError> {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = TokioCommand::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = TokioCommand::new("sh");
        c.args(["-c", command]);
        c
    };

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let mut group = ProcessGroup::new(child.id());

    let stdout_handle = tokio::spawn(collect_tail(child.stdout.take(), max_output_bytes));
    let stderr_handle = tokio::spawn(collect_tail(child.stderr.take(), max_output_bytes));
    let readers = [stdout_handle.abort_handle(), stderr_handle.abort_handle()];

    let deadline = async {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    let completed = async {
        let status = child.wait().await?;
        let stdout = join_reader(stdout_handle).await?;
        let stderr = join_reader(stderr_handle).await?;
        Ok::<_, CommandError>(CommandOutput {
            status,
            stdout,
            stderr,
        })
    };

    let interrupted = tokio::select! {
        result = completed => {
            group.disarm();
            return result;
        }
        _ = deadline => {
            // timeout is Some here: the pending branch never completes.
            CommandError::Timeout(timeout.unwrap_or_default())
        }
        _ = stop.stopped() => CommandError::Cancelled,
    };

    terminate(&mut child, &mut group).await;
    for reader in readers {
        reader.abort();
    }
    Err(interrupted)
}

/// Kills the process group of a spawned command unless disarmed.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self { leader }
    }

    fn disarm(&mut self) {
        self.leader = None;
    }

    fn kill(&mut self) {
        if let Some(leader) = self.leader.take() {
            kill_group(leader);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(leader: u32) {
    let Ok(pgid) = libc::pid_t::try_from(leader) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        let err = IoError::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, "failed to kill process group: {}", err);
        }
    }
}

// Without process groups only the shell itself is killed, via `kill_on_drop`.
#[cfg(not(unix))]
fn kill_group(_leader: u32) {}

/// Kills the whole group, then the shell, and reaps it.
async fn terminate(child: &mut Child, group: &mut ProcessGroup) {
    group.kill();
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    if let Err(kill_err) = child.kill().await {
        tracing::warn!("failed to kill interrupted process: {}", kill_err);
    }
}

async fn collect_tail<R>(
    pipe: Option<R>,
    max_bytes: usize,
) -> std::result::Result<Vec<u8>, CommandError>
where
    R: AsyncRead + Unpin,
{
    let mut collected: Vec<u8> = Vec::new();
    let Some(mut pipe) = pipe else {
        return Ok(collected);
    };

    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if collected.len() > max_bytes {
            let excess = collected.len() - max_bytes;
            collected.drain(..excess);
        }
    }

    Ok(collected)
}

async fn join_reader(
    handle: tokio::task::JoinHandle<std::result::Result<Vec<u8>, CommandError>>,
) -> std::result::Result<Vec<u8>, CommandError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(CommandError::Io(IoError::other(e))),
    }
}

/// Replaces `path` with `contents` via a sibling temp file, so readers see
/// either the old document or the new one.
pub async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path.file_name().ok_or_else(|| {
        IoError::new(std::io::ErrorKind::InvalidInput, "path has no file name")
    })?;

    tokio::fs::create_dir_all(dir).await?;

    let tmp_path = dir.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    let written = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("30s", Some(Duration::from_secs(30)))]
    #[case("1h30m", Some(Duration::from_secs(5400)))]
    #[case("0", None)]
    #[case("", None)]
    fn parses_timeouts(#[case] input: &str, #[case] expected: Option<Duration>) {
        assert_eq!(parse_timeout(input).unwrap(), expected);
    }

    #[test]
    fn rejects_garbage_timeout() {
        assert!(matches!(
            parse_timeout("soon"),
            Err(TaskerError::Validation(_))
        ));
    }

    #[test]
    fn task_timeout_wins_over_default() {
        let timeout = resolve_timeout(Some("5s"), Some("1m")).unwrap();
        assert_eq!(timeout, Some(Duration::from_secs(5)));

        let timeout = resolve_timeout(None, Some("1m")).unwrap();
        assert_eq!(timeout, Some(Duration::from_secs(60)));

        assert_eq!(resolve_timeout(None, None).unwrap(), None);
    }

    #[tokio::test]
    async fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");

        write_atomic(&path, "first").await.unwrap();
        write_atomic(&path, "second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_tail() {
        let (_handle, mut stop) = crate::execution::StopHandle::new();
        let output = run_command("printf 'abcdefgh'", None, None, 4, &mut stop)
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"efgh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn times_out_long_commands() {
        let (_handle, mut stop) = crate::execution::StopHandle::new();
        let err = run_command(
            "sleep 5",
            None,
            Some(Duration::from_millis(50)),
            1024,
            &mut stop,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_covers_descendants_holding_output() {
        let (_handle, mut stop) = crate::execution::StopHandle::new();
        let started = std::time::Instant::now();
        let err = run_command(
            "sleep 3 & echo hi",
            None,
            Some(Duration::from_millis(200)),
            1024,
            &mut stop,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    /// A zombie waiting for its reaper counts as gone.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => {
                let state = stat
                    .rsplit(')')
                    .next()
                    .and_then(|rest| rest.trim_start().chars().next());
                state != Some('Z')
            }
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..50 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    async fn read_pid(path: &Path) -> u32 {
        for _ in 0..100 {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    #[cfg(target_os = "linux")]
    fn background_sleeper(pid_file: &Path) -> String {
        format!("sleep 30 & echo $! > '{}'; wait", pid_file.display())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stop_kills_the_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleeper.pid");
        let command = background_sleeper(&pid_file);
        let (handle, mut stop) = crate::execution::StopHandle::new();

        let running =
            tokio::spawn(async move { run_command(&command, None, None, 1024, &mut stop).await });
        let pid = read_pid(&pid_file).await;
        handle.stop();

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Cancelled));
        assert!(wait_until_gone(pid).await, "sleep {pid} outlived the stop");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_the_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleeper.pid");
        let (_handle, mut stop) = crate::execution::StopHandle::new();

        let err = run_command(
            &background_sleeper(&pid_file),
            None,
            Some(Duration::from_millis(300)),
            1024,
            &mut stop,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));

        let pid = read_pid(&pid_file).await;
        assert!(wait_until_gone(pid).await, "sleep {pid} outlived the timeout");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_the_command_kills_its_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleeper.pid");
        let command = background_sleeper(&pid_file);
        let (_handle, mut stop) = crate::execution::StopHandle::new();

        let running =
            tokio::spawn(async move { run_command(&command, None, None, 1024, &mut stop).await });
        let pid = read_pid(&pid_file).await;
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());

        assert!(wait_until_gone(pid).await, "sleep {pid} outlived the dropped command");
    }
}

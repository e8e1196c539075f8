//! Spawns shell commands, captures their output, supervises daemons by log
//! condition, and kills process trees.

use std::{
    collections::HashMap,
    pin::Pin,
    process::Stdio as StdStdio,
    sync::Arc,
    time::{Duration, Instant},
};

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
#[cfg(not(unix))]
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command as TokioCommand},
    sync::Mutex,
};
use tracing::{debug, instrument, warn};

use crate::{
    cache::CommandResult,
    error::{DaemonError, ProcessError},
    manifest::{ConditionKind, LogCondition, Stdio},
    path::AbsDirPath,
    plan::StdioMode,
};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// The result of successfully supervising a daemon to readiness.
///
/// The daemon process is still running when this is returned. `handle` is
/// its PID, kept registered under `(workspace, target)` in the
/// [`ProcessRegistry`] so a later [`ProcessRegistry::kill`] can still reach
/// it (watch-mode interruption, port release on rebuild).
#[derive(Debug)]
pub struct DaemonResult {
    pub handle: u32,
    pub started_at: Instant,
    pub took: Duration,
}

/// A live handle on one spawned child, enough to kill its whole process tree.
struct ProcessHandle {
    child: Mutex<Option<Child>>,
    pid: u32,
}

/// Tracks in-flight child processes by `(workspace, target)` so external
/// callers (watch-mode interruption, `unwatch`) can kill them without going
/// through the scheduler's event loop.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    handles: Arc<DashMap<(String, String), Vec<Arc<ProcessHandle>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, workspace: &str, target: &str, handle: Arc<ProcessHandle>) {
        self.handles
            .entry((workspace.to_string(), target.to_string()))
            .or_default()
            .push(handle);
    }

    fn unregister(&self, workspace: &str, target: &str, pid: u32) {
        let key = (workspace.to_string(), target.to_string());
        if let Some(mut entries) = self.handles.get_mut(&key) {
            entries.retain(|h| h.pid != pid);
        }
    }

    /// Kill every in-flight process tree for `(workspace, target)`.
    #[instrument(skip(self))]
    pub async fn kill(&self, workspace: &str, target: &str, release_ports: &[u16]) -> Result<()> {
        let key = (workspace.to_string(), target.to_string());
        let handles = self.handles.remove(&key).map(|(_, v)| v).unwrap_or_default();
        for handle in handles {
            kill_tree(&handle, release_ports).await?;
        }
        Ok(())
    }
}

/// Runs shell commands on behalf of the scheduler.
#[derive(Clone)]
pub struct ProcessRunner {
    registry: ProcessRegistry,
}

impl ProcessRunner {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self { registry }
    }

    fn build_command(
        workspace_root: &AbsDirPath,
        command: &str,
        env: &HashMap<String, String>,
        stdio: StdioMode,
    ) -> TokioCommand {
        let mut cmd = TokioCommand::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(workspace_root.as_std_path())
            .env("FORCE_COLOR", "2")
            .envs(env)
            .stdin(StdStdio::null());
        match stdio {
            StdioMode::Capture => {
                cmd.stdout(StdStdio::piped()).stderr(StdStdio::piped());
            }
            StdioMode::Inherit => {
                cmd.stdout(StdStdio::inherit()).stderr(StdStdio::inherit());
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }
        cmd
    }

    /// Run a single non-daemon command to completion. Output is captured
    /// unless `stdio` is [`StdioMode::Inherit`], in which case the child's
    /// stdio is connected directly to this process's own.
    #[instrument(skip(self, env))]
    pub async fn run(
        &self,
        workspace: &str,
        target: &str,
        workspace_root: &AbsDirPath,
        command: &str,
        env: &HashMap<String, String>,
        stdio: StdioMode,
    ) -> Result<CommandResult, ProcessError> {
        let start = Instant::now();
        let mut child = Self::build_command(workspace_root, command, env, stdio)
            .spawn()
            .map_err(|err| ProcessError::SpawnFailed {
                command: command.to_string(),
                source: color_eyre::Report::new(err),
            })?;

        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out_task = tokio::spawn(read_all(stdout));
        let err_task = tokio::spawn(read_all(stderr));

        let handle = Arc::new(ProcessHandle {
            child: Mutex::new(Some(child)),
            pid,
        });
        self.registry.register(workspace, target, handle.clone());

        let status = {
            let mut guard = handle.child.lock().await;
            let child = guard.as_mut().expect("child present until reaped");
            child.wait().await
        };
        self.registry.unregister(workspace, target, pid);

        let status = status.map_err(|err| ProcessError::SpawnFailed {
            command: command.to_string(),
            source: color_eyre::Report::new(err),
        })?;
        let stdout = out_task.await.unwrap_or_default();
        let stderr = err_task.await.unwrap_or_default();
        let combined = interleave(&stdout, &stderr);
        let code = status.code().unwrap_or(-1);

        if code != 0 {
            return Err(ProcessError::Exit {
                command: command.to_string(),
                code,
                stdout,
                stderr,
            });
        }

        Ok(CommandResult {
            command: command.to_string(),
            exit_code: code,
            stdout,
            stderr,
            combined,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Supervise a command as a daemon, racing its [`LogCondition`]s and a
    /// crash watcher against each other until one resolves. Daemon stdio is
    /// always captured, regardless of the caller's `stdio` preference,
    /// because readiness is determined by reading its log lines.
    #[instrument(skip(self, env, conditions))]
    pub async fn run_daemon(
        &self,
        workspace: &str,
        target: &str,
        workspace_root: &AbsDirPath,
        command: &str,
        env: &HashMap<String, String>,
        conditions: &[LogCondition],
    ) -> Result<DaemonResult, DaemonError> {
        let started_at = Instant::now();
        let mut child = Self::build_command(workspace_root, command, env, StdioMode::Capture)
            .spawn()
            .map_err(|err| DaemonError::Crashed {
                status: format!("failed to spawn: {err}"),
            })?;

        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<(Stdio, String)>();
        spawn_line_reader(stdout, Stdio::Stdout, line_tx.clone());
        spawn_line_reader(stderr, Stdio::Stderr, line_tx);

        let handle = Arc::new(ProcessHandle {
            child: Mutex::new(Some(child)),
            pid,
        });
        self.registry.register(workspace, target, handle.clone());

        let mut timers: HashMap<usize, Pin<Box<tokio::time::Sleep>>> = conditions
            .iter()
            .enumerate()
            .map(|(i, c)| (i, Box::pin(tokio::time::sleep(Duration::from_millis(c.timeout_ms)))))
            .collect();

        let result = loop {
            let wait_fut = async {
                let mut guard = handle.child.lock().await;
                let child = guard.as_mut().expect("child present until reaped");
                child.wait().await
            };

            tokio::select! {
                biased;

                Some((stdio, line)) = line_rx.recv() => {
                    debug!(?stdio, %line, "daemon log line");
                    let matched = conditions.iter().find(|c| {
                        (c.stdio == Stdio::All || c.stdio == stdio) && c.matches(&line)
                    });
                    if let Some(condition) = matched {
                        match condition.kind {
                            ConditionKind::Success => break Ok(DaemonResult {
                                handle: pid,
                                started_at,
                                took: started_at.elapsed(),
                            }),
                            ConditionKind::Failure => break Err(DaemonError::Failure {
                                condition: condition.clone(),
                            }),
                        }
                    }
                }

                status = wait_fut => {
                    // The process has already exited, so there's nothing
                    // left for a later kill() to reach.
                    self.registry.unregister(workspace, target, pid);
                    let status = status.map_err(|err| DaemonError::Crashed {
                        status: format!("wait failed: {err}"),
                    })?;
                    break Err(DaemonError::Crashed { status: status.to_string() });
                }

                fired = fire_any(&mut timers) => {
                    match fired.and_then(|idx| conditions.get(idx)) {
                        Some(condition) => break Err(DaemonError::Timeout {
                            condition: condition.clone(),
                            timeout_ms: condition.timeout_ms,
                        }),
                        None => break Err(DaemonError::Crashed {
                            status: "no conditions configured".to_string(),
                        }),
                    }
                }
            }
        };

        // Success, Failure, and Timeout all leave the daemon registered: the
        // process may still be running. Only the crashed arm above, which
        // confirmed exit via wait(), unregisters.
        result
    }
}

async fn fire_any(timers: &mut HashMap<usize, Pin<Box<tokio::time::Sleep>>>) -> Option<usize> {
    if timers.is_empty() {
        std::future::pending::<()>().await;
    }
    let indices: Vec<usize> = timers.keys().copied().collect();
    let sleeps = indices.iter().map(|i| timers.get_mut(i).expect("key present"));
    let (_, fired, _) = futures::future::select_all(sleeps).await;
    let fired_idx = indices[fired];
    timers.remove(&fired_idx);
    Some(fired_idx)
}

fn spawn_line_reader(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    stdio: Stdio,
    tx: tokio::sync::mpsc::UnboundedSender<(Stdio, String)>,
) {
    let Some(stream) = stream else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stdio, line)).is_err() {
                break;
            }
        }
    });
}

async fn read_all(stream: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(stream) = stream else {
        return String::new();
    };
    let mut lines = BufReader::new(stream).lines();
    let mut buf = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        buf.push_str(&line);
        buf.push('\n');
    }
    buf
}

fn interleave(stdout: &str, stderr: &str) -> String {
    let mut combined = String::with_capacity(stdout.len() + stderr.len());
    combined.push_str(stdout);
    combined.push_str(stderr);
    combined
}

/// Graceful-then-forceful kill of a process tree: `SIGTERM` to the process
/// group, a grace period, then a port-release check before escalating to
/// `SIGKILL` of every descendant.
#[instrument(skip(handle))]
async fn kill_tree(handle: &ProcessHandle, release_ports: &[u16]) -> Result<()> {
    let pid = handle.pid;
    if pid == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    {
        // Safety: killpg with a negative PGID targets the whole group; this
        // process set its own PGID to its PID at spawn time (see
        // `ProcessRunner::build_command`).
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        kill_descendants_sysinfo(pid, Signal::Term);
    }

    tokio::time::sleep(DEFAULT_GRACE_PERIOD).await;

    let ports_still_bound = release_ports
        .iter()
        .any(|port| std::net::TcpListener::bind(("127.0.0.1", *port)).is_err());

    let mut guard = handle.child.lock().await;
    let exited = guard
        .as_mut()
        .map(|child| child.try_wait().ok().flatten().is_some())
        .unwrap_or(true);

    if !exited || ports_still_bound {
        warn!(pid, "process tree did not release in time, forcing kill");
        #[cfg(unix)]
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        kill_descendants_sysinfo(pid, Signal::Kill);

        if let Some(child) = guard.as_mut() {
            let _ = child.wait().await;
        }
    }

    Ok(())
}

#[cfg(not(unix))]
fn kill_descendants_sysinfo(root_pid: u32, signal: Signal) {
    let mut system = System::new_with_specifics(
        RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
    );
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let root = Pid::from_u32(root_pid);
    let mut to_kill = vec![root];
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        for (candidate, process) in system.processes() {
            if process.parent() == Some(pid) && !to_kill.contains(candidate) {
                to_kill.push(*candidate);
                frontier.push(*candidate);
            }
        }
    }

    for pid in to_kill {
        if let Some(process) = system.process(pid) {
            let _ = process.kill_with(signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn successful_command_captures_stdout() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let runner = ProcessRunner::new(ProcessRegistry::new());

        let result = runner
            .run("ws", "build", &root, "echo hello", &HashMap::new(), StdioMode::Capture)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_process_error() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let runner = ProcessRunner::new(ProcessRegistry::new());

        let err = runner
            .run("ws", "build", &root, "exit 3", &HashMap::new(), StdioMode::Capture)
            .await
            .unwrap_err();
        match err {
            ProcessError::Exit { code, .. } => assert_eq!(code, 3),
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn env_overrides_are_visible_to_the_command() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let runner = ProcessRunner::new(ProcessRegistry::new());
        let mut env = HashMap::new();
        env.insert("TRESTLE_TEST_VAR".to_string(), "hi-from-env".to_string());

        let result = runner
            .run("ws", "build", &root, "echo $TRESTLE_TEST_VAR", &env, StdioMode::Capture)
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "hi-from-env");
    }
}

//! Process supervisor: daemon spawn, PID-file lifecycle, signal-escalated
//! termination, and a Linux-only lease reaper.

mod pid;
mod platform;
mod reaper;

pub use pid::{PidFile, PidFileError};
pub use platform::is_alive;
pub use reaper::{reap_lease, ReaperError};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use asd_readiness::{PollPolicy, ReadinessProbe};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("binary not found on PATH: {0}")]
    BinaryNotFound(String),
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open log file {0}: {1}")]
    LogFile(PathBuf, std::io::Error),
    #[error(transparent)]
    PidFile(#[from] PidFileError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Retry behavior for a readiness timeout during warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry exactly once, with `Never` for the retry itself.
    OnFailure,
    Never,
}

/// Declares how to spawn and supervise one daemon.
pub struct DaemonSpec {
    pub binary: PathBuf,
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub readiness: Option<Box<dyn ReadinessProbe>>,
    pub readiness_policy: PollPolicy,
    pub min_uptime: Duration,
    pub retry_policy: RetryPolicy,
    /// Startup grace period before the first liveness check.
    pub startup_grace: Duration,
}

/// Outcome of one [`spawn_daemon`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonOutcome {
    /// A live PID was already recorded in the PID-file.
    AlreadyRunning { pid: u32 },
    /// Spawned and alive. `ready` is `false` when readiness never converged
    /// (a valid terminal status — "started" does not imply "ready").
    Started { pid: u32, ready: bool },
    /// The binary exited (or never lived) before warmup completed.
    Failed { reason: String },
}

/// Run the daemon contract in spec.md §4.3: reclaim a stale PID-file,
/// resolve the binary, spawn detached with its own process group, record
/// the PID, verify liveness, then evaluate readiness with at most one
/// retry.
pub async fn spawn_daemon(spec: DaemonSpec, cancel: &CancellationToken) -> Result<DaemonOutcome> {
    if let Some(pid) = PidFile::read_live(&spec.pid_file)? {
        return Ok(DaemonOutcome::AlreadyRunning { pid });
    }
    PidFile::remove_stale(&spec.pid_file)?;

    spawn_once(&spec, cancel).await
}

async fn spawn_once(spec: &DaemonSpec, cancel: &CancellationToken) -> Result<DaemonOutcome> {
    let binary = resolve_binary(&spec.binary)?;

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_file)
        .map_err(|e| SupervisorError::LogFile(spec.log_file.clone(), e))?;
    let log_err = log
        .try_clone()
        .map_err(|e| SupervisorError::LogFile(spec.log_file.clone(), e))?;

    let mut cmd = tokio::process::Command::new(&binary);
    cmd.args(&spec.argv)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(false);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    platform::detach_process_group(&mut cmd);

    let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        binary: binary.clone(),
        source,
    })?;
    let pid = child.id().expect("freshly spawned child has a pid");
    // The child outlives this call: forget the handle so dropping it does
    // not reap or signal the process.
    std::mem::forget(child);

    PidFile::write(&spec.pid_file, pid)?;

    tokio::time::sleep(spec.startup_grace).await;

    if !platform::is_alive(pid) {
        PidFile::remove(&spec.pid_file)?;
        return Ok(DaemonOutcome::Failed {
            reason: "process exited during startup grace period".to_string(),
        });
    }

    let started_at = tokio::time::Instant::now();

    let ready = match &spec.readiness {
        Some(probe) => probe.wait(spec.readiness_policy, cancel).await,
        None => true,
    };

    if ready {
        return Ok(DaemonOutcome::Started { pid, ready: true });
    }

    let alive = platform::is_alive(pid);
    let under_min_uptime = started_at.elapsed() < spec.min_uptime;

    if alive {
        // Readiness never converged but the process is still running:
        // a valid terminal status per the design notes.
        return Ok(DaemonOutcome::Started { pid, ready: false });
    }

    // Process exited: treat as a crash during warmup.
    PidFile::remove(&spec.pid_file)?;

    if spec.retry_policy == RetryPolicy::OnFailure && under_min_uptime {
        let retry_spec = DaemonSpec {
            binary: spec.binary.clone(),
            argv: spec.argv.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            pid_file: spec.pid_file.clone(),
            log_file: spec.log_file.clone(),
            readiness: None, // readiness probe is not Clone; retry skips the wait below
            readiness_policy: spec.readiness_policy,
            min_uptime: spec.min_uptime,
            retry_policy: RetryPolicy::Never,
            startup_grace: spec.startup_grace,
        };
        return Box::pin(retry_with_readiness(retry_spec, spec, cancel)).await;
    }

    Ok(DaemonOutcome::Failed {
        reason: "process exited before readiness converged".to_string(),
    })
}

/// Helper: the single retry needs the *original* readiness probe (trait
/// objects aren't `Clone`), so we re-borrow it from `original`.
async fn retry_with_readiness(
    mut retry_spec: DaemonSpec,
    original: &DaemonSpec,
    cancel: &CancellationToken,
) -> Result<DaemonOutcome> {
    retry_spec.readiness = None;
    let binary = resolve_binary(&retry_spec.binary)?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&retry_spec.log_file)
        .map_err(|e| SupervisorError::LogFile(retry_spec.log_file.clone(), e))?;
    let log_err = log
        .try_clone()
        .map_err(|e| SupervisorError::LogFile(retry_spec.log_file.clone(), e))?;

    let mut cmd = tokio::process::Command::new(&binary);
    cmd.args(&retry_spec.argv)
        .envs(&retry_spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(false);
    if let Some(cwd) = &retry_spec.cwd {
        cmd.current_dir(cwd);
    }
    platform::detach_process_group(&mut cmd);

    let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        binary: binary.clone(),
        source,
    })?;
    let pid = child.id().expect("freshly spawned child has a pid");
    std::mem::forget(child);
    PidFile::write(&retry_spec.pid_file, pid)?;
    tokio::time::sleep(retry_spec.startup_grace).await;

    if !platform::is_alive(pid) {
        PidFile::remove(&retry_spec.pid_file)?;
        return Ok(DaemonOutcome::Failed {
            reason: "retry exited during startup grace period".to_string(),
        });
    }

    let ready = match &original.readiness {
        Some(probe) => probe.wait(retry_spec.readiness_policy, cancel).await,
        None => true,
    };

    if ready || platform::is_alive(pid) {
        Ok(DaemonOutcome::Started { pid, ready })
    } else {
        PidFile::remove(&retry_spec.pid_file)?;
        Ok(DaemonOutcome::Failed {
            reason: "retry exited before readiness converged".to_string(),
        })
    }
}

fn resolve_binary(binary: &std::path::Path) -> Result<PathBuf> {
    if binary.is_absolute() {
        return Ok(binary.to_path_buf());
    }
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(SupervisorError::BinaryNotFound(
        binary.to_string_lossy().to_string(),
    ))
}

/// Two-phase termination: signal the process group (or just the process
/// if `kill_group` is false), wait `gentle`, then escalate to kill.
/// Every underlying syscall tolerates "process already gone" races.
pub async fn terminate(pid: u32, kill_group: bool, gentle: Duration) -> Result<()> {
    platform::terminate_gracefully(pid, kill_group);
    let deadline = tokio::time::Instant::now() + gentle;
    while tokio::time::Instant::now() < deadline {
        if !platform::is_alive(pid) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if platform::is_alive(pid) {
        tracing::warn!(pid, "process ignored graceful termination, escalating to SIGKILL");
        platform::kill_now(pid, kill_group);
    }
    Ok(())
}

/// Run a command in the foreground, forwarding termination signals to its
/// whole process group, streaming stdout/stderr to the parent console and
/// optionally teeing to a log file.
pub async fn run_foreground(
    binary: &std::path::Path,
    argv: &[String],
    env: &HashMap<String, String>,
    tee_log: Option<&std::path::Path>,
) -> Result<std::process::ExitStatus> {
    let mut cmd = tokio::process::Command::new(binary);
    cmd.args(argv).envs(env);
    platform::detach_process_group(&mut cmd);

    let log_file = match tee_log {
        Some(log_path) => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            Some(std::sync::Arc::new(tokio::sync::Mutex::new(
                tokio::fs::File::create(log_path)
                    .await
                    .map_err(|e| SupervisorError::LogFile(log_path.to_path_buf(), e))?,
            )))
        }
        None => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            None
        }
    };

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        binary: binary.to_path_buf(),
        source,
    })?;
    let pid = child.id().unwrap_or(0);

    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(tee_to_console(pipe, log_file.clone(), false)));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(tee_to_console(pipe, log_file.clone(), true)));

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|source| SupervisorError::Spawn { binary: binary.to_path_buf(), source })
        }
        _ = tokio::signal::ctrl_c() => {
            platform::terminate_gracefully(pid, true);
            tokio::time::sleep(Duration::from_secs(5)).await;
            if platform::is_alive(pid) {
                platform::kill_now(pid, true);
            }
            child.wait().await.map_err(|source| SupervisorError::Spawn { binary: binary.to_path_buf(), source })
        }
    };

    if let Some(task) = stdout_task {
        task.await.ok();
    }
    if let Some(task) = stderr_task {
        task.await.ok();
    }

    status
}

/// Copies a piped child stream to the parent's matching console stream
/// and, if a tee log was opened, to it as well — both destinations see
/// the same bytes, in foreground mode neither is exclusive.
async fn tee_to_console<R: tokio::io::AsyncRead + Unpin>(
    mut pipe: R,
    log_file: Option<std::sync::Arc<tokio::sync::Mutex<tokio::fs::File>>>,
    is_stderr: bool,
) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if is_stderr {
            tokio::io::stderr().write_all(&buf[..n]).await.ok();
        } else {
            tokio::io::stdout().write_all(&buf[..n]).await.ok();
        }
        if let Some(log_file) = &log_file {
            log_file.lock().await.write_all(&buf[..n]).await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec(pid_file: PathBuf, log_file: PathBuf) -> DaemonSpec {
        DaemonSpec {
            binary: PathBuf::from("sleep"),
            argv: vec!["2".to_string()],
            env: HashMap::new(),
            cwd: None,
            pid_file,
            log_file,
            readiness: None,
            readiness_policy: PollPolicy::default(),
            min_uptime: Duration::from_millis(100),
            retry_policy: RetryPolicy::Never,
            startup_grace: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn spawns_and_reports_started() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("d.pid");
        let log_file = dir.path().join("d.log");
        let spec = test_spec(pid_file.clone(), log_file);
        let cancel = CancellationToken::new();

        let outcome = spawn_daemon(spec, &cancel).await.unwrap();
        match outcome {
            DaemonOutcome::Started { pid, ready } => {
                assert!(pid > 0);
                assert!(ready);
                terminate(pid, true, Duration::from_millis(200)).await.unwrap();
            }
            other => panic!("expected Started, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_pid_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("d.pid");
        // A PID that is essentially guaranteed not to be alive.
        std::fs::write(&pid_file, "999999").unwrap();

        let spec = test_spec(pid_file.clone(), dir.path().join("d.log"));
        let cancel = CancellationToken::new();
        let outcome = spawn_daemon(spec, &cancel).await.unwrap();
        assert!(matches!(outcome, DaemonOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn live_pid_file_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("d.pid");
        std::fs::write(&pid_file, std::process::id().to_string()).unwrap();

        let spec = test_spec(pid_file.clone(), dir.path().join("d.log"));
        let cancel = CancellationToken::new();
        let outcome = spawn_daemon(spec, &cancel).await.unwrap();
        assert_eq!(
            outcome,
            DaemonOutcome::AlreadyRunning {
                pid: std::process::id()
            }
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = test_spec(dir.path().join("d.pid"), dir.path().join("d.log"));
        spec.binary = PathBuf::from("definitely-not-a-real-binary-xyz");
        let cancel = CancellationToken::new();
        let result = spawn_daemon(spec, &cancel).await;
        assert!(matches!(result, Err(SupervisorError::BinaryNotFound(_))));
    }
}

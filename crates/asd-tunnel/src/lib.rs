//! Tunnel session manager: translates a declared service plus a resolved
//! credential into a supervised SSH reverse-forwarding session, captures
//! the server-assigned public URL from the session transcript, and
//! exposes the degraded/backoff/reconnect state machine described in
//! spec.md §4.5.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use asd_credentials::{CredentialKind, TunnelCredential};
use asd_registry::{ServiceDeclaration, TunnelProtocol};
use asd_supervisor::{DaemonOutcome, DaemonSpec, RetryPolicy};
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The regex the server's "assigned" transcript line is matched against.
const URL_PATTERN: &str = r"https?://\S+\.\S+";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Established,
    Degraded,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    CredentialMissing,
    Spawn,
    ReadinessTimeout,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Supervisor(#[from] asd_supervisor::SupervisorError),
    #[error(transparent)]
    Readiness(#[from] asd_readiness::ReadinessError),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Outcome of one `start_once` attempt. The caller (the reconciler) owns
/// the persistent session state and backoff timing across attempts; this
/// crate only reports what happened on this attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOutcome {
    Established { pid: u32, public_url: String },
    /// Readiness never converged but the ssh process is still alive —
    /// retried indefinitely by the caller with backoff.
    Degraded { pid: u32 },
    Failed { kind: FailureKind, reason: String },
}

/// An SSH invocation ready to hand to the supervisor: binary, argv, and
/// any environment the auth method needs (e.g. `SSHPASS`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCommand {
    pub binary: String,
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Pure function: builds the SSH invocation for one tunnel session. Never
/// touches the filesystem or network, so it's unit-tested without
/// spawning a real `ssh` binary.
pub fn build_ssh_command(
    decl: &ServiceDeclaration,
    credential: &TunnelCredential,
    local_port: u16,
) -> SshCommand {
    let mut argv = vec!["-N".to_string()];

    if credential.kind == CredentialKind::Ephemeral {
        argv.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
        ]);
    }

    let mut env = HashMap::new();
    let binary = match credential.kind {
        CredentialKind::Key => {
            argv.push("-i".to_string());
            argv.push(credential.secret_or_key_ref.clone());
            "ssh".to_string()
        }
        CredentialKind::Token | CredentialKind::Ephemeral => {
            argv.extend([
                "-o".to_string(),
                "PreferredAuthentications=password".to_string(),
                "-o".to_string(),
                "PubkeyAuthentication=no".to_string(),
            ]);
            env.insert("SSHPASS".to_string(), credential.secret_or_key_ref.clone());
            // sshpass reads the env var named by -e and execs the wrapped command.
            argv.insert(0, "ssh".to_string());
            argv.insert(0, "-e".to_string());
            "sshpass".to_string()
        }
    };

    let forward = match decl.tunnel_protocol {
        TunnelProtocol::Http => {
            let subdomain = decl.subdomain.clone().unwrap_or_else(|| decl.id.clone());
            format!("{subdomain}:80:localhost:{local_port}")
        }
        TunnelProtocol::Tcp => format!("0:localhost:{local_port}"),
    };
    argv.push("-R".to_string());
    argv.push(forward);
    argv.push(format!("{}@{}", credential.client_id, credential.host));
    argv.push("-p".to_string());
    argv.push(credential.port.to_string());

    SshCommand { binary, argv, env }
}

pub struct TunnelManager {
    pub ssh_binary_override: Option<PathBuf>,
    pub workspace_dir: PathBuf,
    pub timeout: Duration,
}

impl TunnelManager {
    pub fn new(workspace_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            ssh_binary_override: None,
            workspace_dir,
            timeout,
        }
    }

    fn pid_file(&self, session_id: &str) -> PathBuf {
        self.workspace_dir.join(format!("{session_id}.pid"))
    }

    fn log_file(&self, session_id: &str) -> PathBuf {
        self.workspace_dir.join(format!("{session_id}.log"))
    }

    /// Runs one attempt of the session lifecycle for `session_id`. If
    /// `credential` is `None`, fails immediately with
    /// `FailureKind::CredentialMissing` — that failure is never retried by
    /// the caller.
    pub async fn start_once(
        &self,
        session_id: &str,
        decl: &ServiceDeclaration,
        credential: Option<&TunnelCredential>,
        local_port: u16,
        cancel: &CancellationToken,
    ) -> Result<TunnelOutcome> {
        let Some(credential) = credential else {
            return Ok(TunnelOutcome::Failed {
                kind: FailureKind::CredentialMissing,
                reason: "no tunnel credential resolved for this service".to_string(),
            });
        };
        self.attempt(session_id, decl, credential, local_port, cancel, true)
            .await
    }

    fn attempt<'a>(
        &'a self,
        session_id: &'a str,
        decl: &'a ServiceDeclaration,
        credential: &'a TunnelCredential,
        local_port: u16,
        cancel: &'a CancellationToken,
        allow_crash_retry: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<TunnelOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let command = build_ssh_command(decl, credential, local_port);
            let binary = self
                .ssh_binary_override
                .clone()
                .unwrap_or_else(|| PathBuf::from(&command.binary));
            let pid_file = self.pid_file(session_id);
            let log_file = self.log_file(session_id);

            let spec = DaemonSpec {
                binary,
                argv: command.argv,
                env: command.env,
                cwd: None,
                pid_file: pid_file.clone(),
                log_file: log_file.clone(),
                readiness: None,
                readiness_policy: asd_readiness::PollPolicy::default(),
                min_uptime: Duration::from_secs(3),
                retry_policy: RetryPolicy::Never,
                startup_grace: Duration::from_millis(300),
            };

            let start_offset = log_len(&log_file);
            let outcome = asd_supervisor::spawn_daemon(spec, cancel).await?;

            let pid = match outcome {
                DaemonOutcome::AlreadyRunning { pid } => pid,
                DaemonOutcome::Started { pid, .. } => pid,
                DaemonOutcome::Failed { reason } => {
                    return Ok(TunnelOutcome::Failed {
                        kind: FailureKind::Spawn,
                        reason,
                    });
                }
            };

            let probe = asd_readiness::LogRegexReadiness::new(&log_file, URL_PATTERN)?;
            let policy = asd_readiness::PollPolicy {
                timeout: self.timeout,
                interval: Duration::from_millis(250),
            };

            if probe.wait(policy, cancel).await {
                if let Some(url) = probe.capture_new(start_offset)? {
                    return Ok(TunnelOutcome::Established { pid, public_url: url });
                }
            }

            if asd_supervisor::is_alive(pid) {
                return Ok(TunnelOutcome::Degraded { pid });
            }

            // Process exited before the URL ever arrived: a crash during
            // warmup. Retry exactly once.
            asd_supervisor::PidFile::remove(&pid_file).ok();
            if allow_crash_retry {
                return self
                    .attempt(session_id, decl, credential, local_port, cancel, false)
                    .await;
            }

            Ok(TunnelOutcome::Failed {
                kind: FailureKind::ReadinessTimeout,
                reason: "ssh process exited before a public url was assigned".to_string(),
            })
        })
    }

    /// Terminates the session's ssh process group and removes its
    /// PID-file.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let pid_file = self.pid_file(session_id);
        if let Some(pid) = asd_supervisor::PidFile::read_live(&pid_file)? {
            asd_supervisor::terminate(pid, true, Duration::from_secs(5)).await?;
        }
        asd_supervisor::PidFile::remove(&pid_file)?;
        Ok(())
    }
}

fn log_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

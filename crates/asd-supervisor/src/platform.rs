//! Platform-specific process primitives: liveness check, detached
//! process-group spawn, and signal escalation.

#[cfg(unix)]
mod unix {
    use std::os::unix::process::CommandExt;
    use tokio::process::Command;

    pub fn is_alive(pid: u32) -> bool {
        // kill(pid, 0) checks for existence/permission without signaling.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    /// Put the child in its own session/process group, so termination can
    /// target the whole group via a negative pid without also hitting the
    /// supervisor.
    pub fn detach_process_group(cmd: &mut Command) {
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    fn target_pid(pid: u32, as_group: bool) -> libc::pid_t {
        let p = pid as libc::pid_t;
        if as_group {
            -p
        } else {
            p
        }
    }

    pub fn terminate_gracefully(pid: u32, as_group: bool) {
        unsafe {
            libc::kill(target_pid(pid, as_group), libc::SIGTERM);
        }
    }

    pub fn kill_now(pid: u32, as_group: bool) {
        unsafe {
            libc::kill(target_pid(pid, as_group), libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
mod windows {
    use tokio::process::Command;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub fn is_alive(pid: u32) -> bool {
        // Best-effort: `tasklist` filtered by PID; absent output means gone.
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .output()
            .map(|out| {
                String::from_utf8_lossy(&out.stdout).contains(&pid.to_string())
            })
            .unwrap_or(false)
    }

    pub fn detach_process_group(cmd: &mut Command) {
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    pub fn terminate_gracefully(pid: u32, _as_group: bool) {
        // No graceful console-event API without attaching a console; escalate
        // straight to the forceful tree-kill below.
        kill_now(pid, _as_group);
    }

    pub fn kill_now(pid: u32, as_group: bool) {
        let mut args = vec!["/PID".to_string(), pid.to_string(), "/F".to_string()];
        if as_group {
            args.push("/T".to_string());
        }
        let _ = std::process::Command::new("taskkill").args(args).status();
    }
}

#[cfg(unix)]
pub use unix::*;
#[cfg(windows)]
pub use windows::*;

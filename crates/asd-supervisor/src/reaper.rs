//! Lease reaper: finds processes whose environment carries a matching
//! lease marker and terminates them. Linux-only — `/proc/<pid>/environ` has
//! no portable equivalent on macOS or Windows.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error("failed to read {0}: {1}")]
    ProcRead(String, std::io::Error),
    #[error("lease reaper is not supported on this platform")]
    Unsupported,
}

/// Scans `/proc` for processes whose environment contains `key=value`,
/// excluding any pid in `exclude` (normally the caller's own pid and its
/// direct children), and terminates every match with the two-phase
/// sequence used elsewhere in this crate.
#[cfg(target_os = "linux")]
pub async fn reap_lease(
    key: &str,
    value: &str,
    exclude: &HashSet<u32>,
    gentle: Duration,
) -> Result<Vec<u32>, ReaperError> {
    let marker = format!("{key}={value}");
    let mut reaped = Vec::new();

    let entries = std::fs::read_dir("/proc")
        .map_err(|e| ReaperError::ProcRead("/proc".to_string(), e))?;

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(pid_str) = file_name.to_str() else {
            continue;
        };
        let Ok(pid) = pid_str.parse::<u32>() else {
            continue;
        };
        if exclude.contains(&pid) {
            continue;
        }

        let environ_path = format!("/proc/{pid}/environ");
        let raw = match std::fs::read(&environ_path) {
            Ok(bytes) => bytes,
            // Process exited between the listing and the read, or we lack
            // permission to inspect it — either way, not ours to reap.
            Err(_) => continue,
        };

        let has_marker = raw
            .split(|b| *b == 0)
            .any(|entry| entry == marker.as_bytes());

        if has_marker {
            crate::terminate(pid, true, gentle).await.ok();
            reaped.push(pid);
        }
    }

    Ok(reaped)
}

/// Documented no-op: callers must check for `Unsupported` rather than
/// assume an empty `Ok` means "nothing to reap".
#[cfg(not(target_os = "linux"))]
pub async fn reap_lease(
    _key: &str,
    _value: &str,
    _exclude: &HashSet<u32>,
    _gentle: Duration,
) -> Result<Vec<u32>, ReaperError> {
    Err(ReaperError::Unsupported)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn excludes_its_own_pid() {
        let mut exclude = HashSet::new();
        exclude.insert(std::process::id());
        let reaped = reap_lease(
            "ASD_LEASE_TEST_MARKER_NOT_SET",
            "x",
            &exclude,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert!(reaped.is_empty());
    }
}

#[cfg(all(test, not(target_os = "linux")))]
mod non_linux_tests {
    use super::*;

    #[tokio::test]
    async fn reports_unsupported_instead_of_silent_success() {
        let exclude = HashSet::new();
        let result = reap_lease("ASD_LEASE_TEST_MARKER_NOT_SET", "x", &exclude, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ReaperError::Unsupported)));
    }
}

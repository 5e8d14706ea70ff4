//! PID-file lifecycle: read-and-validate, stale reclaim, write, remove.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::platform;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("failed to read pid-file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pid-file {path} does not contain a valid pid")]
    Corrupt { path: PathBuf },
    #[error("failed to write pid-file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove pid-file {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct PidFile;

impl PidFile {
    /// Returns `Some(pid)` iff the file exists, parses, and names a live
    /// process. A corrupt or unreadable file is treated as absent — callers
    /// reclaim it via [`remove_stale`].
    pub fn read_live(path: &Path) -> Result<Option<u32>, PidFileError> {
        let pid = match Self::read(path)? {
            Some(pid) => pid,
            None => return Ok(None),
        };
        if platform::is_alive(pid) {
            Ok(Some(pid))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Option<u32>, PidFileError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).map_err(|source| PidFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        match contents.trim().parse::<u32>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => Ok(None),
        }
    }

    /// Removes the PID-file if it exists but does not name a live process.
    /// A no-op if the file is absent or still names a live process.
    pub fn remove_stale(path: &Path) -> Result<(), PidFileError> {
        if !path.exists() {
            return Ok(());
        }
        if Self::read_live(path)?.is_some() {
            return Ok(());
        }
        Self::remove(path)
    }

    pub fn write(path: &Path, pid: u32) -> Result<(), PidFileError> {
        std::fs::write(path, pid.to_string()).map_err(|source| PidFileError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn remove(path: &Path) -> Result<(), PidFileError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Remove {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.pid");
        assert_eq!(PidFile::read_live(&path).unwrap(), None);
    }

    #[test]
    fn corrupt_file_reads_as_none_and_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(PidFile::read_live(&path).unwrap(), None);
        PidFile::remove_stale(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_survives_stale_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.pid");
        PidFile::write(&path, std::process::id()).unwrap();
        PidFile::remove_stale(&path).unwrap();
        assert!(path.exists());
        assert_eq!(
            PidFile::read_live(&path).unwrap(),
            Some(std::process::id())
        );
    }

    #[test]
    fn dead_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead.pid");
        PidFile::write(&path, 999_999).unwrap();
        PidFile::remove_stale(&path).unwrap();
        assert!(!path.exists());
    }
}

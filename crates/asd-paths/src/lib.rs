//! Paths & environment resolver.
//!
//! Computes the absolute locations the rest of the workspace depends on:
//! the per-user ASD home, the per-project workspace directory, and the
//! bin/log directories beneath it. Resolution never touches a global —
//! callers build a [`Paths`] once (from [`Paths::resolve`]) and pass it
//! down explicitly.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Ancestor-walk bound when searching for a project-local `.asd` directory.
const MAX_ANCESTORS: usize = 50;

#[derive(Debug, Error)]
pub enum PathsError {
    #[error("could not determine a home directory for this platform")]
    NoHomeDir,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PathsError>;

/// Abstraction over the environment so tests can substitute a fake one
/// instead of mutating process-wide env vars (see the "no module-level
/// mutables" design note).
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
    fn home_dir(&self) -> Option<PathBuf>;
}

/// The real process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }
}

/// An in-memory environment for tests.
#[derive(Default, Clone)]
pub struct FakeEnv {
    pub vars: HashMap<String, String>,
    pub home: Option<PathBuf>,
}

impl FakeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }
}

impl EnvSource for FakeEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }
}

/// Resolved, absolute paths for one invocation of the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Per-user ASD home (config.yaml, credentials, globally installed binaries).
    pub asd_home: PathBuf,
    /// Per-project workspace root (`.asd/workspace`).
    pub workspace_dir: PathBuf,
    /// Directory for per-workspace installed binaries.
    pub bin_dir: PathBuf,
    /// Directory for daemon logs.
    pub log_dir: PathBuf,
}

static WARNED_DOUBLED: AtomicBool = AtomicBool::new(false);

impl Paths {
    /// Resolve paths starting from `start_dir` (normally `cwd`), honoring
    /// precedence: explicit env overrides, a discovered project-local
    /// `.asd` directory, then the OS-default ASD home.
    pub fn resolve(start_dir: &Path, env: &dyn EnvSource) -> Result<Self> {
        let asd_home = Self::resolve_asd_home(start_dir, env)?;

        let workspace_dir = match env.var("ASD_WORKSPACE_DIR") {
            Some(v) => absolutize(start_dir, &v),
            None => asd_home.join("workspace"),
        };

        let bin_dir = match env.var("ASD_BIN_DIR") {
            Some(v) => absolutize(start_dir, &v),
            None => workspace_dir.join("bin"),
        };

        let log_dir = workspace_dir.join("logs");

        for dir in [&workspace_dir, &bin_dir, &log_dir] {
            fs::create_dir_all(dir).map_err(|source| PathsError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        Self::warn_if_doubled(&asd_home, env);

        Ok(Self {
            asd_home,
            workspace_dir,
            bin_dir,
            log_dir,
        })
    }

    fn resolve_asd_home(start_dir: &Path, env: &dyn EnvSource) -> Result<PathBuf> {
        // Highest precedence: an explicit sandbox/execution override, used by
        // tests and CI to avoid touching a real home directory.
        if let Some(v) = env.var("ASD_DIR_PATH") {
            return Ok(absolutize(start_dir, &v));
        }
        if let Some(v) = env.var("ASD_HOME") {
            return Ok(absolutize(start_dir, &v));
        }

        // Next: walk up from the current directory looking for a project-local `.asd`.
        if let Some(found) = find_ancestor_asd_dir(start_dir) {
            return Ok(found);
        }

        // Fall back to the OS-default application data directory.
        let home = env.home_dir().ok_or(PathsError::NoHomeDir)?;
        Ok(os_default_home(&home))
    }

    fn warn_if_doubled(asd_home: &Path, env: &dyn EnvSource) {
        let doubled = asd_home
            .components()
            .collect::<Vec<_>>()
            .windows(2)
            .any(|w| {
                w[0].as_os_str() == ".asd" && w[1].as_os_str() == ".asd"
            });

        if !doubled {
            return;
        }

        // Known CI layouts intentionally nest a sandbox checkout under `.asd`.
        if env.var("CI").is_some() || env.var("ASD_ALLOW_DOUBLED_PATH").is_some() {
            return;
        }

        if WARNED_DOUBLED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::warn!(
                path = %asd_home.display(),
                "doubled .asd/.asd path segment detected; check ASD_HOME / ASD_DIR_PATH overrides"
            );
        }
    }
}

fn absolutize(base: &Path, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}

fn find_ancestor_asd_dir(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    for _ in 0..MAX_ANCESTORS {
        let candidate = current.join(".asd");
        if candidate.is_dir() {
            return Some(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    None
}

#[cfg(target_os = "macos")]
fn os_default_home(home: &Path) -> PathBuf {
    home.join("Library").join("Application Support").join("asd")
}

#[cfg(target_os = "windows")]
fn os_default_home(home: &Path) -> PathBuf {
    env::var("LOCALAPPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home.join("AppData").join("Local"))
        .join("asd")
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn os_default_home(home: &Path) -> PathBuf {
    env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home.join(".local").join("share"))
        .join("asd")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_dir_path_wins_over_everything() {
        let temp = TempDir::new().unwrap();
        let env = FakeEnv::new()
            .with_var("ASD_DIR_PATH", temp.path().join("sandbox").to_str().unwrap())
            .with_home(temp.path().join("home"));

        let paths = Paths::resolve(temp.path(), &env).unwrap();
        assert_eq!(paths.asd_home, temp.path().join("sandbox"));
    }

    #[test]
    fn discovers_local_asd_dir_by_walking_ancestors() {
        let temp = TempDir::new().unwrap();
        let project_root = temp.path().join("project");
        let nested = project_root.join("a").join("b").join("c");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir_all(project_root.join(".asd")).unwrap();

        let env = FakeEnv::new().with_home(temp.path().join("home"));
        let paths = Paths::resolve(&nested, &env).unwrap();
        assert_eq!(paths.asd_home, project_root.join(".asd"));
    }

    #[test]
    fn falls_back_to_os_default_home() {
        let temp = TempDir::new().unwrap();
        let env = FakeEnv::new().with_home(temp.path().join("home"));
        let paths = Paths::resolve(temp.path(), &env).unwrap();
        assert!(paths.asd_home.starts_with(temp.path().join("home")));
    }

    #[test]
    fn creates_workspace_bin_and_log_dirs() {
        let temp = TempDir::new().unwrap();
        let env = FakeEnv::new()
            .with_var("ASD_DIR_PATH", temp.path().join("home").join(".asd").to_str().unwrap());

        let paths = Paths::resolve(temp.path(), &env).unwrap();
        assert!(paths.workspace_dir.is_dir());
        assert!(paths.bin_dir.is_dir());
        assert!(paths.log_dir.is_dir());
    }

    #[test]
    fn explicit_workspace_dir_override_is_absolute() {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().join("custom-workspace");
        let env = FakeEnv::new()
            .with_var("ASD_DIR_PATH", temp.path().join("home").join(".asd").to_str().unwrap())
            .with_var("ASD_WORKSPACE_DIR", workspace.to_str().unwrap());

        let paths = Paths::resolve(temp.path(), &env).unwrap();
        assert_eq!(paths.workspace_dir, workspace);
    }

    #[test]
    fn no_home_dir_is_an_error_without_overrides_or_local_asd() {
        let temp = TempDir::new().unwrap();
        let env = FakeEnv::new();
        let result = Paths::resolve(temp.path(), &env);
        assert!(matches!(result, Err(PathsError::NoHomeDir)));
    }
}

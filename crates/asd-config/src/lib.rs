//! Project configuration and plugin manifest parsing: discovers
//! `asd.config.{yaml,yml}` by walking up from a starting directory, and
//! loads plugin `net.manifest.yaml` files declared under `project.plugins`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use asd_registry::ServiceDeclaration;
use serde::Deserialize;
use thiserror::Error;

/// Ancestor-walk bound, matching `asd-paths`'s own discovery limit.
const MAX_ANCESTORS: usize = 50;

const CONFIG_FILE_NAMES: &[&str] = &["asd.config.yaml", "asd.config.yml"];
const MANIFEST_FILE_NAME: &str = "net.manifest.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not valid YAML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectMeta {
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectBasicAuth {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub realm: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaddyPolicy {
    #[serde(default)]
    pub tls: Option<String>,
    #[serde(default)]
    pub basic_auth: Option<ProjectBasicAuth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub caddy: CaddyPolicy,
    #[serde(default)]
    pub services: HashMap<String, ServiceDeclaration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationStep {
    pub run: String,
    #[serde(default)]
    pub background: bool,
    #[serde(default, rename = "waitFor")]
    pub wait_for: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelsConfig {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub version: u32,
    pub project: ProjectMeta,
    #[serde(default)]
    pub features: HashMap<String, bool>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub automation: HashMap<String, Vec<AutomationStep>>,
    #[serde(default)]
    pub tunnels: TunnelsConfig,
}

impl ProjectConfig {
    pub fn from_str(raw: &str, path: &Path) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Walks up from the process cwd looking for a project config file.
    pub fn discover() -> Result<Option<(PathBuf, Self)>> {
        let cwd = std::env::current_dir().map_err(|source| ConfigError::Read {
            path: PathBuf::from("."),
            source,
        })?;
        Self::discover_from(&cwd)
    }

    pub fn discover_from(start_dir: &Path) -> Result<Option<(PathBuf, Self)>> {
        let mut current = start_dir.to_path_buf();
        for _ in 0..MAX_ANCESTORS {
            for name in CONFIG_FILE_NAMES {
                let candidate = current.join(name);
                if candidate.is_file() {
                    let config = Self::load(&candidate)?;
                    return Ok(Some((candidate, config)));
                }
            }
            if !current.pop() {
                break;
            }
        }
        Ok(None)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&raw, path)
    }
}

/// Plugin-provided services, loaded from `net.manifest.yaml` under a
/// plugin module directory. Unlike project declarations, `dial` here may
/// itself be a template string (port macros, secrets) left unexpanded
/// until the reconciler runs the expander over it.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub services: HashMap<String, ServiceDeclaration>,
}

impl PluginManifest {
    /// Loads `net.manifest.yaml` from `plugin_dir`, or returns `None` if the
    /// plugin declares no manifest.
    pub fn load_from_dir(plugin_dir: &Path) -> Result<Option<Self>> {
        let path = plugin_dir.join(MANIFEST_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let manifest = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok(Some(manifest))
    }
}

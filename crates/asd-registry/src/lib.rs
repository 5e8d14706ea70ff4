//! Service registry: a single versioned JSON file recording declared and
//! discovered services plus their runtime state, guarded by an advisory
//! file lock with bounded acquisition and atomic (temp-then-rename)
//! writes.
//!
//! This crate's API is synchronous and blocking by design — callers that
//! run inside an async context must wrap calls in `spawn_blocking` rather
//! than holding the registry lock across an `.await`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write registry file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "registry schema version {found} is newer than this binary supports ({supported}); run `asd net reset`"
    )]
    UnsupportedSchema { found: u32, supported: u32 },
    #[error("timed out after {0:?} waiting for the registry file lock")]
    LockTimeout(Duration),
    #[error("no registry entry with id {0:?}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Tcp,
}

impl Default for TunnelProtocol {
    fn default() -> Self {
        Self::Http
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthResult {
    Ok,
    Warn,
    Stop,
    Unknown,
    Pending,
}

impl Default for HealthResult {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Container,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasicAuthScope {
    Host,
    Path,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BasicAuthConfig {
    Inherit,
    Override {
        enabled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        realm: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        routes: Option<BasicAuthScope>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityHeaders {
    #[serde(default)]
    pub hsts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_options: Option<String>,
    #[serde(default)]
    pub compression: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathRoute {
    pub prefix: String,
    #[serde(rename = "stripPrefix", default)]
    pub strip_prefix: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HealthCheck {
    Http { path: String },
    Tcp { port: u16 },
    Command { cmd: String },
}

/// User- or plugin-declared intent for one service. A declaration with no
/// `dial` is an overlay: it refines a plugin-provided service of the same
/// `id` rather than standing alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDeclaration {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dial: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub paths: Vec<PathRoute>,
    #[serde(default)]
    pub public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, rename = "tunnelProtocol")]
    pub tunnel_protocol: TunnelProtocol,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, rename = "basicAuth", skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuthConfig>,
    #[serde(default, rename = "securityHeaders")]
    pub security_headers: SecurityHeaders,
    #[serde(default, rename = "iframeOrigin", skip_serializing_if = "Option::is_none")]
    pub iframe_origin: Option<String>,
    #[serde(default, rename = "deleteResponseHeaders")]
    pub delete_response_headers: Vec<String>,
    #[serde(default, rename = "ingressTag", skip_serializing_if = "Option::is_none")]
    pub ingress_tag: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, rename = "healthCheck", skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

impl ServiceDeclaration {
    pub fn is_overlay(&self) -> bool {
        self.dial.is_none()
    }

    /// Merges a plugin's base declaration with a user-config declaration of
    /// the same id: an overlay (no `dial`) refines `base` field-by-field,
    /// anything else replaces it outright. Used by the reconciler to build
    /// its declared set before the result ever reaches the registry.
    pub fn merge_declared(base: &ServiceDeclaration, overlay: &ServiceDeclaration) -> ServiceDeclaration {
        if overlay.is_overlay() {
            let mut merged = base.clone();
            overlay.apply_overlay(&mut merged);
            merged
        } else {
            overlay.clone()
        }
    }

    /// Applies this overlay's explicitly-set fields onto `base`, leaving
    /// everything else untouched. `base` keeps its own `dial`.
    fn apply_overlay(&self, base: &mut ServiceDeclaration) {
        if !self.hosts.is_empty() {
            base.hosts = self.hosts.clone();
        }
        if !self.paths.is_empty() {
            base.paths = self.paths.clone();
        }
        base.public = self.public;
        if self.subdomain.is_some() {
            base.subdomain = self.subdomain.clone();
        }
        base.tunnel_protocol = self.tunnel_protocol;
        base.priority = self.priority;
        if self.basic_auth.is_some() {
            base.basic_auth = self.basic_auth.clone();
        }
        base.security_headers = self.security_headers.clone();
        if self.iframe_origin.is_some() {
            base.iframe_origin = self.iframe_origin.clone();
        }
        if !self.delete_response_headers.is_empty() {
            base.delete_response_headers = self.delete_response_headers.clone();
        }
        if self.ingress_tag.is_some() {
            base.ingress_tag = self.ingress_tag.clone();
        }
        for (k, v) in &self.env {
            base.env.insert(k.clone(), v.clone());
        }
        if self.health_check.is_some() {
            base.health_check = self.health_check.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub id: String,
    pub dial: String,
    pub source: String,
    #[serde(rename = "detectedAt")]
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// The union merged by the reconciler: declaration fields plus runtime
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub declaration: ServiceDeclaration,
    #[serde(default, rename = "tunnelUrl", skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
    #[serde(default, rename = "tunnelSessionId", skip_serializing_if = "Option::is_none")]
    pub tunnel_session_id: Option<String>,
    #[serde(default, rename = "tunnelLastError", skip_serializing_if = "Option::is_none")]
    pub tunnel_last_error: Option<String>,
    #[serde(default, rename = "lastHealthAt", skip_serializing_if = "Option::is_none")]
    pub last_health_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "lastHealthResult")]
    pub last_health_result: HealthResult,
    #[serde(default, rename = "processKind", skip_serializing_if = "Option::is_none")]
    pub process_kind: Option<ProcessKind>,
    #[serde(default, rename = "processId", skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(default, rename = "allocatedPort", skip_serializing_if = "Option::is_none")]
    pub allocated_port: Option<u16>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn new(declaration: ServiceDeclaration) -> Self {
        let now = Utc::now();
        Self {
            declaration,
            tunnel_url: None,
            tunnel_session_id: None,
            tunnel_last_error: None,
            last_health_at: None,
            last_health_result: HealthResult::default(),
            process_kind: None,
            process_id: None,
            allocated_port: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    entries: Vec<RegistryEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: CURRENT_SCHEMA_VERSION,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RegistryFilter {
    pub public_only: bool,
    pub ids: Option<HashSet<String>>,
}

pub struct RegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("json.lock");
        Self {
            path,
            lock_path,
            lock_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn acquire_lock(&self) -> Result<std::fs::File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::Write {
                path: self.lock_path.clone(),
                source,
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| RegistryError::Write {
                path: self.lock_path.clone(),
                source,
            })?;

        let start = Instant::now();
        let mut backoff = Duration::from_millis(10);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(file),
                Err(_) if start.elapsed() < self.lock_timeout => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(200));
                }
                Err(_) => return Err(RegistryError::LockTimeout(self.lock_timeout)),
            }
        }
    }

    fn read_file(&self) -> Result<RegistryFile> {
        if !self.path.exists() {
            return Ok(RegistryFile::default());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|source| RegistryError::Read {
            path: self.path.clone(),
            source,
        })?;
        let file: RegistryFile =
            serde_json::from_str(&raw).map_err(|source| RegistryError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if file.version > CURRENT_SCHEMA_VERSION {
            return Err(RegistryError::UnsupportedSchema {
                found: file.version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        Ok(file)
    }

    fn write_file(&self, file: &RegistryFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(file).expect("registry file is serializable");
        std::fs::write(&tmp_path, body).map_err(|source| RegistryError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| RegistryError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn with_write_lock<T>(&self, f: impl FnOnce(&mut RegistryFile) -> Result<T>) -> Result<T> {
        let lock = self.acquire_lock()?;
        let mut file = self.read_file()?;
        let result = f(&mut file);
        if result.is_ok() {
            self.write_file(&file)?;
        }
        FileExt::unlock(&lock).ok();
        result
    }

    /// Raw parsed contents, without filtering.
    pub fn load(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.read_file()?.entries)
    }

    /// Alias for `list` with no filter — the full current state.
    pub fn snapshot(&self) -> Result<Vec<RegistryEntry>> {
        self.list(&RegistryFilter::default())
    }

    pub fn list(&self, filter: &RegistryFilter) -> Result<Vec<RegistryEntry>> {
        let entries = self.load()?;
        Ok(entries
            .into_iter()
            .filter(|e| !filter.public_only || e.declaration.public)
            .filter(|e| {
                filter
                    .ids
                    .as_ref()
                    .map(|ids| ids.contains(&e.declaration.id))
                    .unwrap_or(true)
            })
            .collect())
    }

    /// Upserts `declaration`. A plugin overlay (no `dial`) refines the
    /// existing entry of the same id rather than replacing it wholesale;
    /// anything else replaces the entry outright, preserving runtime state.
    pub fn upsert(&self, declaration: ServiceDeclaration) -> Result<RegistryEntry> {
        self.with_write_lock(|file| {
            let now = Utc::now();
            if let Some(existing) = file
                .entries
                .iter_mut()
                .find(|e| e.declaration.id == declaration.id)
            {
                if declaration.is_overlay() {
                    declaration.apply_overlay(&mut existing.declaration);
                } else {
                    existing.declaration = declaration;
                }
                existing.updated_at = now;
                Ok(existing.clone())
            } else {
                let entry = RegistryEntry::new(declaration);
                file.entries.push(entry.clone());
                Ok(entry)
            }
        })
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.with_write_lock(|file| {
            let before = file.entries.len();
            file.entries.retain(|e| e.declaration.id != id);
            if file.entries.len() == before {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    pub fn mark_health(&self, id: &str, result: HealthResult, at: DateTime<Utc>) -> Result<()> {
        self.with_write_lock(|file| {
            let entry = file
                .entries
                .iter_mut()
                .find(|e| e.declaration.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            entry.last_health_result = result;
            entry.last_health_at = Some(at);
            entry.updated_at = at;
            Ok(())
        })
    }

    /// Sets (or clears, with `None`) the tunnel URL for `id`. Clearing
    /// also drops the session id, matching the invariant that a
    /// `publicUrl` only exists while a session is `established`.
    pub fn set_tunnel(&self, id: &str, url: Option<String>) -> Result<()> {
        self.with_write_lock(|file| {
            let entry = file
                .entries
                .iter_mut()
                .find(|e| e.declaration.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            entry.tunnel_url = url.clone();
            if url.is_none() {
                entry.tunnel_session_id = None;
            }
            entry.updated_at = Utc::now();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declaration(id: &str) -> ServiceDeclaration {
        ServiceDeclaration {
            id: id.to_string(),
            dial: Some("127.0.0.1:3000".to_string()),
            hosts: vec![],
            paths: vec![],
            public: true,
            subdomain: Some(id.to_string()),
            tunnel_protocol: TunnelProtocol::Http,
            priority: 0,
            basic_auth: None,
            security_headers: SecurityHeaders::default(),
            iframe_origin: None,
            delete_response_headers: vec![],
            ingress_tag: None,
            env: HashMap::new(),
            health_check: None,
        }
    }

    #[test]
    fn upsert_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store.upsert(declaration("myapp")).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].declaration.id, "myapp");
    }

    #[test]
    fn overlay_refines_existing_entry_instead_of_duplicating() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store.upsert(declaration("myapp")).unwrap();

        let mut overlay = declaration("myapp");
        overlay.dial = None;
        overlay.priority = 7;
        store.upsert(overlay).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].declaration.priority, 7);
        assert_eq!(
            loaded[0].declaration.dial.as_deref(),
            Some("127.0.0.1:3000")
        );
    }

    #[test]
    fn remove_unknown_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        let err = store.remove("nope").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn mark_health_updates_timestamp_and_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store.upsert(declaration("myapp")).unwrap();
        let at = Utc::now();
        store.mark_health("myapp", HealthResult::Ok, at).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded[0].last_health_result, HealthResult::Ok);
        assert_eq!(loaded[0].last_health_at, Some(at));
    }

    #[test]
    fn set_tunnel_none_also_clears_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store.upsert(declaration("myapp")).unwrap();
        store
            .set_tunnel("myapp", Some("https://myapp.example.com".to_string()))
            .unwrap();
        store
            .with_write_lock(|file| {
                file.entries[0].tunnel_session_id = Some("sess-1".to_string());
                Ok(())
            })
            .unwrap();

        store.set_tunnel("myapp", None).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded[0].tunnel_url, None);
        assert_eq!(loaded[0].tunnel_session_id, None);
    }

    #[test]
    fn list_filters_by_public_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        store.upsert(declaration("pub-app")).unwrap();
        let mut private = declaration("priv-app");
        private.public = false;
        store.upsert(private).unwrap();

        let filter = RegistryFilter {
            public_only: true,
            ids: None,
        };
        let listed = store.list(&filter).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].declaration.id, "pub-app");
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, r#"{"version": 99, "entries": []}"#).unwrap();
        let store = RegistryStore::new(path);
        let err = store.load().unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedSchema { .. }));
    }
}

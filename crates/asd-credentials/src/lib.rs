//! Credential store: persistence and lifecycle for tunnel credentials
//! (ephemeral, token, or key-based), backed by one JSON file under the ASD
//! home.

use std::path::{Path, PathBuf};

use asd_paths::EnvSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BOOTSTRAP_PATH: &str = "/api/v1/tunnel/bootstrap";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read credential file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write credential file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no credential named {0:?}")]
    NotFound(String),
    #[error("a credential named {0:?} already exists")]
    AlreadyExists(String),
    #[error("no default gateway host configured (set ASD_TUNNEL_HOST)")]
    NoDefaultGateway,
    #[error("bootstrap request to {url} failed: {source}")]
    BootstrapRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("bootstrap endpoint {url} returned status {status}")]
    BootstrapStatus { url: String, status: u16 },
}

pub type Result<T> = std::result::Result<T, CredentialError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Ephemeral,
    Token,
    Key,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelCredential {
    pub name: String,
    pub kind: CredentialKind,
    pub host: String,
    pub port: u16,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "secretOrKeyRef")]
    pub secret_or_key_ref: String,
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<serde_json::Value>,
}

impl TunnelCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<String>,
    #[serde(default)]
    credentials: Vec<TunnelCredential>,
}

#[derive(Debug, Deserialize)]
struct BootstrapResponse {
    tunnel_client_id: String,
    tunnel_client_secret: String,
    expires_at: DateTime<Utc>,
    tunnel_host: String,
    tunnel_port: u16,
    #[serde(default)]
    limits: Option<serde_json::Value>,
}

pub struct CredentialStore {
    path: PathBuf,
    client: reqwest::Client,
}

impl CredentialStore {
    pub fn new(asd_home: &Path) -> Self {
        Self {
            path: asd_home.join("credentials.json"),
            client: reqwest::Client::new(),
        }
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|source| CredentialError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| CredentialError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CredentialError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(file).expect("credential file is serializable");
        std::fs::write(&tmp_path, body).map_err(|source| CredentialError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| CredentialError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// All non-expired credentials. Expired entries remain on disk until
    /// the next [`rotate`](Self::rotate) but are never listed.
    pub fn list(&self) -> Result<Vec<TunnelCredential>> {
        let now = Utc::now();
        let file = self.load()?;
        Ok(file
            .credentials
            .into_iter()
            .filter(|c| !c.is_expired(now))
            .collect())
    }

    pub fn get(&self, name: &str) -> Result<Option<TunnelCredential>> {
        Ok(self.list()?.into_iter().find(|c| c.name == name))
    }

    pub fn default_credential(&self) -> Result<Option<TunnelCredential>> {
        let file = self.load()?;
        match file.default {
            Some(name) => self.get(&name),
            None => Ok(None),
        }
    }

    pub fn set_default(&self, name: &str) -> Result<()> {
        let mut file = self.load()?;
        if !file.credentials.iter().any(|c| c.name == name) {
            return Err(CredentialError::NotFound(name.to_string()));
        }
        file.default = Some(name.to_string());
        self.save(&file)
    }

    pub fn append(&self, credential: TunnelCredential) -> Result<()> {
        let mut file = self.load()?;
        if file.credentials.iter().any(|c| c.name == credential.name) {
            return Err(CredentialError::AlreadyExists(credential.name));
        }
        let is_first = file.credentials.is_empty();
        if is_first {
            file.default = Some(credential.name.clone());
        }
        file.credentials.push(credential);
        self.save(&file)
    }

    /// Replaces the stored credential with `updated`, keeping its position
    /// and its default-ness. `updated.name` must match `name`.
    pub fn rotate(&self, name: &str, updated: TunnelCredential) -> Result<()> {
        let mut file = self.load()?;
        let slot = file
            .credentials
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| CredentialError::NotFound(name.to_string()))?;
        *slot = updated;
        self.save(&file)
    }

    /// Generates a fresh ephemeral credential via an unauthenticated POST
    /// to `bootstrap_url`, then appends (or rotates, if `name` already
    /// exists) it in the store.
    pub async fn generate_ephemeral(
        &self,
        bootstrap_url: &str,
        name: &str,
    ) -> Result<TunnelCredential> {
        let resp = self
            .client
            .post(bootstrap_url)
            .send()
            .await
            .map_err(|source| CredentialError::BootstrapRequest {
                url: bootstrap_url.to_string(),
                source,
            })?;

        if !resp.status().is_success() {
            return Err(CredentialError::BootstrapStatus {
                url: bootstrap_url.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let body: BootstrapResponse =
            resp.json()
                .await
                .map_err(|source| CredentialError::BootstrapRequest {
                    url: bootstrap_url.to_string(),
                    source,
                })?;

        let credential = TunnelCredential {
            name: name.to_string(),
            kind: CredentialKind::Ephemeral,
            host: body.tunnel_host,
            port: body.tunnel_port,
            client_id: body.tunnel_client_id,
            secret_or_key_ref: body.tunnel_client_secret,
            expires_at: Some(body.expires_at),
            limits: body.limits,
        };

        match self.append(credential.clone()) {
            Ok(()) => Ok(credential),
            Err(CredentialError::AlreadyExists(_)) => {
                self.rotate(name, credential.clone())?;
                Ok(credential)
            }
            Err(e) => Err(e),
        }
    }
}

/// Derives the default bootstrap URL from `ASD_TUNNEL_HOST` /
/// `ASD_TUNNEL_PORT` when no explicit override is configured.
pub fn default_bootstrap_url(env: &dyn EnvSource) -> Result<String> {
    if let Some(explicit) = env.var("ASD_TUNNEL_BOOTSTRAP_URL") {
        return Ok(explicit);
    }
    let host = env
        .var("ASD_TUNNEL_HOST")
        .ok_or(CredentialError::NoDefaultGateway)?;
    let port = env
        .var("ASD_TUNNEL_PORT")
        .unwrap_or_else(|| "443".to_string());
    Ok(format!("https://{host}:{port}{BOOTSTRAP_PATH}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use asd_paths::FakeEnv;
    use chrono::Duration as ChronoDuration;

    fn sample(name: &str) -> TunnelCredential {
        TunnelCredential {
            name: name.to_string(),
            kind: CredentialKind::Token,
            host: "cicd.eu1.asd.engineer".to_string(),
            port: 22,
            client_id: "fkmc".to_string(),
            secret_or_key_ref: "s3cr3t".to_string(),
            expires_at: None,
            limits: None,
        }
    }

    #[test]
    fn append_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.append(sample("a")).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a");
    }

    #[test]
    fn first_appended_credential_becomes_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.append(sample("a")).unwrap();
        store.append(sample("b")).unwrap();
        let default = store.default_credential().unwrap().unwrap();
        assert_eq!(default.name, "a");
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.append(sample("a")).unwrap();
        let err = store.append(sample("a")).unwrap_err();
        assert!(matches!(err, CredentialError::AlreadyExists(_)));
    }

    #[test]
    fn expired_credentials_are_filtered_from_listings_but_stay_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let mut expired = sample("a");
        expired.expires_at = Some(Utc::now() - ChronoDuration::seconds(5));
        store.append(expired).unwrap();

        assert!(store.list().unwrap().is_empty());
        let raw = std::fs::read_to_string(dir.path().join("credentials.json")).unwrap();
        assert!(raw.contains("\"a\""));
    }

    #[test]
    fn rotate_replaces_in_place_without_changing_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.append(sample("a")).unwrap();
        let mut rotated = sample("a");
        rotated.secret_or_key_ref = "new-secret".to_string();
        store.rotate("a", rotated).unwrap();

        let fetched = store.get("a").unwrap().unwrap();
        assert_eq!(fetched.secret_or_key_ref, "new-secret");
        assert_eq!(store.default_credential().unwrap().unwrap().name, "a");
    }

    #[test]
    fn default_bootstrap_url_derives_from_tunnel_host_env() {
        let env = FakeEnv::new()
            .with_var("ASD_TUNNEL_HOST", "cicd.eu1.asd.engineer")
            .with_var("ASD_TUNNEL_PORT", "8443");
        let url = default_bootstrap_url(&env).unwrap();
        assert_eq!(url, "https://cicd.eu1.asd.engineer:8443/api/v1/tunnel/bootstrap");
    }

    #[test]
    fn default_bootstrap_url_without_host_is_an_error() {
        let env = FakeEnv::new();
        assert!(matches!(
            default_bootstrap_url(&env),
            Err(CredentialError::NoDefaultGateway)
        ));
    }
}

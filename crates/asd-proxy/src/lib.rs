//! Reverse-proxy controller: renders the desired route set either through
//! the proxy's admin JSON API (diff + single PATCH batch) or, when the
//! admin API is unreachable, as a static config file followed by a
//! supervised restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use asd_registry::{BasicAuthConfig, BasicAuthScope, RegistryEntry};
use asd_supervisor::{DaemonOutcome, DaemonSpec, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("admin API request to {url} failed: {source}")]
    AdminRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("admin API at {url} returned status {status}")]
    AdminStatus { url: String, status: u16 },
    #[error("failed to render static config to {path}: {source}")]
    RenderConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bcrypt basic-auth password: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
    #[error(transparent)]
    Supervisor(#[from] asd_supervisor::SupervisorError),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// A basic-auth credential already bcrypted — the plaintext never reaches
/// a [`RouteSpec`] or the rendered config.
#[derive(Debug, Clone)]
pub struct ResolvedBasicAuth {
    pub username: String,
    pub password_hash: String,
    pub realm: String,
}

impl ResolvedBasicAuth {
    pub fn from_plaintext(username: impl Into<String>, password: &str, realm: impl Into<String>) -> Result<Self> {
        Ok(Self {
            username: username.into(),
            password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)?,
            realm: realm.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteBasicAuth {
    pub username: String,
    #[serde(rename = "passwordHash")]
    pub password_hash: String,
    pub realm: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteSecurityHeaders {
    #[serde(default)]
    pub hsts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_options: Option<String>,
    #[serde(default)]
    pub compression: bool,
}

/// One route as rendered to the proxy, matched on `(host, path_prefix,
/// priority)` for diffing purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    pub host: String,
    #[serde(rename = "pathPrefix", skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(rename = "stripPrefix", default)]
    pub strip_prefix: bool,
    pub priority: i32,
    pub upstream: String,
    #[serde(rename = "basicAuth", skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<RouteBasicAuth>,
    #[serde(rename = "securityHeaders", default)]
    pub security_headers: RouteSecurityHeaders,
    #[serde(rename = "deleteResponseHeaders", default)]
    pub delete_response_headers: Vec<String>,
    #[serde(rename = "ingressTag", skip_serializing_if = "Option::is_none")]
    pub ingress_tag: Option<String>,
}

impl RouteSpec {
    fn key(&self) -> (String, Option<String>, i32) {
        (self.host.clone(), self.path_prefix.clone(), self.priority)
    }
}

/// Builds the desired route set from registry entries. Declarations must
/// already have their `hosts` macro-expanded by the caller; this function
/// only drops empty strings (the spec's "unresolved tunnel template"
/// filtering rule) — it does no expansion itself.
pub fn build_routes(
    entries: &[RegistryEntry],
    project_default_auth: Option<&ResolvedBasicAuth>,
) -> Vec<RouteSpec> {
    let mut routes = Vec::new();

    for entry in entries {
        let decl = &entry.declaration;
        let Some(upstream) = decl.dial.clone() else {
            continue;
        };

        let hosts: Vec<&str> = decl
            .hosts
            .iter()
            .map(String::as_str)
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            continue;
        }

        let security_headers = RouteSecurityHeaders {
            hsts: decl.security_headers.hsts,
            frame_options: decl.security_headers.frame_options.clone(),
            compression: decl.security_headers.compression,
        };

        for host in hosts {
            let path_entries: Vec<Option<(&str, bool)>> = if decl.paths.is_empty() {
                vec![None]
            } else {
                decl.paths
                    .iter()
                    .map(|p| Some((p.prefix.as_str(), p.strip_prefix)))
                    .collect()
            };

            for path in path_entries {
                let (path_prefix, strip_prefix) = match path {
                    Some((p, strip)) => (Some(p.to_string()), strip),
                    None => (None, false),
                };
                let is_path_route = path_prefix.is_some();

                let basic_auth = resolve_basic_auth(
                    decl.basic_auth.as_ref(),
                    project_default_auth,
                    is_path_route,
                );

                routes.push(RouteSpec {
                    host: host.to_string(),
                    path_prefix,
                    strip_prefix,
                    priority: decl.priority,
                    upstream: upstream.clone(),
                    basic_auth,
                    security_headers: security_headers.clone(),
                    delete_response_headers: decl.delete_response_headers.clone(),
                    ingress_tag: decl.ingress_tag.clone(),
                });
            }
        }
    }

    routes
}

fn resolve_basic_auth(
    declared: Option<&BasicAuthConfig>,
    project_default: Option<&ResolvedBasicAuth>,
    is_path_route: bool,
) -> Option<RouteBasicAuth> {
    let (enabled, realm_override, scope) = match declared {
        None | Some(BasicAuthConfig::Inherit) => (true, None, None),
        Some(BasicAuthConfig::Override {
            enabled,
            realm,
            routes,
        }) => (*enabled, realm.clone(), *routes),
    };

    if !enabled {
        return None;
    }

    let auth = project_default?;

    let scope_allows = match scope.unwrap_or(BasicAuthScope::Both) {
        BasicAuthScope::Both => true,
        BasicAuthScope::Host => !is_path_route,
        BasicAuthScope::Path => is_path_route,
    };
    if !scope_allows {
        return None;
    }

    Some(RouteBasicAuth {
        username: auth.username.clone(),
        password_hash: auth.password_hash.clone(),
        realm: realm_override.unwrap_or_else(|| auth.realm.clone()),
    })
}

#[derive(Debug, Default)]
pub struct RouteDiff {
    pub to_upsert: Vec<RouteSpec>,
    pub to_remove: Vec<RouteSpec>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.to_upsert.is_empty() && self.to_remove.is_empty()
    }
}

/// Computes the minimal set of changes needed to bring `current` to
/// `desired`, keyed by `(host, path_prefix, priority)`.
pub fn diff_routes(current: &[RouteSpec], desired: &[RouteSpec]) -> RouteDiff {
    let current_by_key: HashMap<_, _> = current.iter().map(|r| (r.key(), r)).collect();
    let desired_by_key: HashMap<_, _> = desired.iter().map(|r| (r.key(), r)).collect();

    let mut diff = RouteDiff::default();

    for (key, route) in &desired_by_key {
        match current_by_key.get(key) {
            Some(existing) if routes_equal(existing, route) => {}
            _ => diff.to_upsert.push((*route).clone()),
        }
    }

    for (key, route) in &current_by_key {
        if !desired_by_key.contains_key(key) {
            diff.to_remove.push((*route).clone());
        }
    }

    diff
}

fn routes_equal(a: &RouteSpec, b: &RouteSpec) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

/// Renders the desired route set in the proxy's static config format: a
/// top-level JSON object with a `routes` array, sorted for deterministic
/// output across reconcile passes.
pub fn render_static_config(routes: &[RouteSpec]) -> String {
    let mut sorted = routes.to_vec();
    sorted.sort_by(|a, b| a.key().cmp(&b.key()));
    let doc = serde_json::json!({ "routes": sorted });
    serde_json::to_string_pretty(&doc).expect("route set is serializable")
}

pub struct ProxyController {
    /// `Some` when the admin API is the preferred path; `None` pins this
    /// controller to static-config mode.
    pub admin_url: Option<String>,
    client: reqwest::Client,
    pub config_path: PathBuf,
    pub binary: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl ProxyController {
    pub fn new(binary: PathBuf, config_path: PathBuf, pid_file: PathBuf, log_file: PathBuf) -> Self {
        Self {
            admin_url: None,
            client: reqwest::Client::new(),
            config_path,
            binary,
            pid_file,
            log_file,
        }
    }

    pub fn with_admin_url(mut self, url: impl Into<String>) -> Self {
        self.admin_url = Some(url.into());
        self
    }

    /// Ensures the proxy daemon is alive and (when configured) its admin
    /// port is reachable.
    pub async fn start(&self, argv: Vec<String>, cancel: &CancellationToken) -> Result<DaemonOutcome> {
        let readiness = self
            .admin_url
            .as_ref()
            .map(|url| Box::new(asd_readiness::HttpReadiness::new(url.clone())) as Box<dyn asd_readiness::ReadinessProbe>);

        let spec = DaemonSpec {
            binary: self.binary.clone(),
            argv,
            env: HashMap::new(),
            cwd: None,
            pid_file: self.pid_file.clone(),
            log_file: self.log_file.clone(),
            readiness,
            readiness_policy: asd_readiness::PollPolicy::default(),
            min_uptime: Duration::from_secs(2),
            retry_policy: RetryPolicy::OnFailure,
            startup_grace: Duration::from_millis(200),
        };
        Ok(asd_supervisor::spawn_daemon(spec, cancel).await?)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(pid) = asd_supervisor::PidFile::read_live(&self.pid_file)
            .map_err(asd_supervisor::SupervisorError::from)?
        {
            asd_supervisor::terminate(pid, true, Duration::from_secs(5)).await?;
        }
        asd_supervisor::PidFile::remove(&self.pid_file)
            .map_err(asd_supervisor::SupervisorError::from)?;
        Ok(())
    }

    /// Idempotently applies `desired` against the live config. Prefers the
    /// admin API; falls back to static mode (render + restart) on any
    /// admin request failure.
    pub async fn apply(
        &self,
        desired: &[RouteSpec],
        restart_argv: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ApplyMode> {
        if let Some(url) = &self.admin_url {
            match self.try_apply_via_admin(url, desired).await {
                Ok(()) => return Ok(ApplyMode::Api),
                Err(e) => {
                    tracing::warn!(error = %e, "admin API apply failed, falling back to static config");
                }
            }
        }

        self.apply_static(desired, restart_argv, cancel).await?;
        Ok(ApplyMode::Static)
    }

    async fn try_apply_via_admin(&self, url: &str, desired: &[RouteSpec]) -> Result<()> {
        let current: Vec<RouteSpec> = self
            .client
            .get(format!("{url}/routes"))
            .send()
            .await
            .map_err(|source| ProxyError::AdminRequest {
                url: url.to_string(),
                source,
            })?
            .error_for_status()
            .map_err(|source| ProxyError::AdminRequest {
                url: url.to_string(),
                source,
            })?
            .json()
            .await
            .map_err(|source| ProxyError::AdminRequest {
                url: url.to_string(),
                source,
            })?;

        let diff = diff_routes(&current, desired);
        if diff.is_empty() {
            return Ok(());
        }

        let resp = self
            .client
            .patch(format!("{url}/routes"))
            .json(&serde_json::json!({
                "upsert": diff.to_upsert,
                "remove": diff.to_remove.iter().map(RouteSpec::key).collect::<Vec<_>>(),
            }))
            .send()
            .await
            .map_err(|source| ProxyError::AdminRequest {
                url: url.to_string(),
                source,
            })?;

        if !resp.status().is_success() {
            return Err(ProxyError::AdminStatus {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn apply_static(
        &self,
        desired: &[RouteSpec],
        restart_argv: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rendered = render_static_config(desired);
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ProxyError::RenderConfig {
                path: self.config_path.clone(),
                source,
            })?;
        }
        std::fs::write(&self.config_path, rendered).map_err(|source| ProxyError::RenderConfig {
            path: self.config_path.clone(),
            source,
        })?;

        self.stop().await.ok();
        self.start(restart_argv, cancel).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Api,
    Static,
}

#[cfg(test)]
mod tests {
    use super::*;
    use asd_registry::{ServiceDeclaration, TunnelProtocol};
    use std::collections::HashMap as Map;

    fn declaration(id: &str, hosts: Vec<&str>) -> ServiceDeclaration {
        ServiceDeclaration {
            id: id.to_string(),
            dial: Some("127.0.0.1:3000".to_string()),
            hosts: hosts.into_iter().map(String::from).collect(),
            paths: vec![],
            public: true,
            subdomain: None,
            tunnel_protocol: TunnelProtocol::Http,
            priority: 0,
            basic_auth: None,
            security_headers: Default::default(),
            iframe_origin: None,
            delete_response_headers: vec![],
            ingress_tag: None,
            env: Map::new(),
            health_check: None,
        }
    }

    #[test]
    fn empty_tunnel_host_is_filtered_from_route_list() {
        let entries = vec![RegistryEntry::new(declaration(
            "myapp",
            vec!["myapp.localhost", ""],
        ))];
        let routes = build_routes(&entries, None);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].host, "myapp.localhost");
    }

    #[test]
    fn declaration_with_no_resolved_hosts_yields_no_routes() {
        let entries = vec![RegistryEntry::new(declaration("myapp", vec![""]))];
        let routes = build_routes(&entries, None);
        assert!(routes.is_empty());
    }

    #[test]
    fn basic_auth_inherits_project_default_when_enabled() {
        let auth = ResolvedBasicAuth::from_plaintext("admin", "hunter2", "asd").unwrap();
        let entries = vec![RegistryEntry::new(declaration("myapp", vec!["myapp.localhost"]))];
        let routes = build_routes(&entries, Some(&auth));
        let route_auth = routes[0].basic_auth.as_ref().unwrap();
        assert_eq!(route_auth.username, "admin");
        assert!(bcrypt::verify("hunter2", &route_auth.password_hash).unwrap());
    }

    #[test]
    fn diff_detects_additions_and_removals() {
        let current = vec![RouteSpec {
            host: "old.localhost".to_string(),
            path_prefix: None,
            strip_prefix: false,
            priority: 0,
            upstream: "127.0.0.1:3000".to_string(),
            basic_auth: None,
            security_headers: Default::default(),
            delete_response_headers: vec![],
            ingress_tag: None,
        }];
        let desired = vec![RouteSpec {
            host: "new.localhost".to_string(),
            path_prefix: None,
            strip_prefix: false,
            priority: 0,
            upstream: "127.0.0.1:3000".to_string(),
            basic_auth: None,
            security_headers: Default::default(),
            delete_response_headers: vec![],
            ingress_tag: None,
        }];

        let diff = diff_routes(&current, &desired);
        assert_eq!(diff.to_upsert.len(), 1);
        assert_eq!(diff.to_remove.len(), 1);
        assert_eq!(diff.to_upsert[0].host, "new.localhost");
        assert_eq!(diff.to_remove[0].host, "old.localhost");
    }

    #[test]
    fn diff_is_empty_when_nothing_changed() {
        let routes = build_routes(
            &[RegistryEntry::new(declaration("myapp", vec!["myapp.localhost"]))],
            None,
        );
        let diff = diff_routes(&routes, &routes);
        assert!(diff.is_empty());
    }

    #[test]
    fn static_config_render_is_deterministic_regardless_of_input_order() {
        let a = RouteSpec {
            host: "b.localhost".to_string(),
            path_prefix: None,
            strip_prefix: false,
            priority: 0,
            upstream: "x".to_string(),
            basic_auth: None,
            security_headers: Default::default(),
            delete_response_headers: vec![],
            ingress_tag: None,
        };
        let b = RouteSpec {
            host: "a.localhost".to_string(),
            ..a.clone()
        };
        let rendered_1 = render_static_config(&[a.clone(), b.clone()]);
        let rendered_2 = render_static_config(&[b, a]);
        assert_eq!(rendered_1, rendered_2);
    }
}

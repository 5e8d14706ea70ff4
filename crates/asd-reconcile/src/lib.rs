//! Reconciler: the two-pass orchestrator invoked by `net apply` and the
//! refresh paths. Builds the declared service set from project config and
//! plugin manifests, starts/refreshes tunnel sessions, diffs and applies
//! proxy routes, re-expands `env` bindings into the project dotenv, and
//! runs a readiness sweep — per spec.md §4.9 and §9's "cyclic references"
//! two-pass design (tunnel URLs are produced in pass 1 and only consumed,
//! never re-read mid-pass, by pass 2's route/env work).

pub mod discovery;
pub mod dotenv;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use asd_config::{PluginManifest, ProjectConfig};
use asd_credentials::CredentialStore;
use asd_proxy::{build_routes, ProxyController, ResolvedBasicAuth};
use asd_registry::{DiscoveredService, HealthResult, RegistryStore, ServiceDeclaration};
use asd_template::Expander;
use asd_tunnel::{FailureKind, TunnelManager, TunnelOutcome};
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Registry(#[from] asd_registry::RegistryError),
    #[error(transparent)]
    Proxy(#[from] asd_proxy::ProxyError),
    #[error(transparent)]
    Tunnel(#[from] asd_tunnel::TunnelError),
    #[error(transparent)]
    Template(#[from] asd_template::TemplateError),
    #[error(transparent)]
    Credential(#[from] asd_credentials::CredentialError),
    #[error("failed to read/write dotenv at {path}: {source}")]
    Dotenv {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// spec.md §7's kind glyphs, attached per-service to the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Ok,
    Warn,
    Error,
    Info,
}

impl ReportKind {
    pub fn glyph(self) -> &'static str {
        match self {
            ReportKind::Ok => "\u{2714}",
            ReportKind::Warn => "\u{26a0}",
            ReportKind::Error => "\u{2716}",
            ReportKind::Info => "\u{2139}",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceReport {
    pub id: String,
    pub kind: ReportKind,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub entries: Vec<ServiceReport>,
    pub routes_applied: usize,
    pub dotenv_keys_written: Vec<String>,
}

impl ReconcileReport {
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.kind == ReportKind::Error)
    }

    fn push(&mut self, id: impl Into<String>, kind: ReportKind, message: impl Into<String>) {
        self.entries.push(ServiceReport {
            id: id.into(),
            kind,
            message: message.into(),
        });
    }
}

/// Which parts of a reconcile pass to actually apply; mirrors the
/// `net apply [--caddy] [--tunnel] [--ids …]` CLI flags.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub apply_caddy: bool,
    pub apply_tunnel: bool,
    pub ids: Option<HashSet<String>>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            apply_caddy: true,
            apply_tunnel: true,
            ids: None,
        }
    }
}

/// Everything one reconcile pass needs: the stores it drives, and the
/// paths it reads/writes outside of them.
pub struct Reconciler {
    pub registry: RegistryStore,
    pub proxy: ProxyController,
    pub tunnels: TunnelManager,
    pub credentials: CredentialStore,
    pub dotenv_path: PathBuf,
}

impl Reconciler {
    /// spec.md §4.9 step 2: plugin base definitions (keyed by id) merged
    /// with user-config overlays (user wins), plus standalone user
    /// services untouched by any plugin.
    pub fn declared_set(project: &ProjectConfig, plugins: &[PluginManifest]) -> Vec<ServiceDeclaration> {
        let mut bases: HashMap<String, ServiceDeclaration> = HashMap::new();
        for manifest in plugins {
            for (id, decl) in &manifest.services {
                bases.insert(id.clone(), decl.clone());
            }
        }

        let mut declared = bases.clone();
        for (id, decl) in &project.network.services {
            match bases.get(id) {
                Some(base) => {
                    declared.insert(id.clone(), ServiceDeclaration::merge_declared(base, decl));
                }
                None => {
                    declared.insert(id.clone(), decl.clone());
                }
            }
        }

        declared.into_values().collect()
    }

    fn project_basic_auth(project: &ProjectConfig, env: &HashMap<String, String>) -> Option<ResolvedBasicAuth> {
        let policy = project.network.caddy.basic_auth.as_ref()?;
        if !policy.enabled {
            return None;
        }
        let username = env.get("ASD_BASIC_AUTH_USERNAME")?;
        let password = env.get("ASD_BASIC_AUTH_PASSWORD")?;
        let realm = policy.realm.clone().unwrap_or_else(|| "asd".to_string());
        ResolvedBasicAuth::from_plaintext(username, password, realm).ok()
    }

    /// Runs one full reconcile pass (spec.md §4.9 steps 1-7) and returns a
    /// per-service report grouped by outcome kind.
    pub async fn reconcile(
        &self,
        project: &ProjectConfig,
        plugins: &[PluginManifest],
        discovered: &[DiscoveredService],
        env: &mut HashMap<String, String>,
        options: &ReconcileOptions,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let credential = self.credentials.default_credential()?;
        let project_auth = Self::project_basic_auth(project, env);

        let mut declared = Self::declared_set(project, plugins);
        if let Some(ids) = &options.ids {
            declared.retain(|d| ids.contains(&d.id));
        }
        for found in discovered {
            if !declared.iter().any(|d| d.id == found.id) {
                declared.push(ServiceDeclaration {
                    id: found.id.clone(),
                    dial: Some(found.dial.clone()),
                    ..ServiceDeclaration::default()
                });
            }
        }

        // One expander for the whole pass: a single port-allocation scope,
        // per spec.md §5's "fresh port-allocation scope" per reconcile.
        let mut expander = Expander::new(env, credential.as_ref(), None);

        // Pass 1: expand `dial` and `hosts`, start/refresh tunnel sessions
        // (appending the established tunnel host to `hosts`), upsert registry.
        let mut expanded_decls = Vec::with_capacity(declared.len());
        for decl in &declared {
            expander.set_subdomain(decl.subdomain.as_deref());

            let mut expanded = decl.clone();
            if let Some(template) = &decl.dial {
                expanded.dial = Some(expander.expand(template)?);
            }
            let mut expanded_hosts = Vec::with_capacity(decl.hosts.len());
            for host in &decl.hosts {
                expanded_hosts.push(expander.expand(host)?);
            }
            expanded.hosts = expanded_hosts;

            let mut tunnel_url = None;

            if expanded.public && options.apply_tunnel {
                match local_port_of(&expanded) {
                    Some(local_port) => {
                        let session_id = expanded.id.clone();
                        match self
                            .tunnels
                            .start_once(&session_id, &expanded, credential.as_ref(), local_port, cancel)
                            .await?
                        {
                            TunnelOutcome::Established { public_url, .. } => {
                                report.push(&expanded.id, ReportKind::Ok, "tunnel established");
                                let host = tunnel_host(&public_url).to_string();
                                if !expanded.hosts.iter().any(|h| h == &host) {
                                    expanded.hosts.push(host);
                                }
                                tunnel_url = Some(public_url);
                            }
                            TunnelOutcome::Degraded { .. } => {
                                report.push(
                                    &expanded.id,
                                    ReportKind::Warn,
                                    "tunnel process alive, readiness not yet converged",
                                );
                            }
                            TunnelOutcome::Failed { kind, reason } => {
                                let report_kind = match kind {
                                    FailureKind::CredentialMissing => ReportKind::Info,
                                    FailureKind::Spawn | FailureKind::ReadinessTimeout => ReportKind::Warn,
                                };
                                report.push(&expanded.id, report_kind, reason);
                            }
                        }
                    }
                    None => {
                        report.push(
                            &expanded.id,
                            ReportKind::Warn,
                            "public service has no resolvable local port, tunnel skipped",
                        );
                    }
                }
            }

            let existing = self.registry.upsert(expanded.clone())?;
            if existing.tunnel_url != tunnel_url {
                if let (Some(old), Some(new)) = (&existing.tunnel_url, &tunnel_url) {
                    tracing::warn!(service = %expanded.id, old_url = %old, new_url = %new, "tunnel public url changed");
                }
                self.registry.set_tunnel(&expanded.id, tunnel_url.clone())?;
            }

            expanded_decls.push(expanded);
        }

        // Pass 2: diff and apply proxy routes against the settled registry.
        let snapshot = self.registry.snapshot()?;
        if options.apply_caddy {
            let desired_routes = build_routes(&snapshot, project_auth.as_ref());
            match self.proxy.apply(&desired_routes, Vec::new(), cancel).await {
                Ok(mode) => {
                    report.routes_applied = desired_routes.len();
                    report.push("proxy", ReportKind::Ok, format!("{} routes applied via {:?}", desired_routes.len(), mode));
                }
                Err(e) => report.push("proxy", ReportKind::Error, e.to_string()),
            }
        }

        // Pass 2 continued: re-expand every declaration's `env` mapping and
        // write resolved, non-empty, changed pairs back to the dotenv.
        let mut updates = Vec::new();
        for decl in &expanded_decls {
            if decl.env.is_empty() {
                continue;
            }
            expander.set_subdomain(decl.subdomain.as_deref());
            for (key, template) in &decl.env {
                let value = expander.expand(template)?;
                if value.is_empty() {
                    continue;
                }
                updates.push((key.clone(), value));
            }
        }
        for pending in &expander.pending_writes {
            updates.push((pending.key.clone(), pending.value.clone()));
        }
        let written = dotenv::apply_updates(&self.dotenv_path, &updates).map_err(|source| ReconcileError::Dotenv {
            path: self.dotenv_path.clone(),
            source,
        })?;
        report.dotenv_keys_written = written;

        // Pass 3: readiness sweep, recording `lastHealthResult` per entry.
        for decl in &expanded_decls {
            let result = self.run_health_check(decl, cancel).await;
            self.registry.mark_health(&decl.id, result, Utc::now())?;
        }

        Ok(report)
    }

    async fn run_health_check(&self, decl: &ServiceDeclaration, cancel: &CancellationToken) -> HealthResult {
        use asd_readiness::{HttpReadiness, PollPolicy, ReadinessProbe, TcpReadiness};

        let Some(check) = &decl.health_check else {
            return HealthResult::Unknown;
        };
        let policy = PollPolicy {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(200),
        };

        let healthy = match check {
            asd_registry::HealthCheck::Http { path } => {
                let base = decl.dial.clone().unwrap_or_default();
                HttpReadiness::new(format!("http://{base}{path}")).wait(policy, cancel).await
            }
            asd_registry::HealthCheck::Tcp { port } => match format!("127.0.0.1:{port}").parse() {
                Ok(addr) => TcpReadiness::new(addr).wait(policy, cancel).await,
                Err(_) => false,
            },
            asd_registry::HealthCheck::Command { cmd } => tokio::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .status()
                .await
                .map(|status| status.success())
                .unwrap_or(false),
        };

        if healthy {
            HealthResult::Ok
        } else {
            HealthResult::Stop
        }
    }

    /// Removal pass for `net clean` / `net remove` / `net reset`: stops
    /// owned tunnels, revokes routes, and (when `purge_registry`) drops the
    /// matching registry entries. No ordering is guaranteed between
    /// removals, but each tunnel stop / route revocation is individually
    /// atomic.
    pub async fn remove(&self, ids: &[String], purge_registry: bool, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for id in ids {
            if let Err(e) = self.tunnels.stop(id).await {
                report.push(id, ReportKind::Warn, format!("tunnel stop failed: {e}"));
            }
            self.registry.set_tunnel(id, None).ok();
        }

        let snapshot = self.registry.snapshot()?;
        let remaining: Vec<_> = snapshot.into_iter().filter(|e| !ids.contains(&e.declaration.id)).collect();
        let desired_routes = build_routes(&remaining, None);
        if let Err(e) = self.proxy.apply(&desired_routes, Vec::new(), cancel).await {
            report.push("proxy", ReportKind::Error, e.to_string());
        }

        if purge_registry {
            for id in ids {
                match self.registry.remove(id) {
                    Ok(()) => report.push(id, ReportKind::Ok, "removed"),
                    Err(asd_registry::RegistryError::NotFound(_)) => {}
                    Err(e) => report.push(id, ReportKind::Warn, e.to_string()),
                }
            }
        }

        Ok(report)
    }
}

/// Extracts the loopback port a tunnel session forwards to from a
/// `host:port`-shaped `dial`. Tunnels can only forward to a concrete port,
/// so anything else (a bare socket path, an unresolved macro) yields `None`.
fn local_port_of(decl: &ServiceDeclaration) -> Option<u16> {
    decl.dial.as_ref()?.rsplit_once(':')?.1.parse().ok()
}

/// Strips the scheme and any trailing path from a tunnel's public URL,
/// leaving the bare host a Caddy route can match against.
fn tunnel_host(public_url: &str) -> &str {
    public_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(public_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asd_registry::{BasicAuthConfig, PathRoute, TunnelProtocol};

    #[test]
    fn declared_set_merges_plugin_base_with_user_overlay() {
        let mut plugin_services = HashMap::new();
        plugin_services.insert(
            "db".to_string(),
            ServiceDeclaration {
                id: "db".to_string(),
                dial: Some("127.0.0.1:5432".to_string()),
                public: false,
                ..ServiceDeclaration::default()
            },
        );
        let plugins = vec![PluginManifest {
            services: plugin_services,
        }];

        let mut project_services = HashMap::new();
        project_services.insert(
            "db".to_string(),
            ServiceDeclaration {
                id: "db".to_string(),
                public: true,
                subdomain: Some("database".to_string()),
                ..ServiceDeclaration::default()
            },
        );
        project_services.insert(
            "web".to_string(),
            ServiceDeclaration {
                id: "web".to_string(),
                dial: Some("127.0.0.1:3000".to_string()),
                public: true,
                ..ServiceDeclaration::default()
            },
        );

        let mut project = asd_config::ProjectConfig::from_str(
            "version: 1\nproject:\n  name: demo\n",
            std::path::Path::new("asd.config.yaml"),
        )
        .unwrap();
        project.network.services = project_services;

        let declared = Reconciler::declared_set(&project, &plugins);
        let db = declared.iter().find(|d| d.id == "db").unwrap();
        assert_eq!(db.dial.as_deref(), Some("127.0.0.1:5432"));
        assert!(db.public);
        assert_eq!(db.subdomain.as_deref(), Some("database"));

        let web = declared.iter().find(|d| d.id == "web").unwrap();
        assert_eq!(web.dial.as_deref(), Some("127.0.0.1:3000"));
    }

    #[test]
    fn tunnel_host_strips_scheme() {
        assert_eq!(tunnel_host("https://myapp-fkmc.cicd.eu1.asd.engineer"), "myapp-fkmc.cicd.eu1.asd.engineer");
        assert_eq!(tunnel_host("http://myapp-fkmc.cicd.eu1.asd.engineer"), "myapp-fkmc.cicd.eu1.asd.engineer");
    }

    #[test]
    fn tunnel_host_strips_trailing_path() {
        assert_eq!(tunnel_host("https://myapp-fkmc.cicd.eu1.asd.engineer/health"), "myapp-fkmc.cicd.eu1.asd.engineer");
    }

    #[test]
    fn local_port_of_parses_trailing_port() {
        let decl = ServiceDeclaration {
            id: "x".to_string(),
            dial: Some("127.0.0.1:4000".to_string()),
            ..ServiceDeclaration::default()
        };
        assert_eq!(local_port_of(&decl), Some(4000));
    }

    #[test]
    fn local_port_of_is_none_for_unparseable_dial() {
        let decl = ServiceDeclaration {
            id: "x".to_string(),
            dial: Some("unix:///tmp/a.sock".to_string()),
            ..ServiceDeclaration::default()
        };
        assert_eq!(local_port_of(&decl), None);
    }

    #[test]
    fn declared_set_includes_discovered_services_without_duplicating() {
        // sanity: a discovered id matching an already-declared one must not
        // appear twice once merged by the caller (reconcile() does this,
        // this test only exercises the pure merge helper declared_set uses).
        let project = asd_config::ProjectConfig::from_str(
            "version: 1\nproject:\n  name: demo\n",
            std::path::Path::new("asd.config.yaml"),
        )
        .unwrap();
        let declared = Reconciler::declared_set(&project, &[]);
        assert!(declared.is_empty());
    }

    #[test]
    fn basic_auth_none_resolves_to_none() {
        let decl = ServiceDeclaration {
            basic_auth: Some(BasicAuthConfig::Override {
                enabled: false,
                realm: None,
                routes: None,
            }),
            paths: vec![PathRoute {
                prefix: "/api".to_string(),
                strip_prefix: false,
            }],
            tunnel_protocol: TunnelProtocol::Http,
            ..ServiceDeclaration::default()
        };
        assert!(!decl.paths.is_empty());
    }
}

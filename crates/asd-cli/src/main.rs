//! `asd` — local service exposure & reverse-tunnel supervisor CLI.
//!
//! Thin dispatch layer over the `asd-*` library crates: this file owns
//! argument parsing, output formatting (`--json` vs human-readable), and
//! exit codes (0 success, 1 generic failure, 2 misuse). Everything else
//! lives in the library crates it wires together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use asd_config::{PluginManifest, ProjectConfig};
use asd_credentials::CredentialStore;
use asd_paths::{Paths, ProcessEnv};
use asd_proxy::ProxyController;
use asd_reconcile::{discovery, ReconcileOptions, Reconciler};
use asd_registry::{RegistryFilter, RegistryStore, ServiceDeclaration};
use asd_supervisor::{DaemonOutcome, DaemonSpec, RetryPolicy};
use asd_tunnel::TunnelManager;

#[derive(Parser, Debug)]
#[command(name = "asd")]
#[command(about = "Expose local services through a reverse tunnel, with a local reverse proxy in front of them")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit machine-readable JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Writes a starter `asd.config.yaml` in the current directory.
    Init,
    /// Ensures a project `.env` file exists.
    EnvInit,
    /// Runs an automation task declared under `automation:` in the project config.
    Run { task: String },
    /// Checks globally installed helper binaries against what the workspace expects.
    Update,
    /// Declares (and optionally tunnels) a local port.
    Expose {
        /// Local TCP port to expose. Required unless a subcommand is given.
        port: Option<u16>,
        #[arg(long)]
        name: Option<String>,
        /// Only add a local Caddy route; never start a tunnel.
        #[arg(long)]
        local_only: bool,
        /// Start a tunnel without a local Caddy route.
        #[arg(long)]
        direct: bool,
        #[command(subcommand)]
        action: Option<ExposeAction>,
    },
    /// Reconcile and service-registry commands.
    Net {
        #[command(subcommand)]
        action: NetAction,
    },
    Terminal {
        #[command(subcommand)]
        action: DaemonGroupAction,
    },
    Code {
        #[command(subcommand)]
        action: DaemonGroupAction,
    },
    Database {
        #[command(subcommand)]
        action: DaemonGroupAction,
    },
    Inspect {
        #[command(subcommand)]
        action: DaemonGroupAction,
    },
    /// Local reverse-proxy (Caddy) lifecycle.
    Caddy {
        #[command(subcommand)]
        action: CaddyAction,
    },
    /// Tunnel credential inspection.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Subcommand, Debug)]
enum ExposeAction {
    /// Lists every registry entry this tool manages.
    List,
    /// Tears down a previously exposed service by name or port.
    Stop { target: String },
}

#[derive(Subcommand, Debug)]
enum NetAction {
    /// Full reconcile pass: tunnels, proxy routes, dotenv `env` bindings.
    Apply {
        #[arg(long, default_value_t = true)]
        caddy: bool,
        #[arg(long, default_value_t = true)]
        tunnel: bool,
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
    },
    /// Alias for `apply` with default scope.
    Refresh,
    /// Probes loopback ports and Docker for services nothing has declared.
    Discover,
    /// Starts (or refreshes) one declared service's tunnel + route.
    Start { id: String },
    /// Stops one service's live tunnel/route without dropping its declaration.
    Stop { id: String },
    /// Prints the service's local/Caddy/tunnel URLs.
    Open { id: String },
    /// Stops and purges one registry entry entirely.
    Remove { id: String },
    /// Removes registry entries with no corresponding declared service.
    Clean,
    /// Tears down every managed tunnel/route and purges the registry.
    Reset,
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },
}

#[derive(Subcommand, Debug)]
enum TunnelAction {
    /// Starts tunnels for every declared public service.
    Start,
    /// Stops every live tunnel session, leaving declarations and routes intact.
    Stop,
    /// Stops every tunnel session and clears its last-known public URL.
    Reset,
}

#[derive(Subcommand, Debug)]
enum DaemonGroupAction {
    Start,
    Stop,
}

#[derive(Subcommand, Debug)]
enum CaddyAction {
    Start,
    Stop,
    Restart,
    /// Prints the rendered static route configuration.
    Config,
}

#[derive(Subcommand, Debug)]
enum AuthAction {
    /// Shows the default credential and its expiry.
    Status,
    /// Lists every non-expired stored credential.
    Credentials,
    /// Makes an already-stored credential the default.
    Switch { name: String },
}

/// Resolved paths plus helpers to build the per-crate handles every
/// handler needs, threaded down explicitly rather than via a module-level
/// mutable.
struct Ctx {
    paths: Paths,
}

impl Ctx {
    fn resolve() -> Result<Self> {
        let cwd = std::env::current_dir().context("could not determine the current directory")?;
        let paths = Paths::resolve(&cwd, &ProcessEnv).context("failed to resolve asd paths")?;
        Ok(Self { paths })
    }

    fn registry(&self) -> RegistryStore {
        RegistryStore::new(self.paths.workspace_dir.join("network").join("registry.json"))
    }

    fn credentials(&self) -> CredentialStore {
        CredentialStore::new(&self.paths.asd_home)
    }

    fn proxy(&self) -> ProxyController {
        let admin_url = std::env::var("ASD_TUNNEL_SERVER_HTTP_PORT")
            .ok()
            .map(|p| format!("http://127.0.0.1:{p}"))
            .unwrap_or_else(|| "http://127.0.0.1:2019".to_string());
        ProxyController::new(
            PathBuf::from("caddy"),
            self.paths.workspace_dir.join("caddy").join("routes.json"),
            self.paths.log_dir.join("caddy.pid"),
            self.paths.log_dir.join("caddy.log"),
        )
        .with_admin_url(admin_url)
    }

    fn tunnels(&self) -> TunnelManager {
        TunnelManager::new(self.paths.workspace_dir.join("tunnels"), Duration::from_secs(20))
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler {
            registry: self.registry(),
            proxy: self.proxy(),
            tunnels: self.tunnels(),
            credentials: self.credentials(),
            dotenv_path: std::env::current_dir().unwrap_or_default().join(".env"),
        }
    }

    fn load_project(&self) -> Result<(ProjectConfig, Vec<PluginManifest>)> {
        let (_path, project) = ProjectConfig::discover()
            .context("failed to parse project config")?
            .context("no asd.config.yaml found in this directory or any ancestor — run `asd init` first")?;

        let mut plugins = Vec::new();
        for plugin_dir in &project.project.plugins {
            if let Some(manifest) =
                PluginManifest::load_from_dir(&PathBuf::from(plugin_dir)).context("failed to parse plugin manifest")?
            {
                plugins.push(manifest);
            }
        }
        Ok((project, plugins))
    }

    /// Local port hints this binary knows how to probe during discovery,
    /// keyed by the service id they'd be registered under.
    fn candidate_ports(&self) -> Vec<(String, u16)> {
        let mut candidates = Vec::new();
        for (env_var, id) in [
            ("TTYD_PORT", "terminal"),
            ("CODE_SERVER_PORT", "code"),
            ("ADMINER_PORT", "database"),
            ("ASD_INSPECTOR_PORT", "inspect"),
        ] {
            if let Ok(port) = std::env::var(env_var).unwrap_or_default().parse::<u16>() {
                candidates.push((id.to_string(), port));
            }
        }
        candidates
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging() {
        eprintln!("failed to initialize logging: {e:#}");
        return std::process::ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default_level = if std::env::var("ASD_DEBUG").is_ok() {
        "debug"
    } else if std::env::var("ASD_VERBOSE").is_ok() {
        "info"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .context("failed to initialize the logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Init => cmd_init(json),
        Commands::EnvInit => cmd_env_init(json),
        Commands::Run { task } => cmd_run(&task, json).await,
        Commands::Update => cmd_update(json),
        Commands::Expose {
            port,
            name,
            local_only,
            direct,
            action,
        } => cmd_expose(port, name, local_only, direct, action, json).await,
        Commands::Net { action } => cmd_net(action, json).await,
        Commands::Terminal { action } => cmd_daemon_group("terminal", "ttyd", &["-p", "7681"], action, json).await,
        Commands::Code { action } => cmd_daemon_group("code", "code-server", &[], action, json).await,
        Commands::Database { action } => cmd_daemon_group("database", "adminer", &[], action, json).await,
        Commands::Inspect { action } => cmd_daemon_group("inspect", "asd-inspector", &[], action, json).await,
        Commands::Caddy { action } => cmd_caddy(action, json).await,
        Commands::Auth { action } => cmd_auth(action, json),
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("failed to serialize output: {e}"),
        }
    } else {
        println!("{}", human());
    }
}

fn cmd_init(json: bool) -> Result<()> {
    let path = PathBuf::from("asd.config.yaml");
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let template = concat!(
        "version: 1\n",
        "project:\n",
        "  name: my-project\n",
        "features: {}\n",
        "network:\n",
        "  caddy:\n",
        "    tls: self-signed\n",
        "  services: {}\n",
        "automation: {}\n",
        "tunnels:\n",
        "  mode: ephemeral\n",
    );
    std::fs::write(&path, template).with_context(|| format!("failed to write {}", path.display()))?;
    emit(json, &serde_json::json!({"created": path}), || format!("created {}", path.display()));
    Ok(())
}

fn cmd_env_init(json: bool) -> Result<()> {
    let path = PathBuf::from(".env");
    if !path.exists() {
        std::fs::write(&path, "").with_context(|| format!("failed to create {}", path.display()))?;
    }
    emit(json, &serde_json::json!({"path": path}), || format!("{} ready", path.display()));
    Ok(())
}

async fn cmd_run(task: &str, json: bool) -> Result<()> {
    let ctx = Ctx::resolve()?;
    let (project, _plugins) = ctx.load_project()?;
    let steps = project
        .automation
        .get(task)
        .with_context(|| format!("no automation task named {task:?}"))?;

    let mut results = Vec::new();
    for step in steps {
        tracing::info!(run = %step.run, background = step.background, "running automation step");
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(&step.run);
        for (k, v) in &step.environment {
            command.env(k, v);
        }

        if step.background {
            command.spawn().with_context(|| format!("failed to spawn {:?}", step.run))?;
            if let Some(wait_for) = &step.wait_for {
                if let Ok(addr) = wait_for.parse() {
                    let cancel = CancellationToken::new();
                    asd_readiness::TcpReadiness::new(addr)
                        .wait(asd_readiness::PollPolicy::default(), &cancel)
                        .await;
                }
            }
            results.push(serde_json::json!({"run": step.run, "background": true}));
            continue;
        }

        let status = if let Some(timeout_secs) = step.timeout {
            tokio::time::timeout(Duration::from_secs(timeout_secs), command.status())
                .await
                .with_context(|| format!("step {:?} timed out", step.run))??
        } else {
            command.status().await?
        };
        if !status.success() {
            bail!("automation step {:?} exited with {status}", step.run);
        }
        results.push(serde_json::json!({"run": step.run, "background": false}));
    }

    emit(json, &results, || format!("ran {} step(s) for task {task:?}", results.len()));
    Ok(())
}

fn cmd_update(json: bool) -> Result<()> {
    let ctx = Ctx::resolve()?;
    let expected = ["caddy", "ssh", "sshpass"];
    let mut report = Vec::new();
    for binary in expected {
        let workspace_path = ctx.paths.bin_dir.join(binary);
        let found = workspace_path.exists() || which(binary).is_some();
        report.push(serde_json::json!({"binary": binary, "found": found}));
    }
    emit(json, &report, || {
        report
            .iter()
            .map(|r| {
                format!(
                    "{}: {}",
                    r["binary"].as_str().unwrap_or("?"),
                    if r["found"].as_bool().unwrap_or(false) { "found" } else { "missing" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    });
    Ok(())
}

fn which(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(binary)).find(|p| p.is_file())
}

async fn cmd_expose(
    port: Option<u16>,
    name: Option<String>,
    local_only: bool,
    direct: bool,
    action: Option<ExposeAction>,
    json: bool,
) -> Result<()> {
    let ctx = Ctx::resolve()?;

    match action {
        Some(ExposeAction::List) => {
            let entries = ctx.registry().list(&RegistryFilter::default())?;
            emit(json, &entries, || {
                entries
                    .iter()
                    .map(|e| {
                        format!(
                            "{}  dial={}  public={}  tunnelUrl={}",
                            e.declaration.id,
                            e.declaration.dial.as_deref().unwrap_or("-"),
                            e.declaration.public,
                            e.tunnel_url.as_deref().unwrap_or("-")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            Ok(())
        }
        Some(ExposeAction::Stop { target }) => {
            let id = resolve_expose_target(&ctx, &target)?;
            let cancel = CancellationToken::new();
            let report = ctx.reconciler().remove(&[id.clone()], true, &cancel).await?;
            emit(json, &report.entries, || format!("stopped {id}"));
            Ok(())
        }
        None => {
            let port = port.context("expose requires a port (or a `list`/`stop` subcommand)")?;
            let id = name.unwrap_or_else(|| format!("port-{port}"));
            let declaration = ServiceDeclaration {
                id: id.clone(),
                dial: Some(format!("127.0.0.1:{port}")),
                hosts: vec![format!("{id}.localhost")],
                public: !local_only,
                subdomain: Some(id.clone()),
                ..ServiceDeclaration::default()
            };

            let ids: std::collections::HashSet<String> = [id.clone()].into_iter().collect();
            let options = ReconcileOptions {
                apply_caddy: !direct,
                apply_tunnel: !local_only,
                ids: Some(ids.clone()),
            };
            // Fed through `project.network.services` rather than upserted to
            // the registry directly, so pass 1 actually expands its `hosts`
            // and (for a public service) starts its tunnel and appends the
            // established tunnel host — upserting ahead of reconcile would
            // only freeze the pre-expansion declaration into the registry.
            let (mut project, plugins) = ctx.load_project().unwrap_or_else(|_| (empty_project(), Vec::new()));
            project.network.services.insert(id.clone(), declaration);
            let mut env = std::env::vars().collect::<HashMap<_, _>>();
            let cancel = CancellationToken::new();
            let report = ctx
                .reconciler()
                .reconcile(&project, &plugins, &[], &mut env, &options, &cancel)
                .await?;

            let entries = ctx.registry().list(&RegistryFilter {
                public_only: false,
                ids: Some(ids),
            })?;
            emit(json, &entries, || {
                entries
                    .first()
                    .map(|e| {
                        format!(
                            "exposed {id} -> local http://{}.localhost  tunnel={}",
                            id,
                            e.tunnel_url.as_deref().unwrap_or("(none)")
                        )
                    })
                    .unwrap_or_else(|| {
                        format!("exposed {id}, but it is no longer in the registry ({} report entries)", report.entries.len())
                    })
            });
            Ok(())
        }
    }
}

fn resolve_expose_target(ctx: &Ctx, target: &str) -> Result<String> {
    let entries = ctx.registry().list(&RegistryFilter::default())?;
    if entries.iter().any(|e| e.declaration.id == target) {
        return Ok(target.to_string());
    }
    if let Ok(port) = target.parse::<u16>() {
        let candidate = format!("port-{port}");
        if entries.iter().any(|e| e.declaration.id == candidate) {
            return Ok(candidate);
        }
        let dial = format!("127.0.0.1:{port}");
        if let Some(entry) = entries.iter().find(|e| e.declaration.dial.as_deref() == Some(dial.as_str())) {
            return Ok(entry.declaration.id.clone());
        }
    }
    bail!("no exposed service matches {target:?}")
}

fn empty_project() -> ProjectConfig {
    ProjectConfig::from_str("version: 1\nproject:\n  name: ad-hoc\n", std::path::Path::new("<none>"))
        .expect("the literal fallback project config is valid YAML")
}

async fn cmd_net(action: NetAction, json: bool) -> Result<()> {
    let ctx = Ctx::resolve()?;
    let cancel = CancellationToken::new();

    match action {
        NetAction::Apply { caddy, tunnel, ids } => {
            let (project, plugins) = ctx.load_project()?;
            let options = ReconcileOptions {
                apply_caddy: caddy,
                apply_tunnel: tunnel,
                ids: if ids.is_empty() { None } else { Some(ids.into_iter().collect()) },
            };
            let mut env = std::env::vars().collect::<HashMap<_, _>>();
            let report = ctx
                .reconciler()
                .reconcile(&project, &plugins, &[], &mut env, &options, &cancel)
                .await?;
            print_reconcile_report(json, &report);
            if report.has_errors() {
                bail!("reconcile completed with errors");
            }
            Ok(())
        }
        NetAction::Refresh => {
            let (project, plugins) = ctx.load_project()?;
            let mut env = std::env::vars().collect::<HashMap<_, _>>();
            let report = ctx
                .reconciler()
                .reconcile(&project, &plugins, &[], &mut env, &ReconcileOptions::default(), &cancel)
                .await?;
            print_reconcile_report(json, &report);
            if report.has_errors() {
                bail!("reconcile completed with errors");
            }
            Ok(())
        }
        NetAction::Discover => {
            let loopback = discovery::discover_loopback(&ctx.candidate_ports()).await;
            let docker = discovery::discover_docker().await;
            let found: Vec<_> = loopback.into_iter().chain(docker).collect();
            emit(json, &found, || {
                if found.is_empty() {
                    "no undeclared services discovered".to_string()
                } else {
                    found
                        .iter()
                        .map(|f| format!("{} ({}) via {}", f.id, f.dial, f.source))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            });
            Ok(())
        }
        NetAction::Start { id } => {
            let (project, plugins) = ctx.load_project()?;
            let options = ReconcileOptions {
                apply_caddy: true,
                apply_tunnel: true,
                ids: Some([id].into_iter().collect()),
            };
            let mut env = std::env::vars().collect::<HashMap<_, _>>();
            let report = ctx
                .reconciler()
                .reconcile(&project, &plugins, &[], &mut env, &options, &cancel)
                .await?;
            print_reconcile_report(json, &report);
            Ok(())
        }
        NetAction::Stop { id } => {
            let report = ctx.reconciler().remove(&[id], false, &cancel).await?;
            print_reconcile_report(json, &report);
            Ok(())
        }
        NetAction::Open { id } => {
            let entries = ctx.registry().list(&RegistryFilter {
                public_only: false,
                ids: Some([id.clone()].into_iter().collect()),
            })?;
            let entry = entries.first().with_context(|| format!("no registry entry for {id:?}"))?;
            emit(json, entry, || {
                format!(
                    "local: {}\ntunnel: {}",
                    entry.declaration.dial.as_deref().unwrap_or("-"),
                    entry.tunnel_url.as_deref().unwrap_or("(none)")
                )
            });
            Ok(())
        }
        NetAction::Remove { id } => {
            let report = ctx.reconciler().remove(&[id], true, &cancel).await?;
            print_reconcile_report(json, &report);
            Ok(())
        }
        NetAction::Clean => {
            let (project, plugins) = ctx.load_project().unwrap_or_else(|_| (empty_project(), Vec::new()));
            let declared = Reconciler::declared_set(&project, &plugins);
            let declared_ids: std::collections::HashSet<_> = declared.iter().map(|d| d.id.clone()).collect();
            let snapshot = ctx.registry().snapshot()?;
            let orphaned: Vec<String> = snapshot
                .into_iter()
                .map(|e| e.declaration.id)
                .filter(|id| !declared_ids.contains(id))
                .collect();
            let report = ctx.reconciler().remove(&orphaned, true, &cancel).await?;
            print_reconcile_report(json, &report);
            Ok(())
        }
        NetAction::Reset => {
            let all: Vec<String> = ctx.registry().snapshot()?.into_iter().map(|e| e.declaration.id).collect();
            let report = ctx.reconciler().remove(&all, true, &cancel).await?;
            print_reconcile_report(json, &report);
            Ok(())
        }
        NetAction::Tunnel { action } => cmd_net_tunnel(&ctx, action, json, &cancel).await,
    }
}

async fn cmd_net_tunnel(ctx: &Ctx, action: TunnelAction, json: bool, cancel: &CancellationToken) -> Result<()> {
    match action {
        TunnelAction::Start => {
            let (project, plugins) = ctx.load_project()?;
            let options = ReconcileOptions {
                apply_caddy: false,
                apply_tunnel: true,
                ids: None,
            };
            let mut env = std::env::vars().collect::<HashMap<_, _>>();
            let report = ctx
                .reconciler()
                .reconcile(&project, &plugins, &[], &mut env, &options, cancel)
                .await?;
            print_reconcile_report(json, &report);
            Ok(())
        }
        TunnelAction::Stop => {
            let ids: Vec<String> = ctx.registry().snapshot()?.into_iter().map(|e| e.declaration.id).collect();
            let tunnels = ctx.tunnels();
            let mut stopped = Vec::new();
            for id in &ids {
                tunnels.stop(id).await.ok();
                ctx.registry().set_tunnel(id, None).ok();
                stopped.push(id.clone());
            }
            emit(json, &stopped, || format!("stopped {} tunnel session(s)", stopped.len()));
            Ok(())
        }
        TunnelAction::Reset => {
            let ids: Vec<String> = ctx.registry().snapshot()?.into_iter().map(|e| e.declaration.id).collect();
            let tunnels = ctx.tunnels();
            for id in &ids {
                tunnels.stop(id).await.ok();
                ctx.registry().set_tunnel(id, None).ok();
            }
            emit(json, &ids, || format!("reset {} tunnel session(s)", ids.len()));
            Ok(())
        }
    }
}

fn print_reconcile_report(json: bool, report: &asd_reconcile::ReconcileReport) {
    emit(json, report, || {
        let mut lines: Vec<String> = report
            .entries
            .iter()
            .map(|e| format!("{} {} {}", e.kind.glyph(), e.id, e.message))
            .collect();
        lines.push(format!("routes applied: {}", report.routes_applied));
        if !report.dotenv_keys_written.is_empty() {
            lines.push(format!("dotenv keys written: {}", report.dotenv_keys_written.join(", ")));
        }
        lines.join("\n")
    });
}

async fn cmd_daemon_group(
    group: &str,
    binary: &str,
    default_args: &[&str],
    action: DaemonGroupAction,
    json: bool,
) -> Result<()> {
    let ctx = Ctx::resolve()?;
    let pid_file = ctx.paths.log_dir.join(format!("{group}.pid"));
    let log_file = ctx.paths.log_dir.join(format!("{group}.log"));
    let cancel = CancellationToken::new();

    match action {
        DaemonGroupAction::Start => {
            let spec = DaemonSpec {
                binary: PathBuf::from(binary),
                argv: default_args.iter().map(|s| s.to_string()).collect(),
                env: HashMap::new(),
                cwd: None,
                pid_file: pid_file.clone(),
                log_file,
                readiness: None,
                readiness_policy: asd_readiness::PollPolicy::default(),
                min_uptime: Duration::from_secs(2),
                retry_policy: RetryPolicy::OnFailure,
                startup_grace: Duration::from_millis(200),
            };
            let outcome = asd_supervisor::spawn_daemon(spec, &cancel).await?;
            let message = match &outcome {
                DaemonOutcome::AlreadyRunning { pid } => format!("{group} already running (pid {pid})"),
                DaemonOutcome::Started { pid, ready } => format!("{group} started (pid {pid}, ready={ready})"),
                DaemonOutcome::Failed { reason } => format!("{group} failed to start: {reason}"),
            };
            let failed = matches!(outcome, DaemonOutcome::Failed { .. });
            emit(json, &message, || message.clone());
            if failed {
                bail!("{message}");
            }
            Ok(())
        }
        DaemonGroupAction::Stop => {
            if let Some(pid) = asd_supervisor::PidFile::read_live(&pid_file)? {
                asd_supervisor::terminate(pid, true, Duration::from_secs(5)).await?;
            }
            asd_supervisor::PidFile::remove(&pid_file)?;
            emit(json, &group, || format!("{group} stopped"));
            Ok(())
        }
    }
}

async fn cmd_caddy(action: CaddyAction, json: bool) -> Result<()> {
    let ctx = Ctx::resolve()?;
    let proxy = ctx.proxy();
    let cancel = CancellationToken::new();

    match action {
        CaddyAction::Start => {
            let outcome = proxy.start(Vec::new(), &cancel).await?;
            emit(json, &format!("{outcome:?}"), || format!("caddy: {outcome:?}"));
            Ok(())
        }
        CaddyAction::Stop => {
            proxy.stop().await?;
            emit(json, &"stopped", || "caddy stopped".to_string());
            Ok(())
        }
        CaddyAction::Restart => {
            let snapshot = ctx.registry().snapshot()?;
            let (project, _plugins) = ctx.load_project().unwrap_or_else(|_| (empty_project(), Vec::new()));
            let env = std::env::vars().collect::<HashMap<_, _>>();
            let project_auth = project_basic_auth(&project, &env);
            let routes = asd_proxy::build_routes(&snapshot, project_auth.as_ref());
            proxy.apply(&routes, Vec::new(), &cancel).await?;
            emit(json, &routes, || format!("caddy restarted with {} route(s)", routes.len()));
            Ok(())
        }
        CaddyAction::Config => {
            let snapshot = ctx.registry().snapshot()?;
            let (project, _plugins) = ctx.load_project().unwrap_or_else(|_| (empty_project(), Vec::new()));
            let env = std::env::vars().collect::<HashMap<_, _>>();
            let project_auth = project_basic_auth(&project, &env);
            let routes = asd_proxy::build_routes(&snapshot, project_auth.as_ref());
            let rendered = asd_proxy::render_static_config(&routes);
            emit(json, &routes, || rendered.clone());
            Ok(())
        }
    }
}

fn project_basic_auth(project: &ProjectConfig, env: &HashMap<String, String>) -> Option<asd_proxy::ResolvedBasicAuth> {
    let policy = project.network.caddy.basic_auth.as_ref()?;
    if !policy.enabled {
        return None;
    }
    let username = env.get("ASD_BASIC_AUTH_USERNAME")?;
    let password = env.get("ASD_BASIC_AUTH_PASSWORD")?;
    let realm = policy.realm.clone().unwrap_or_else(|| "asd".to_string());
    asd_proxy::ResolvedBasicAuth::from_plaintext(username, password, realm).ok()
}

fn cmd_auth(action: AuthAction, json: bool) -> Result<()> {
    let ctx = Ctx::resolve()?;
    let store = ctx.credentials();

    match action {
        AuthAction::Status => {
            let default = store.default_credential()?;
            emit(json, &default, || match &default {
                Some(c) => format!(
                    "{} ({:?}) -> {}@{}:{}  expires={}",
                    c.name,
                    c.kind,
                    c.client_id,
                    c.host,
                    c.port,
                    c.expires_at.map(|e| e.to_rfc3339()).unwrap_or_else(|| "never".to_string())
                ),
                None => "no default credential configured".to_string(),
            });
            Ok(())
        }
        AuthAction::Credentials => {
            let list = store.list()?;
            emit(json, &list, || {
                if list.is_empty() {
                    "no stored credentials".to_string()
                } else {
                    list.iter()
                        .map(|c| format!("{} ({:?}) {}@{}:{}", c.name, c.kind, c.client_id, c.host, c.port))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            });
            Ok(())
        }
        AuthAction::Switch { name } => {
            store.set_default(&name)?;
            emit(json, &name, || format!("default credential set to {name}"));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_ctx(dir: &tempfile::TempDir) -> Ctx {
        let root = dir.path();
        Ctx {
            paths: Paths {
                asd_home: root.join("home"),
                workspace_dir: root.join("workspace"),
                bin_dir: root.join("home").join("bin"),
                log_dir: root.join("workspace").join("logs"),
            },
        }
    }

    #[test]
    fn parses_bare_expose_with_port() {
        let cli = Cli::try_parse_from(["asd", "expose", "3000", "--name", "api"]).unwrap();
        match cli.command {
            Commands::Expose { port, name, action, .. } => {
                assert_eq!(port, Some(3000));
                assert_eq!(name.as_deref(), Some("api"));
                assert!(action.is_none());
            }
            other => panic!("expected Expose, got {other:?}"),
        }
    }

    #[test]
    fn parses_expose_list_subcommand() {
        let cli = Cli::try_parse_from(["asd", "expose", "list"]).unwrap();
        match cli.command {
            Commands::Expose { port, action, .. } => {
                assert!(port.is_none());
                assert!(matches!(action, Some(ExposeAction::List)));
            }
            other => panic!("expected Expose, got {other:?}"),
        }
    }

    #[test]
    fn parses_net_apply_with_ids() {
        let cli = Cli::try_parse_from(["asd", "net", "apply", "--ids", "a,b,c"]).unwrap();
        match cli.command {
            Commands::Net { action: NetAction::Apply { ids, caddy, tunnel } } => {
                assert_eq!(ids, vec!["a", "b", "c"]);
                assert!(caddy);
                assert!(tunnel);
            }
            other => panic!("expected Net Apply, got {other:?}"),
        }
    }

    #[test]
    fn global_json_flag_applies_before_or_after_subcommand() {
        let cli = Cli::try_parse_from(["asd", "--json", "auth", "status"]).unwrap();
        assert!(cli.json);
        let cli = Cli::try_parse_from(["asd", "auth", "status", "--json"]).unwrap();
        assert!(cli.json);
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["asd", "bogus"]).is_err());
    }

    #[test]
    fn which_finds_binary_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin_path = dir.path().join("mytool");
        std::fs::write(&bin_path, b"#!/bin/sh\n").unwrap();
        let original = std::env::var_os("PATH");
        std::env::set_var("PATH", dir.path());
        let found = which("mytool");
        if let Some(path) = original {
            std::env::set_var("PATH", path);
        }
        assert_eq!(found, Some(bin_path));
    }

    #[test]
    fn which_returns_none_for_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let original = std::env::var_os("PATH");
        std::env::set_var("PATH", dir.path());
        let found = which("definitely-not-a-real-binary");
        if let Some(path) = original {
            std::env::set_var("PATH", path);
        }
        assert!(found.is_none());
    }

    #[test]
    fn empty_project_parses_with_ad_hoc_name() {
        let project = empty_project();
        assert_eq!(project.project.name, "ad-hoc");
    }

    #[test]
    fn resolve_expose_target_matches_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = fake_ctx(&dir);
        let declaration = ServiceDeclaration {
            id: "my-api".to_string(),
            dial: Some("127.0.0.1:4000".to_string()),
            ..ServiceDeclaration::default()
        };
        ctx.registry().upsert(declaration).unwrap();

        assert_eq!(resolve_expose_target(&ctx, "my-api").unwrap(), "my-api");
        assert_eq!(resolve_expose_target(&ctx, "4000").unwrap(), "my-api");
    }

    #[test]
    fn resolve_expose_target_matches_generated_port_id() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = fake_ctx(&dir);
        let declaration = ServiceDeclaration {
            id: "port-5000".to_string(),
            dial: Some("127.0.0.1:5000".to_string()),
            ..ServiceDeclaration::default()
        };
        ctx.registry().upsert(declaration).unwrap();

        assert_eq!(resolve_expose_target(&ctx, "5000").unwrap(), "port-5000");
    }

    #[test]
    fn resolve_expose_target_errors_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = fake_ctx(&dir);
        assert!(resolve_expose_target(&ctx, "nope").is_err());
    }
}

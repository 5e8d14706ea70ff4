//! Template / macro expander for service declarations and plugin
//! manifests: `${{ macro.* }}` / `${{ env.* }}` (primary) and the legacy
//! `${VAR}` form.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;

use asd_credentials::TunnelCredential;
use rand::Rng;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("macro call {0:?} is malformed")]
    MalformedCall(String),
    #[error("unknown macro {0:?}")]
    UnknownMacro(String),
    #[error("could not allocate a free port in range {0}-{1}")]
    PortExhausted(u16, u16),
    #[error("bcrypt failed: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

pub type Result<T> = std::result::Result<T, TemplateError>;

/// One successful `persist: true` macro evaluation, to be flushed into the
/// project dotenv by the caller (this crate never touches disk itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub key: String,
    pub value: String,
}

/// Everything a single expansion pass needs: the live env overlay (dotenv
/// + process env, already merged by the caller), the active tunnel
/// credential (if any), and the enclosing service's subdomain (if any).
pub struct Expander<'a> {
    env: &'a mut HashMap<String, String>,
    credential: Option<&'a TunnelCredential>,
    subdomain: Option<&'a str>,
    reserved_ports: HashMap<String, HashSet<u16>>,
    pub pending_writes: Vec<PendingWrite>,
}

const DEFAULT_PORT_RANGE: (u16, u16) = (1024, 65535);

impl<'a> Expander<'a> {
    pub fn new(
        env: &'a mut HashMap<String, String>,
        credential: Option<&'a TunnelCredential>,
        subdomain: Option<&'a str>,
    ) -> Self {
        Self {
            env,
            credential,
            subdomain,
            reserved_ports: HashMap::new(),
            pending_writes: Vec::new(),
        }
    }

    /// Switches the enclosing service for subsequent `expand` calls while
    /// keeping the same port-allocation scope and pending-write list — lets
    /// a reconcile pass share one scope across every declaration it expands.
    pub fn set_subdomain(&mut self, subdomain: Option<&'a str>) {
        self.subdomain = subdomain;
    }

    /// Expands every `${{ ... }}` block, then every legacy `${ ... }` block,
    /// in a single pure pass over `input`.
    pub fn expand(&mut self, input: &str) -> Result<String> {
        let double_brace = Regex::new(r"\$\{\{\s*(.*?)\s*\}\}").unwrap();
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in double_brace.captures_iter(input) {
            let m = caps.get(0).unwrap();
            out.push_str(&input[last..m.start()]);
            out.push_str(&self.eval(caps.get(1).unwrap().as_str())?);
            last = m.end();
        }
        out.push_str(&input[last..]);

        let single_brace = Regex::new(r"\$\{\s*([^{}]*?)\s*\}").unwrap();
        let identifier = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
        let input2 = out;
        let mut out2 = String::with_capacity(input2.len());
        let mut last = 0;
        for caps in single_brace.captures_iter(&input2) {
            let m = caps.get(0).unwrap();
            out2.push_str(&input2[last..m.start()]);
            let expr = caps.get(1).unwrap().as_str();
            // Disambiguation rule: a bare identifier, no dot and no parens,
            // is always an env lookup.
            let value = if identifier.is_match(expr) {
                self.lookup_env(expr)
            } else {
                self.eval(expr)?
            };
            out2.push_str(&value);
            last = m.end();
        }
        out2.push_str(&input2[last..]);

        Ok(out2)
    }

    fn lookup_env(&self, name: &str) -> String {
        self.env.get(name).cloned().unwrap_or_default()
    }

    fn eval(&mut self, expr: &str) -> Result<String> {
        if let Some(name) = expr.strip_prefix("!env.") {
            let present = !self.lookup_env(name).is_empty();
            return Ok(if present { String::new() } else { "true".to_string() });
        }
        if let Some(name) = expr.strip_prefix("env.") {
            return Ok(self.lookup_env(name));
        }
        if expr == "core.isDockerAvailable()" {
            return Ok(docker_available().to_string());
        }
        if let Some(rest) = expr.strip_prefix("macro.") {
            return self.eval_macro(rest);
        }
        Err(TemplateError::UnknownMacro(expr.to_string()))
    }

    fn eval_macro(&mut self, call: &str) -> Result<String> {
        let (name, args) = parse_call(call)?;
        match name.as_str() {
            "getRandomPort" => self.macro_get_random_port(&args),
            "getRandomPorts" => self.macro_get_random_ports(&args),
            "getPortRange" => self.macro_get_port_range(&args),
            "getRandomString" => Ok(macro_get_random_string(&args)),
            "bcrypt" => macro_bcrypt(&args),
            "bcryptEnv" => self.macro_bcrypt_env(&args),
            "tunnelHost" => Ok(self.macro_tunnel_host(&args)),
            "tunnelClientId" => Ok(self.credential.map(|c| c.client_id.clone()).unwrap_or_default()),
            "tunnelEndpoint" => Ok(self.macro_tunnel_endpoint()),
            "exposedOrigin" => Ok(self.macro_exposed_origin(&args, false)),
            "exposedOriginWithAuth" => Ok(self.macro_exposed_origin(&args, true)),
            other => Err(TemplateError::UnknownMacro(format!("macro.{other}"))),
        }
    }

    fn macro_get_random_port(&mut self, args: &[String]) -> Result<String> {
        let name = args.first().filter(|s| !s.is_empty());
        let range = args.get(1).filter(|s| !s.is_empty());
        let persist = args.get(2).map(|s| s == "true").unwrap_or(false);
        let scope = args.get(3).cloned().unwrap_or_default();

        let (min, max) = parse_range(range)?;
        let port = self.allocate_port(&scope, min, max)?;

        if let Some(name) = name {
            self.env.insert(name.clone(), port.to_string());
            if persist {
                self.pending_writes.push(PendingWrite {
                    key: name.clone(),
                    value: port.to_string(),
                });
            }
        }
        Ok(port.to_string())
    }

    fn macro_get_random_ports(&mut self, args: &[String]) -> Result<String> {
        let n: usize = args
            .first()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TemplateError::MalformedCall("getRandomPorts".to_string()))?;
        let sep = args.get(1).cloned().unwrap_or_else(|| ",".to_string());
        let range = args.get(2).filter(|s| !s.is_empty());
        let scope = args.get(3).cloned().unwrap_or_default();
        let (min, max) = parse_range(range)?;

        let mut ports = Vec::with_capacity(n);
        for _ in 0..n {
            ports.push(self.allocate_port(&scope, min, max)?.to_string());
        }
        Ok(ports.join(&sep))
    }

    fn macro_get_port_range(&mut self, args: &[String]) -> Result<String> {
        let size: u16 = args
            .first()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TemplateError::MalformedCall("getPortRange".to_string()))?;
        let min = args
            .get(1)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT_RANGE.0);
        let max = args
            .get(2)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT_RANGE.1);
        let name = args.get(3).filter(|s| !s.is_empty());
        let persist = args.get(4).map(|s| s == "true").unwrap_or(false);
        let scope = args.get(5).cloned().unwrap_or_default();

        let start = self.allocate_contiguous_range(&scope, min, max, size)?;
        let value = format!("{start}-{}", start + size - 1);

        if let Some(name) = name {
            self.env.insert(name.clone(), value.clone());
            if persist {
                self.pending_writes.push(PendingWrite {
                    key: name.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(value)
    }

    fn allocate_port(&mut self, scope: &str, min: u16, max: u16) -> Result<u16> {
        let reserved = self.reserved_ports.entry(scope.to_string()).or_default();
        for _ in 0..(max - min).saturating_add(1) {
            let candidate = rand::thread_rng().gen_range(min..=max);
            if reserved.contains(&candidate) {
                continue;
            }
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", candidate)) {
                drop(listener);
                reserved.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(TemplateError::PortExhausted(min, max))
    }

    fn allocate_contiguous_range(
        &mut self,
        scope: &str,
        min: u16,
        max: u16,
        size: u16,
    ) -> Result<u16> {
        let reserved = self.reserved_ports.entry(scope.to_string()).or_default();
        'start: for start in min..=max.saturating_sub(size.saturating_sub(1)) {
            for offset in 0..size {
                let port = start + offset;
                if reserved.contains(&port) || TcpListener::bind(("127.0.0.1", port)).is_err() {
                    continue 'start;
                }
            }
            for offset in 0..size {
                reserved.insert(start + offset);
            }
            return Ok(start);
        }
        Err(TemplateError::PortExhausted(min, max))
    }

    fn macro_bcrypt_env(&self, args: &[String]) -> Result<String> {
        let var_name = args
            .first()
            .ok_or_else(|| TemplateError::MalformedCall("bcryptEnv".to_string()))?;
        let password = self.lookup_env(var_name);
        Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
    }

    fn macro_tunnel_host(&self, args: &[String]) -> String {
        let prefix = args.first().cloned().unwrap_or_default();
        match self.credential {
            Some(c) => format!("{prefix}-{}.{}", c.client_id, c.host),
            None => String::new(),
        }
    }

    fn macro_tunnel_endpoint(&self) -> String {
        match self.credential {
            Some(c) => format!("{}@{}:{}", c.client_id, c.host, c.port),
            None => String::new(),
        }
    }

    fn macro_exposed_origin(&self, args: &[String], with_auth: bool) -> String {
        let prefix = args
            .first()
            .cloned()
            .or_else(|| self.subdomain.map(|s| s.to_string()))
            .unwrap_or_default();
        let credential = match self.credential {
            Some(c) => c,
            None => return String::new(),
        };
        if prefix.is_empty() {
            return String::new();
        }
        let host = format!("{prefix}-{}.{}", credential.client_id, credential.host);
        if with_auth {
            let user = self.lookup_env("ASD_BASIC_AUTH_USERNAME");
            let pass = self.lookup_env("ASD_BASIC_AUTH_PASSWORD");
            if !user.is_empty() {
                return format!("https://{user}:{pass}@{host}");
            }
        }
        format!("https://{host}")
    }
}

fn macro_get_random_string(args: &[String]) -> String {
    let length: usize = args.first().and_then(|s| s.parse().ok()).unwrap_or(16);
    let charset = args.get(1).map(String::as_str).unwrap_or("alnum");
    let prefix = args.get(2).cloned().unwrap_or_default();
    let suffix = args.get(3).cloned().unwrap_or_default();

    let alphabet: &[u8] = match charset {
        "alpha" => b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz",
        "numeric" => b"0123456789",
        "hex" => b"0123456789abcdef",
        _ => b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789",
    };

    let mut rng = rand::thread_rng();
    let body: String = (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..alphabet.len());
            alphabet[idx] as char
        })
        .collect();

    format!("{prefix}{body}{suffix}")
}

fn macro_bcrypt(args: &[String]) -> Result<String> {
    let password = args
        .first()
        .ok_or_else(|| TemplateError::MalformedCall("bcrypt".to_string()))?;
    let cost = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(bcrypt::DEFAULT_COST);
    Ok(bcrypt::hash(password, cost)?)
}

fn parse_range(range: Option<&String>) -> Result<(u16, u16)> {
    match range {
        None => Ok(DEFAULT_PORT_RANGE),
        Some(r) => {
            let (min, max) = r
                .split_once('-')
                .ok_or_else(|| TemplateError::MalformedCall(format!("range {r:?}")))?;
            let min: u16 = min
                .parse()
                .map_err(|_| TemplateError::MalformedCall(format!("range {r:?}")))?;
            let max: u16 = max
                .parse()
                .map_err(|_| TemplateError::MalformedCall(format!("range {r:?}")))?;
            Ok((min, max))
        }
    }
}

/// Splits `name(arg1, arg2, ...)` into its call name and trimmed,
/// quote-stripped arguments. No nested parens are expected in this
/// grammar, so a flat top-level comma split is sufficient.
fn parse_call(call: &str) -> Result<(String, Vec<String>)> {
    let open = call
        .find('(')
        .ok_or_else(|| TemplateError::MalformedCall(call.to_string()))?;
    if !call.ends_with(')') {
        return Err(TemplateError::MalformedCall(call.to_string()));
    }
    let name = call[..open].to_string();
    let inner = &call[open + 1..call.len() - 1];
    let args = if inner.trim().is_empty() {
        Vec::new()
    } else {
        inner
            .split(',')
            .map(|a| {
                let trimmed = a.trim();
                trimmed
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .unwrap_or(trimmed)
                    .to_string()
            })
            .collect()
    };
    Ok((name, args))
}

/// Best-effort, short-timeout docker availability probe. On Unix, checks
/// for a reachable daemon socket; elsewhere, always reports unavailable
/// rather than shelling out to `docker` with no portable timeout.
#[cfg(unix)]
fn docker_available() -> bool {
    std::os::unix::net::UnixStream::connect("/var/run/docker.sock").is_ok()
}

#[cfg(not(unix))]
fn docker_available() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use asd_credentials::CredentialKind;

    fn credential() -> TunnelCredential {
        TunnelCredential {
            name: "default".to_string(),
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
    fn env_lookup_returns_empty_for_missing_var() {
        let mut env = HashMap::new();
        let mut expander = Expander::new(&mut env, None, None);
        assert_eq!(expander.expand("${{ env.MISSING }}").unwrap(), "");
    }

    #[test]
    fn env_lookup_resolves_present_var() {
        let mut env = HashMap::new();
        env.insert("PORT".to_string(), "3000".to_string());
        let mut expander = Expander::new(&mut env, None, None);
        assert_eq!(expander.expand("port=${{ env.PORT }}").unwrap(), "port=3000");
    }

    #[test]
    fn bang_env_reports_absence() {
        let mut env = HashMap::new();
        let mut expander = Expander::new(&mut env, None, None);
        assert_eq!(expander.expand("${{ !env.MISSING }}").unwrap(), "true");
    }

    #[test]
    fn legacy_bare_identifier_is_env_lookup() {
        let mut env = HashMap::new();
        env.insert("HOST".to_string(), "localhost".to_string());
        let mut expander = Expander::new(&mut env, None, None);
        assert_eq!(expander.expand("${HOST}").unwrap(), "localhost");
    }

    #[test]
    fn exposed_origin_uses_subdomain_and_credential() {
        let cred = credential();
        let mut env = HashMap::new();
        let mut expander = Expander::new(&mut env, Some(&cred), Some("myapp"));
        assert_eq!(
            expander.expand("${{ macro.exposedOrigin() }}").unwrap(),
            "https://myapp-fkmc.cicd.eu1.asd.engineer"
        );
    }

    #[test]
    fn exposed_origin_without_credential_is_empty() {
        let mut env = HashMap::new();
        let mut expander = Expander::new(&mut env, None, Some("myapp"));
        assert_eq!(expander.expand("${{ macro.exposedOrigin() }}").unwrap(), "");
    }

    #[test]
    fn tunnel_client_id_and_endpoint() {
        let cred = credential();
        let mut env = HashMap::new();
        let mut expander = Expander::new(&mut env, Some(&cred), None);
        assert_eq!(
            expander.expand("${{ macro.tunnelClientId() }}").unwrap(),
            "fkmc"
        );
        assert_eq!(
            expander.expand("${{ macro.tunnelEndpoint() }}").unwrap(),
            "fkmc@cicd.eu1.asd.engineer:22"
        );
    }

    #[test]
    fn get_random_port_persists_into_env_and_pending_writes() {
        let mut env = HashMap::new();
        let mut expander = Expander::new(&mut env, None, None);
        let out = expander
            .expand("${{ macro.getRandomPort(\"APP_PORT\", \"\", \"true\") }}")
            .unwrap();
        let port: u16 = out.parse().unwrap();
        assert!(port > 0);
        assert_eq!(expander.pending_writes.len(), 1);
        assert_eq!(expander.pending_writes[0].key, "APP_PORT");
    }

    #[test]
    fn get_random_ports_returns_distinct_values() {
        let mut env = HashMap::new();
        let mut expander = Expander::new(&mut env, None, None);
        let out = expander.expand("${{ macro.getRandomPorts(3) }}").unwrap();
        let parts: Vec<&str> = out.split(',').collect();
        assert_eq!(parts.len(), 3);
        let unique: HashSet<&str> = parts.iter().cloned().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn get_random_string_respects_length_and_affixes() {
        let mut env = HashMap::new();
        let mut expander = Expander::new(&mut env, None, None);
        let out = expander
            .expand("${{ macro.getRandomString(8, \"numeric\", \"pre-\", \"-post\") }}")
            .unwrap();
        assert!(out.starts_with("pre-"));
        assert!(out.ends_with("-post"));
        let middle = &out[4..out.len() - 5];
        assert_eq!(middle.len(), 8);
        assert!(middle.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn bcrypt_env_hashes_the_resolved_password() {
        let mut env = HashMap::new();
        env.insert("ASD_BASIC_AUTH_PASSWORD".to_string(), "hunter2".to_string());
        let mut expander = Expander::new(&mut env, None, None);
        let out = expander
            .expand("${{ macro.bcryptEnv(\"ASD_BASIC_AUTH_PASSWORD\") }}")
            .unwrap();
        assert!(bcrypt::verify("hunter2", &out).unwrap());
    }

    #[test]
    fn unknown_macro_is_an_error() {
        let mut env = HashMap::new();
        let mut expander = Expander::new(&mut env, None, None);
        assert!(expander.expand("${{ macro.doesNotExist() }}").is_err());
    }
}

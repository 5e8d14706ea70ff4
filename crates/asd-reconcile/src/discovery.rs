//! Discovered-service probing (spec.md §4.9 step 3): services running on
//! the loopback interface or inside Docker that nothing has declared yet.
//! Probe failures are never fatal — an unreachable Docker daemon or a
//! closed port just means nothing was discovered that way.

use std::net::SocketAddr;
use std::time::Duration;

use asd_registry::DiscoveredService;
use chrono::Utc;

/// Connects to `127.0.0.1:<port>` for each candidate port (typically the
/// per-service port hints from spec.md §6, e.g. `TTYD_PORT`) and reports
/// the ones that accept a connection.
pub async fn discover_loopback(candidate_ports: &[(String, u16)]) -> Vec<DiscoveredService> {
    let mut found = Vec::new();
    for (id, port) in candidate_ports {
        let addr: SocketAddr = match format!("127.0.0.1:{port}").parse() {
            Ok(a) => a,
            Err(_) => continue,
        };
        let connected = tokio::time::timeout(Duration::from_millis(300), tokio::net::TcpStream::connect(addr))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if connected {
            found.push(DiscoveredService {
                id: id.clone(),
                dial: format!("127.0.0.1:{port}"),
                source: "loopback-probe".to_string(),
                detected_at: Utc::now(),
                labels: None,
            });
        }
    }
    found
}

/// Lists running containers via `docker ps` and reports their published
/// host ports. Returns an empty list (not an error) when the `docker`
/// binary is missing or the daemon is unreachable.
pub async fn discover_docker() -> Vec<DiscoveredService> {
    let output = tokio::process::Command::new("docker")
        .args(["ps", "--format", "{{.Names}}|{{.Ports}}"])
        .output()
        .await;

    let Ok(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut found = Vec::new();
    for line in stdout.lines() {
        let Some((name, ports)) = line.split_once('|') else {
            continue;
        };
        if let Some(host_port) = parse_first_host_port(ports) {
            found.push(DiscoveredService {
                id: name.to_string(),
                dial: format!("127.0.0.1:{host_port}"),
                source: "docker".to_string(),
                detected_at: Utc::now(),
                labels: None,
            });
        }
    }
    found
}

/// Extracts the first `host:port->container/tcp`-style mapping's host
/// port from `docker ps`'s `Ports` column, e.g. `0.0.0.0:8080->80/tcp`.
fn parse_first_host_port(ports: &str) -> Option<u16> {
    ports
        .split(", ")
        .find_map(|mapping| mapping.split("->").next())
        .and_then(|host_side| host_side.rsplit_once(':'))
        .and_then(|(_, port)| port.parse().ok())
}

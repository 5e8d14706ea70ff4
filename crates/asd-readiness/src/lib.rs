//! Readiness primitives shared by the supervisor, the tunnel session
//! manager, and the reverse-proxy controller.
//!
//! Each primitive is bounded by a deadline and a fixed poll interval, and
//! honors a [`tokio_util::sync::CancellationToken`] so an in-flight wait
//! can be abandoned without killing whatever it was probing.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("failed to read log file {path}: {source}")]
    LogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Polling contract shared by every readiness primitive.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_millis(250),
        }
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Poll until ready, the deadline elapses, or `cancel` fires.
    /// Returns `true` iff the condition was observed before either of those.
    async fn wait(&self, policy: PollPolicy, cancel: &CancellationToken) -> bool;
}

/// Run `check` repeatedly on `policy.interval` until it returns true, the
/// total `policy.timeout` budget elapses, or `cancel` fires.
async fn poll_until<F, Fut>(policy: PollPolicy, cancel: &CancellationToken, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + policy.timeout;

    loop {
        if cancel.is_cancelled() {
            return false;
        }

        if check().await {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let sleep_for = policy.interval.min(remaining);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = cancel.cancelled() => return false,
        }
    }
}

/// HTTP readiness: GET the URL, treat `[200, 500)` as ready. Admin
/// endpoints commonly answer 401/404 while perfectly healthy, so only a
/// 5xx or a transport error counts as "not ready".
pub struct HttpReadiness {
    pub url: String,
    client: reqwest::Client,
}

impl HttpReadiness {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadiness {
    async fn wait(&self, policy: PollPolicy, cancel: &CancellationToken) -> bool {
        poll_until(policy, cancel, || async {
            match self.client.get(&self.url).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    (200..500).contains(&status)
                }
                Err(_) => false,
            }
        })
        .await
    }
}

/// TCP readiness: ready on first successful connect.
pub struct TcpReadiness {
    pub addr: SocketAddr,
}

impl TcpReadiness {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl ReadinessProbe for TcpReadiness {
    async fn wait(&self, policy: PollPolicy, cancel: &CancellationToken) -> bool {
        poll_until(policy, cancel, || async {
            tokio::net::TcpStream::connect(self.addr).await.is_ok()
        })
        .await
    }
}

/// Log-regex readiness: tails a growing file from its length at probe
/// start and applies a compiled regex to each newly-appended slice. A
/// match already present before the probe started does not count.
pub struct LogRegexReadiness {
    pub path: PathBuf,
    pub pattern: Regex,
}

impl LogRegexReadiness {
    pub fn new(path: impl Into<PathBuf>, pattern: &str) -> Result<Self, ReadinessError> {
        Ok(Self {
            path: path.into(),
            pattern: Regex::new(pattern)?,
        })
    }

    fn file_len(path: &Path) -> u64 {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    /// Capture the first match appearing after the stored start offset,
    /// reading the file fresh each call (the file is append-only and may
    /// grow between polls).
    pub fn capture_new(&self, start_offset: u64) -> Result<Option<String>, ReadinessError> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Ok(None),
        };
        let len = Self::file_len(&self.path);
        if len <= start_offset {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(start_offset))
            .map_err(|source| ReadinessError::LogRead {
                path: self.path.clone(),
                source,
            })?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(|source| ReadinessError::LogRead {
                path: self.path.clone(),
                source,
            })?;

        Ok(self
            .pattern
            .find(&buf)
            .map(|m| m.as_str().to_string()))
    }
}

#[async_trait]
impl ReadinessProbe for LogRegexReadiness {
    async fn wait(&self, policy: PollPolicy, cancel: &CancellationToken) -> bool {
        let start_offset = Self::file_len(&self.path);
        poll_until(policy, cancel, || async {
            matches!(self.capture_new(start_offset), Ok(Some(_)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            timeout: Duration::from_millis(500),
            interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn tcp_readiness_fails_on_closed_port() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let probe = TcpReadiness::new(addr);
        let cancel = CancellationToken::new();
        assert!(!probe.wait(fast_policy(), &cancel).await);
    }

    #[tokio::test]
    async fn tcp_readiness_succeeds_on_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });
        let probe = TcpReadiness::new(addr);
        let cancel = CancellationToken::new();
        assert!(probe.wait(fast_policy(), &cancel).await);
    }

    #[tokio::test]
    async fn cancellation_stops_the_poll_early() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let probe = TcpReadiness::new(addr);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        assert!(!probe.wait(fast_policy(), &cancel).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn log_regex_ignores_preexisting_content() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "https://already-here.example.com").unwrap();
        file.flush().unwrap();

        let probe = LogRegexReadiness::new(file.path(), r"https?://[^\s]+").unwrap();
        let start_offset = LogRegexReadiness::file_len(file.path());

        // Nothing new yet.
        assert_eq!(probe.capture_new(start_offset).unwrap(), None);

        writeln!(file, "https://fresh.example.com assigned").unwrap();
        file.flush().unwrap();

        let captured = probe.capture_new(start_offset).unwrap();
        assert_eq!(captured.as_deref(), Some("https://fresh.example.com"));
    }

    #[tokio::test]
    async fn log_regex_wait_matches_content_written_after_start() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        let probe = LogRegexReadiness::new(&path, r"assigned public url: \S+").unwrap();
        let cancel = CancellationToken::new();

        let write_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&write_path)
                .unwrap();
            writeln!(f, "assigned public url: https://x.example.com").unwrap();
        });

        assert!(probe.wait(fast_policy(), &cancel).await);
    }
}

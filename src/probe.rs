//! Liveness probes.
//!
//! Every call opens its own transient connection and always returns exactly
//! one [`ProbeOutcome`]; failures are classified, never raised.
use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::types::{Address, ProbeOutcome};

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, address: Address, timeout: Duration) -> ProbeOutcome;
}

/// Which probe the CLI/config asks for.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    #[default]
    Http,
    Tcp,
}

impl ProbeMethod {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Tcp => 22,
        }
    }

    pub fn build(self, port: u16, path: &str) -> Arc<dyn LivenessProbe> {
        match self {
            Self::Http => Arc::new(HttpProbe::new(port, path)),
            Self::Tcp => Arc::new(TcpProbe::new(port)),
        }
    }
}

/// `GET http://<address>:<port><path>`; any 2xx counts as alive.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    port: u16,
    path: String,
}

impl HttpProbe {
    pub fn new(port: u16, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self { port, path }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(80, "/")
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self, address: Address, timeout: Duration) -> ProbeOutcome {
        let client = match reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
        {
            Ok(c) => c,
            Err(e) => return ProbeOutcome::error(address, format!("http client: {}", error_chain(&e))),
        };

        let url = format!("http://{address}:{}{}", self.port, self.path);
        let start = Instant::now();
        let res = client.get(&url).send().await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match res {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::reachable(address, latency_ms),
            Ok(resp) => {
                ProbeOutcome::unreachable(address, format!("HTTP status {}", resp.status()))
                    .with_latency(latency_ms)
            }
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() => {
                trace!(%address, error = %e, "http probe failed");
                ProbeOutcome::unreachable(address, error_chain(&e)).with_latency(latency_ms)
            }
            Err(e) => ProbeOutcome::error(address, error_chain(&e)).with_latency(latency_ms),
        }
    }
}

/// Plain TCP connect to a single port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn probe(&self, address: Address, timeout: Duration) -> ProbeOutcome {
        let addr = SocketAddr::new(address.into(), self.port);
        let start = Instant::now();
        let res = time::timeout(timeout, TcpStream::connect(addr)).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match res {
            Ok(Ok(_stream)) => ProbeOutcome::reachable(address, latency_ms),
            Ok(Err(e)) => classify_io(address, &e).with_latency(latency_ms),
            Err(_) => ProbeOutcome::unreachable(
                address,
                format!("connect to port {} timed out after {} ms", self.port, timeout.as_millis()),
            )
            .with_latency(latency_ms),
        }
    }
}

/// OS codes for "too many open files", per process and system wide.
/// `io::ErrorKind` has no stable variant for these.
#[cfg(unix)]
const FD_EXHAUSTED: &[i32] = &[23, 24]; // ENFILE, EMFILE
#[cfg(windows)]
const FD_EXHAUSTED: &[i32] = &[10024]; // WSAEMFILE
#[cfg(not(any(unix, windows)))]
const FD_EXHAUSTED: &[i32] = &[];

/// Local resource problems are errors; everything the network says back is
/// just "unreachable".
fn classify_io(address: Address, e: &io::Error) -> ProbeOutcome {
    let local = matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::AddrNotAvailable | io::ErrorKind::OutOfMemory
    ) || e.raw_os_error().is_some_and(|code| FD_EXHAUSTED.contains(&code));
    if local {
        ProbeOutcome::error(address, e.to_string())
    } else {
        ProbeOutcome::unreachable(address, e.to_string())
    }
}

/// `outer: inner: innermost`
pub(crate) fn error_chain(e: &dyn StdError) -> String {
    let mut out = e.to_string();
    let mut cur = e.source();
    while let Some(src) = cur {
        let s = src.to_string();
        if !out.contains(&s) {
            out.push_str(": ");
            out.push_str(&s);
        }
        cur = src.source();
    }
    out
}

use std::fmt;
use std::net::Ipv4Addr;

use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A scan target. Ranges are IPv4 only.
pub type Address = Ipv4Addr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Reachable,
    Unreachable,
    Error,
}

/// Result of one liveness probe against one address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub address: Address,
    pub status: ProbeStatus,
    pub detail: Option<String>,
    pub latency_ms: u64,
    pub timestamp: String,
    /// Scan cycle this outcome belongs to.
    pub generation: u64,
}

impl ProbeOutcome {
    pub fn new(address: Address, status: ProbeStatus, detail: Option<String>) -> Self {
        Self {
            address,
            status,
            detail,
            latency_ms: 0,
            timestamp: now_rfc3339(),
            generation: 0,
        }
    }

    pub fn reachable(address: Address, latency_ms: u64) -> Self {
        Self {
            latency_ms,
            ..Self::new(address, ProbeStatus::Reachable, None)
        }
    }

    pub fn unreachable(address: Address, detail: impl Into<String>) -> Self {
        Self::new(address, ProbeStatus::Unreachable, Some(detail.into()))
    }

    pub fn error(address: Address, detail: impl Into<String>) -> Self {
        Self::new(address, ProbeStatus::Error, Some(detail.into()))
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn is_reachable(&self) -> bool {
        self.status == ProbeStatus::Reachable
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Success,
    AuthFailure,
    ConnectFailure,
    Timeout,
    /// Dropped mid-flight by a hard cancel.
    Aborted,
}

/// Output of one remote command execution against a reachable address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub address: Address,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub status: SessionStatus,
    pub exit_status: Option<u32>,
    pub detail: Option<String>,
    /// Set when either stream hit the output cap.
    pub truncated: bool,
    pub timestamp: String,
    pub generation: u64,
}

impl SessionResult {
    pub fn new(address: Address, command: impl Into<String>, status: SessionStatus) -> Self {
        Self {
            address,
            command: command.into(),
            stdout: String::new(),
            stderr: String::new(),
            status,
            exit_status: None,
            detail: None,
            truncated: false,
            timestamp: now_rfc3339(),
            generation: 0,
        }
    }

    pub fn failed(
        address: Address,
        command: impl Into<String>,
        status: SessionStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(address, command, status)
        }
    }
}

/// Username/password pair, held in memory only.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A command to run on every reachable host.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub credentials: Credentials,
    pub command: String,
}

impl RemoteCommand {
    pub fn new(credentials: Credentials, command: impl Into<String>) -> Result<Self, ConfigError> {
        let rc = Self {
            credentials,
            command: command.into(),
        };
        rc.validate()?;
        Ok(rc)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.username.trim().is_empty() {
            return Err(ConfigError::InvalidCredentials("username must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(())
    }
}

pub(crate) fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

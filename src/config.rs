//! Command line options and the optional TOML config file.
//!
//! Tunables are `Option`s on the command line so that values from the config
//! file can fill in whatever was not given explicitly; built-in defaults apply
//! last.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::probe::{LivenessProbe, ProbeMethod};
use crate::range::AddressRange;
use crate::scanner::ScanOptions;
use crate::session::{
    HostKeyPolicy, HostKeyVerifier, Profile, SshExecutor, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_SSH_PORT,
};
use crate::types::{Credentials, RemoteCommand};

/// lan-sweep-rs: bounded-concurrency LAN liveness sweeper with SSH command fan-out.
#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "lan-sweep-rs",
    version,
    about = "Bounded-concurrency LAN liveness sweeper with SSH command fan-out.",
    long_about = None
)]
pub struct Opts {
    /// Range to sweep: CIDR (192.168.1.0/24), octet bounds (172.29.0-255.1-254)
    /// or span (10.0.0.5-10.0.0.20). Defaults to the local /24.
    #[arg(short, long)]
    pub range: Option<String>,

    /// Max concurrent liveness probes [default: 1000].
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Max concurrent SSH sessions [default: 32].
    #[arg(long = "session-concurrency")]
    pub session_concurrency: Option<usize>,

    /// Probe timeout in milliseconds [default: 2000].
    #[arg(long = "timeout-ms")]
    pub timeout_ms: Option<u64>,

    /// Timeout for each SSH step in milliseconds [default: 10000].
    #[arg(long = "session-timeout-ms")]
    pub session_timeout_ms: Option<u64>,

    /// Liveness probe kind [default: http].
    #[arg(long, value_enum)]
    pub probe: Option<ProbeMethod>,

    /// Port the probe targets [default: 80 for http, 22 for tcp].
    #[arg(long = "probe-port")]
    pub probe_port: Option<u16>,

    /// Request path for the http probe [default: /].
    #[arg(long = "probe-path")]
    pub probe_path: Option<String>,

    /// Command to run over SSH on every reachable host.
    #[arg(long)]
    pub command: Option<String>,

    /// SSH username.
    #[arg(short, long)]
    pub username: Option<String>,

    /// SSH password.
    #[arg(long, env = "LAN_SWEEP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// SSH port [default: 22].
    #[arg(long = "ssh-port")]
    pub ssh_port: Option<u16>,

    /// Cap on captured stdout/stderr per stream, in bytes [default: 1048576].
    #[arg(long = "max-output-bytes")]
    pub max_output_bytes: Option<usize>,

    /// known_hosts file to check and record host keys in.
    #[arg(long = "known-hosts")]
    pub known_hosts: Option<PathBuf>,

    /// Host key policy. Defaults to strict in production, accept-new in development.
    #[arg(long = "host-key-policy", value_enum)]
    pub host_key_policy: Option<HostKeyPolicy>,

    /// Deployment profile [default: production].
    #[arg(long, value_enum)]
    pub profile: Option<Profile>,

    /// Re-sweep continuously, pausing this many seconds between cycles.
    #[arg(long = "interval-secs")]
    pub interval_secs: Option<u64>,

    /// Write results as pretty JSON to this path.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Serve the HTTP status API instead of running a single sweep.
    #[arg(long, default_value_t = false)]
    pub serve: bool,

    /// Bind address for --serve [default: 127.0.0.1:8080].
    #[arg(long)]
    pub bind: Option<String>,

    /// TOML config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Ignore the config file.
    #[arg(long = "no-config", default_value_t = false)]
    pub no_config: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

/// Values read from the config file. Every field is optional.
///
/// ```toml
/// range = "192.168.1.0/24"
/// concurrency = 500
/// probe = "tcp"
/// probe_port = 22
/// command = "uptime"
/// username = "ops"
/// profile = "development"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub range: Option<String>,
    pub concurrency: Option<usize>,
    pub session_concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub session_timeout_ms: Option<u64>,
    pub probe: Option<ProbeMethod>,
    pub probe_port: Option<u16>,
    pub probe_path: Option<String>,
    pub command: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_port: Option<u16>,
    pub max_output_bytes: Option<usize>,
    pub known_hosts: Option<PathBuf>,
    pub host_key_policy: Option<HostKeyPolicy>,
    pub profile: Option<Profile>,
    pub interval_secs: Option<u64>,
    pub output: Option<PathBuf>,
    pub serve: Option<bool>,
    pub bind: Option<String>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Opts {
    /// Read `--config` (unless `--no-config`) and fill unset options from it.
    pub fn load_config(&mut self) -> Result<(), ConfigError> {
        if self.no_config {
            return Ok(());
        }
        if let Some(path) = self.config.clone() {
            let file = FileConfig::read(&path)?;
            self.merge(&file);
        }
        Ok(())
    }

    /// Options given on the command line win over the config file.
    pub fn merge(&mut self, config: &FileConfig) {
        macro_rules! fill {
            ($($field: ident),+) => {
                $(
                    if self.$field.is_none() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        fill!(
            range, concurrency, session_concurrency, timeout_ms, session_timeout_ms, probe,
            probe_port, probe_path, command, username, password, ssh_port, max_output_bytes,
            known_hosts, host_key_policy, profile, interval_secs, output, bind
        );
        self.serve |= config.serve.unwrap_or(false);
    }

    pub fn scan_options(&self) -> Result<ScanOptions, ConfigError> {
        let defaults = ScanOptions::default();
        let options = ScanOptions {
            concurrency_limit: self.concurrency.unwrap_or(defaults.concurrency_limit),
            session_limit: self.session_concurrency.unwrap_or(defaults.session_limit),
            probe_timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            session_timeout: self
                .session_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.session_timeout),
            interval: self.interval_secs.map(Duration::from_secs),
        };
        options.validate()?;
        Ok(options)
    }

    pub fn remote_command(&self) -> Result<Option<RemoteCommand>, ConfigError> {
        let Some(command) = self.command.as_deref() else {
            return Ok(None);
        };
        let Some(username) = self.username.as_deref() else {
            return Err(ConfigError::InvalidCredentials(
                "a username is required to run a remote command".into(),
            ));
        };
        let credentials = Credentials::new(username, self.password.clone().unwrap_or_default());
        RemoteCommand::new(credentials, command).map(Some)
    }

    pub fn host_key_policy(&self) -> HostKeyPolicy {
        self.host_key_policy
            .unwrap_or_else(|| HostKeyPolicy::for_profile(self.profile.unwrap_or_default()))
    }

    pub fn probe(&self) -> Arc<dyn LivenessProbe> {
        let method = self.probe.unwrap_or_default();
        let port = self.probe_port.unwrap_or_else(|| method.default_port());
        method.build(port, self.probe_path.as_deref().unwrap_or("/"))
    }

    pub fn executor(&self) -> SshExecutor {
        let verifier = HostKeyVerifier::new(self.host_key_policy(), self.known_hosts.clone());
        SshExecutor::new(verifier)
            .with_port(self.ssh_port.unwrap_or(DEFAULT_SSH_PORT))
            .with_max_output_bytes(self.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES))
    }

    /// The configured range, or the local /24 when none was given.
    pub fn address_range(&self) -> anyhow::Result<AddressRange> {
        match self.range.as_deref() {
            Some(r) => Ok(AddressRange::parse(r)?),
            None => AddressRange::local_default().context("no --range given and auto-detection failed"),
        }
    }

    pub fn bind_addr(&self) -> &str {
        self.bind.as_deref().unwrap_or("127.0.0.1:8080")
    }
}

//! Remote command execution over SSH.
//!
//! One session per call: connect, authenticate with a password, run a single
//! command, collect stdout/stderr up to a byte cap, disconnect. Every failure
//! is classified into a [`SessionResult`] instead of being returned as `Err`.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use serde::Deserialize;
use tokio::time;
use tracing::{debug, info, warn};

use crate::probe::error_chain;
use crate::types::{Address, Credentials, SessionResult, SessionStatus};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[async_trait]
pub trait SessionExecutor: Send + Sync {
    async fn execute(
        &self,
        address: Address,
        credentials: &Credentials,
        command: &str,
        timeout: Duration,
    ) -> SessionResult;
}

/// Deployment profile; decides the default host key policy.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Production,
    Development,
}

/// What to do with a server key we have not seen before.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only keys already recorded are accepted.
    Strict,
    /// Trust on first use: unknown keys are recorded, changed keys rejected.
    AcceptNew,
    /// Accept anything. Security sensitive; opt-in only.
    AcceptAny,
}

impl HostKeyPolicy {
    pub fn for_profile(profile: Profile) -> Self {
        match profile {
            Profile::Production => Self::Strict,
            Profile::Development => Self::AcceptNew,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyVerdict {
    Known,
    Learned,
    AcceptedUnchecked,
    Unknown,
    Changed,
}

impl HostKeyVerdict {
    pub fn accepted(self) -> bool {
        matches!(self, Self::Known | Self::Learned | Self::AcceptedUnchecked)
    }
}

/// Host key bookkeeping shared by all sessions of an executor.
///
/// Keys are kept in memory and, when a `known_hosts` path is configured,
/// checked against and appended to that file.
#[derive(Debug)]
pub struct HostKeyVerifier {
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
    seen: Mutex<HashMap<(String, u16), String>>,
}

impl HostKeyVerifier {
    pub fn new(policy: HostKeyPolicy, known_hosts: Option<PathBuf>) -> Self {
        Self {
            policy,
            known_hosts,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    /// In-memory check by fingerprint; records the key when the policy allows.
    pub fn check_fingerprint(&self, host: &str, port: u16, fingerprint: &str) -> HostKeyVerdict {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (host.to_string(), port);
        match (seen.get(&key), self.policy) {
            (Some(known), _) if known == fingerprint => HostKeyVerdict::Known,
            (_, HostKeyPolicy::AcceptAny) => {
                seen.insert(key, fingerprint.to_string());
                HostKeyVerdict::AcceptedUnchecked
            }
            (Some(_), _) => HostKeyVerdict::Changed,
            (None, HostKeyPolicy::Strict) => HostKeyVerdict::Unknown,
            (None, HostKeyPolicy::AcceptNew) => {
                seen.insert(key, fingerprint.to_string());
                HostKeyVerdict::Learned
            }
        }
    }

    fn check_key(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerdict {
        if let Some(path) = self.known_hosts.as_deref() {
            if self.policy != HostKeyPolicy::AcceptAny {
                match russh_keys::check_known_hosts_path(host, port, key, path) {
                    Ok(true) => return HostKeyVerdict::Known,
                    Ok(false) => {}
                    Err(russh_keys::Error::KeyChanged { line }) => {
                        warn!(%host, port, line, "host key differs from known_hosts entry");
                        return HostKeyVerdict::Changed;
                    }
                    Err(e) => debug!(%host, error = %e, "known_hosts lookup failed"),
                }
            }
        }

        let verdict = self.check_fingerprint(host, port, &key.fingerprint());
        if verdict == HostKeyVerdict::Learned {
            if let Some(path) = self.known_hosts.as_deref() {
                if let Err(e) = russh_keys::learn_known_hosts_path(host, port, key, path) {
                    warn!(%host, error = %e, "failed to record host key");
                }
            }
        }
        verdict
    }
}

struct ClientHandler {
    host: String,
    port: u16,
    verifier: Arc<HostKeyVerifier>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let verdict = self.verifier.check_key(&self.host, self.port, server_public_key);
        match verdict {
            HostKeyVerdict::Learned => {
                info!(host = %self.host, fingerprint = %server_public_key.fingerprint(), "recorded new host key")
            }
            HostKeyVerdict::Unknown | HostKeyVerdict::Changed => {
                warn!(host = %self.host, ?verdict, "rejecting host key")
            }
            _ => {}
        }
        Ok(verdict.accepted())
    }
}

/// Password-authenticated SSH command runner.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    port: u16,
    max_output_bytes: usize,
    verifier: Arc<HostKeyVerifier>,
}

impl SshExecutor {
    pub fn new(verifier: HostKeyVerifier) -> Self {
        Self {
            port: DEFAULT_SSH_PORT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            verifier: Arc::new(verifier),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn verifier(&self) -> &HostKeyVerifier {
        &self.verifier
    }

    async fn run_command(
        &self,
        session: &mut Handle<ClientHandler>,
        address: Address,
        credentials: &Credentials,
        command: &str,
        timeout: Duration,
    ) -> SessionResult {
        let fail = |status, detail: String| SessionResult::failed(address, command, status, detail);

        let auth = time::timeout(
            timeout,
            session.authenticate_password(credentials.username.as_str(), credentials.password.as_str()),
        )
        .await;
        match auth {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return fail(
                    SessionStatus::AuthFailure,
                    format!("authentication rejected for user {}", credentials.username),
                )
            }
            Ok(Err(e)) => return fail(SessionStatus::ConnectFailure, error_chain(&e)),
            Err(_) => return fail(SessionStatus::ConnectFailure, "authentication timed out".into()),
        }

        let mut channel = match time::timeout(timeout, session.channel_open_session()).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => return fail(SessionStatus::ConnectFailure, error_chain(&e)),
            Err(_) => return fail(SessionStatus::ConnectFailure, "opening channel timed out".into()),
        };
        if let Err(e) = channel.exec(true, command).await {
            return fail(SessionStatus::ConnectFailure, error_chain(&e));
        }

        let mut stdout = CappedBuffer::new(self.max_output_bytes);
        let mut stderr = CappedBuffer::new(self.max_output_bytes);
        let finished =
            time::timeout(timeout, collect_output(&mut channel, &mut stdout, &mut stderr)).await;

        let mut result = match finished {
            Ok(exit_status) => {
                let mut r = SessionResult::new(address, command, SessionStatus::Success);
                r.exit_status = exit_status;
                r
            }
            Err(_) => fail(
                SessionStatus::Timeout,
                format!("command did not finish within {} ms", timeout.as_millis()),
            ),
        };
        result.truncated = stdout.truncated || stderr.truncated;
        result.stdout = stdout.into_string();
        result.stderr = stderr.into_string();
        result
    }
}

#[async_trait]
impl SessionExecutor for SshExecutor {
    async fn execute(
        &self,
        address: Address,
        credentials: &Credentials,
        command: &str,
        timeout: Duration,
    ) -> SessionResult {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(timeout.saturating_mul(2)),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: address.to_string(),
            port: self.port,
            verifier: self.verifier.clone(),
        };

        let connected = time::timeout(timeout, client::connect(config, (address, self.port), handler)).await;
        let mut session = match connected {
            Ok(Ok(s)) => s,
            Ok(Err(russh::Error::UnknownKey)) => {
                return SessionResult::failed(
                    address,
                    command,
                    SessionStatus::ConnectFailure,
                    format!("host key rejected ({:?} policy)", self.verifier.policy()),
                )
            }
            Ok(Err(e)) => {
                return SessionResult::failed(address, command, SessionStatus::ConnectFailure, error_chain(&e))
            }
            Err(_) => {
                return SessionResult::failed(
                    address,
                    command,
                    SessionStatus::ConnectFailure,
                    format!("connect timed out after {} ms", timeout.as_millis()),
                )
            }
        };
        debug!(%address, "ssh session established");

        let result = self
            .run_command(&mut session, address, credentials, command, timeout)
            .await;

        // Dropping the handle also tears the connection down; this just says goodbye first.
        let bye = session.disconnect(Disconnect::ByApplication, "", "en");
        if time::timeout(Duration::from_secs(1), bye).await.is_err() {
            debug!(%address, "disconnect timed out");
        }
        result
    }
}

/// Drain the channel until it closes. Returns the exit status, if sent.
async fn collect_output(
    channel: &mut Channel<client::Msg>,
    stdout: &mut CappedBuffer,
    stderr: &mut CappedBuffer,
) -> Option<u32> {
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.push(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => stderr.push(&data),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }
    exit_status
}

/// Byte buffer that silently stops growing at `cap`.
#[derive(Debug)]
struct CappedBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        if data.len() > room {
            self.truncated = true;
            self.buf.extend_from_slice(&data[..room]);
        } else {
            self.buf.extend_from_slice(data);
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

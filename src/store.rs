use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::types::{Address, ProbeOutcome, ProbeStatus, SessionResult, SessionStatus};

/// Everything known about one address.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub address: Address,
    pub probe: Option<ProbeOutcome>,
    pub session: Option<SessionResult>,
}

impl HostRecord {
    fn new(address: Address) -> Self {
        Self {
            address,
            probe: None,
            session: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Record {
    Probe(ProbeOutcome),
    Session(SessionResult),
}

impl From<ProbeOutcome> for Record {
    fn from(o: ProbeOutcome) -> Self {
        Self::Probe(o)
    }
}

impl From<SessionResult> for Record {
    fn from(r: SessionResult) -> Self {
        Self::Session(r)
    }
}

#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub hosts: u64,
    pub reachable: u64,
    pub unreachable: u64,
    pub errors: u64,
    pub sessions: u64,
    pub session_failures: u64,
}

/// Shared accumulator of per-address outcomes, readable while a scan runs.
///
/// Keyed and ordered by address. Each entry holds the latest probe outcome
/// and the latest session result; writes from an older generation than the
/// stored one are dropped.
#[derive(Clone, Debug, Default)]
pub struct ResultStore {
    hosts: Arc<RwLock<BTreeMap<Address, HostRecord>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns `false` when the record was rejected.
    pub async fn record(&self, record: impl Into<Record>) -> bool {
        let mut hosts = self.hosts.write().await;
        match record.into() {
            Record::Probe(outcome) => {
                let entry = hosts
                    .entry(outcome.address)
                    .or_insert_with(|| HostRecord::new(outcome.address));
                if entry
                    .probe
                    .as_ref()
                    .is_some_and(|p| p.generation > outcome.generation)
                {
                    return false;
                }
                // A session only stands next to the probe of its own cycle.
                if entry
                    .session
                    .as_ref()
                    .is_some_and(|s| s.generation < outcome.generation)
                {
                    entry.session = None;
                }
                entry.probe = Some(outcome);
                true
            }
            Record::Session(result) => {
                // Sessions only ever follow a reachable probe of the same cycle.
                let Some(entry) = hosts.get_mut(&result.address) else {
                    warn!(address = %result.address, "session result without a probe outcome");
                    return false;
                };
                let backed = entry
                    .probe
                    .as_ref()
                    .is_some_and(|p| p.is_reachable() && p.generation == result.generation);
                if !backed {
                    warn!(address = %result.address, "session result without a reachable probe");
                    return false;
                }
                if entry
                    .session
                    .as_ref()
                    .is_some_and(|s| s.generation > result.generation)
                {
                    return false;
                }
                entry.session = Some(result);
                true
            }
        }
    }

    /// Point-in-time copy of every entry, in address order.
    pub async fn snapshot(&self) -> Vec<HostRecord> {
        self.hosts.read().await.values().cloned().collect()
    }

    /// Probe outcomes that are not `Reachable`.
    pub async fn unreachable(&self) -> Vec<ProbeOutcome> {
        self.hosts
            .read()
            .await
            .values()
            .filter_map(|h| h.probe.as_ref())
            .filter(|p| !p.is_reachable())
            .cloned()
            .collect()
    }

    pub async fn sessions(&self) -> Vec<SessionResult> {
        self.hosts
            .read()
            .await
            .values()
            .filter_map(|h| h.session.clone())
            .collect()
    }

    pub async fn stats(&self) -> StoreStats {
        let hosts = self.hosts.read().await;
        let mut stats = StoreStats {
            hosts: hosts.len() as u64,
            ..StoreStats::default()
        };
        for h in hosts.values() {
            match h.probe.as_ref().map(|p| p.status) {
                Some(ProbeStatus::Reachable) => stats.reachable += 1,
                Some(ProbeStatus::Unreachable) => stats.unreachable += 1,
                Some(ProbeStatus::Error) => stats.errors += 1,
                None => {}
            }
            if let Some(s) = &h.session {
                stats.sessions += 1;
                if s.status != SessionStatus::Success {
                    stats.session_failures += 1;
                }
            }
        }
        stats
    }

    pub async fn len(&self) -> usize {
        self.hosts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hosts.read().await.is_empty()
    }

    /// Drop every entry. Only meant for use between runs.
    pub async fn reset(&self) {
        self.hosts.write().await.clear();
    }
}

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::ConfigError;
use crate::probe::LivenessProbe;
use crate::range::AddressRange;
use crate::session::SessionExecutor;
use crate::store::{ResultStore, StoreStats};
use crate::types::{
    now_rfc3339, Address, ProbeOutcome, ProbeStatus, RemoteCommand, SessionResult, SessionStatus,
};

/// Upper bound for either limiter.
pub const MAX_CONCURRENCY: usize = 65_536;

/// Slack on top of a probe's own timeout before the orchestrator gives up on it.
const PROBE_GRACE: Duration = Duration::from_millis(250);
const SESSION_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Max probes in flight.
    pub concurrency_limit: usize,
    /// Max SSH sessions in flight; kept separate from (and usually below) the probe limit.
    pub session_limit: usize,
    pub probe_timeout: Duration,
    pub session_timeout: Duration,
    /// Continuous mode: pause between cycles. `None` runs one cycle.
    pub interval: Option<Duration>,
}

impl ScanOptions {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("concurrency_limit", self.concurrency_limit),
            ("session_limit", self.session_limit),
        ] {
            if value == 0 || value > MAX_CONCURRENCY {
                return Err(ConfigError::InvalidLimit {
                    name,
                    value,
                    max: MAX_CONCURRENCY,
                });
            }
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("probe_timeout"));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("session_timeout"));
        }
        if self.interval.is_some_and(|i| i.is_zero()) {
            return Err(ConfigError::InvalidTimeout("interval"));
        }
        Ok(())
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 1000,
            session_limit: 32,
            probe_timeout: Duration::from_secs(2),
            session_timeout: Duration::from_secs(10),
            interval: None,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    /// Stopped by `cancel`; in-flight work drained.
    Cancelled,
    /// Stopped by `hard_cancel`; in-flight work dropped.
    Aborted,
    /// The limiter could not hand out any worker.
    WorkersUnavailable,
    /// The driver task itself died.
    Failed,
}

/// Point-in-time view of a run, also used as its final report.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub range: String,
    pub state: RunState,
    pub running: bool,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub cycles: u64,
    pub dispatched: u64,
    pub in_flight: usize,
    pub stats: StoreStats,
}

#[derive(Debug)]
struct Lifecycle {
    state: RunState,
    finished_at: Option<String>,
}

/// Per-invocation context: owns its cancellation flag and its result store.
#[derive(Debug)]
pub struct ScanRun {
    range: AddressRange,
    options: ScanOptions,
    started_at: String,
    running: AtomicBool,
    stop: CancellationToken,
    abort: CancellationToken,
    store: ResultStore,
    dispatched: AtomicU64,
    in_flight: AtomicUsize,
    cycles: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

impl ScanRun {
    fn new(range: AddressRange, options: ScanOptions) -> Self {
        Self {
            range,
            options,
            started_at: now_rfc3339(),
            running: AtomicBool::new(true),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            store: ResultStore::new(),
            dispatched: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            cycles: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle {
                state: RunState::Running,
                finished_at: None,
            }),
        }
    }

    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    /// `false` once cancellation was requested or the run finished.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Addresses handed to a probe so far, over all cycles.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Probes currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        self.lifecycle().state
    }

    /// Stop dispatching; let in-flight probes and sessions finish.
    pub fn cancel(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(range = %self.range, "scan cancellation requested");
        }
        self.stop.cancel();
    }

    /// Stop dispatching and drop in-flight work, closing its connections.
    pub fn hard_cancel(&self) {
        self.cancel();
        self.abort.cancel();
    }

    pub async fn summary(&self) -> RunSummary {
        let (state, finished_at) = {
            let l = self.lifecycle();
            (l.state, l.finished_at.clone())
        };
        RunSummary {
            range: self.range.to_string(),
            state,
            running: self.is_running(),
            started_at: self.started_at.clone(),
            finished_at,
            cycles: self.cycles(),
            dispatched: self.dispatched(),
            in_flight: self.in_flight(),
            stats: self.store.stats().await,
        }
    }

    fn finish(&self, state: RunState) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.cancel();
        let mut l = self.lifecycle();
        l.state = state;
        l.finished_at = Some(now_rfc3339());
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner's handle on a spawned run.
#[derive(Debug)]
pub struct ScanHandle {
    run: Arc<ScanRun>,
    task: JoinHandle<RunSummary>,
}

impl ScanHandle {
    pub fn run(&self) -> &Arc<ScanRun> {
        &self.run
    }

    pub fn store(&self) -> &ResultStore {
        self.run.store()
    }

    pub fn cancel(&self) {
        self.run.cancel();
    }

    pub fn hard_cancel(&self) {
        self.run.hard_cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end (after its last cycle, or after cancellation).
    pub async fn wait(self) -> RunSummary {
        let Self { run, task } = self;
        match task.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "scan driver failed");
                run.finish(RunState::Failed);
                run.summary().await
            }
        }
    }
}

/// Fans probes (and follow-up sessions) out over an address range.
#[derive(Clone)]
pub struct ScanOrchestrator {
    probe: Arc<dyn LivenessProbe>,
    executor: Option<Arc<dyn SessionExecutor>>,
}

impl ScanOrchestrator {
    pub fn new(probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            probe,
            executor: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn SessionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Validate and start a run in the background. Must be called within a
    /// tokio runtime. Setup problems are returned here; nothing after this
    /// point fails the call.
    pub fn run(
        &self,
        range: AddressRange,
        options: ScanOptions,
        command: Option<RemoteCommand>,
    ) -> Result<ScanHandle, ConfigError> {
        options.validate()?;
        if let Some(c) = &command {
            c.validate()?;
            if self.executor.is_none() {
                return Err(ConfigError::NoSessionExecutor);
            }
        }

        let run = Arc::new(ScanRun::new(range, options));
        let ctx = Arc::new(RunContext {
            run: run.clone(),
            probe: self.probe.clone(),
            executor: self.executor.clone(),
            command: command.map(Arc::new),
            probe_permits: Arc::new(Semaphore::new(options.concurrency_limit)),
            session_permits: Arc::new(Semaphore::new(options.session_limit)),
            sessions: SessionClaims::default(),
        });

        let span = info_span!("scan", range = %range);
        let task = tokio::spawn(drive(ctx).instrument(span));
        Ok(ScanHandle { run, task })
    }
}

struct RunContext {
    run: Arc<ScanRun>,
    probe: Arc<dyn LivenessProbe>,
    executor: Option<Arc<dyn SessionExecutor>>,
    command: Option<Arc<RemoteCommand>>,
    probe_permits: Arc<Semaphore>,
    session_permits: Arc<Semaphore>,
    sessions: SessionClaims,
}

#[derive(Debug)]
struct WorkersUnavailable;

async fn drive(ctx: Arc<RunContext>) -> RunSummary {
    let run = &ctx.run;
    info!(
        addresses = run.range.len(),
        concurrency = run.options.concurrency_limit,
        sessions = ctx.command.is_some(),
        "scan started"
    );

    let mut generation = 0u64;
    let state = loop {
        if run_cycle(&ctx, generation).await.is_err() {
            error!("no scan worker could be allocated, halting run");
            break RunState::WorkersUnavailable;
        }
        run.cycles.fetch_add(1, Ordering::SeqCst);

        if run.abort.is_cancelled() {
            break RunState::Aborted;
        }
        if !run.is_running() {
            break RunState::Cancelled;
        }
        let Some(interval) = run.options.interval else {
            break RunState::Completed;
        };

        debug!(generation, ?interval, "cycle drained, waiting for next");
        tokio::select! {
            _ = time::sleep(interval) => {}
            _ = run.stop.cancelled() => {
                break if run.abort.is_cancelled() { RunState::Aborted } else { RunState::Cancelled };
            }
        }
        generation += 1;
    };

    run.finish(state);
    let summary = run.summary().await;
    info!(
        state = ?summary.state,
        cycles = summary.cycles,
        reachable = summary.stats.reachable,
        unreachable = summary.stats.unreachable,
        errors = summary.stats.errors,
        sessions = summary.stats.sessions,
        "scan finished"
    );
    summary
}

/// One pass over the range. Returns after every dispatched probe and session
/// of this cycle has finished.
async fn run_cycle(ctx: &Arc<RunContext>, generation: u64) -> Result<(), WorkersUnavailable> {
    let run = &ctx.run;
    let mut tasks = JoinSet::new();
    let mut result = Ok(());

    for address in run.range.iter() {
        if !run.is_running() {
            break;
        }
        let permit = tokio::select! {
            biased;
            _ = run.stop.cancelled() => break,
            permit = ctx.probe_permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    result = Err(WorkersUnavailable);
                    break;
                }
            },
        };

        run.dispatched.fetch_add(1, Ordering::SeqCst);
        let ctx = ctx.clone();
        tasks.spawn(async move { ctx.scan_address(address, generation, permit).await });

        // Reap finished tasks so the set stays as small as the limiter.
        while let Some(done) = tasks.try_join_next() {
            log_join(done);
        }
    }

    while let Some(done) = tasks.join_next().await {
        log_join(done);
    }
    result
}

fn log_join(res: Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!(error = %e, "scan task panicked");
        }
    }
}

impl RunContext {
    async fn scan_address(
        self: Arc<Self>,
        address: Address,
        generation: u64,
        permit: OwnedSemaphorePermit,
    ) {
        let mut outcome = {
            let _busy = Busy::enter(&self.run.in_flight);
            tokio::select! {
                biased;
                _ = self.run.abort.cancelled() => ProbeOutcome::error(address, "aborted by hard cancel"),
                outcome = self.probe_once(address) => outcome,
            }
        };

        outcome.address = address;
        outcome.generation = generation;
        match outcome.status {
            ProbeStatus::Reachable => debug!(%address, latency_ms = outcome.latency_ms, "reachable"),
            ProbeStatus::Unreachable => {
                debug!(%address, detail = outcome.detail.as_deref().unwrap_or(""), "unreachable")
            }
            ProbeStatus::Error => {
                warn!(%address, detail = outcome.detail.as_deref().unwrap_or(""), "probe error")
            }
        }
        let reachable = outcome.is_reachable();
        self.run.store.record(outcome).await;

        if reachable {
            self.run_session(address, generation, permit).await;
        }
    }

    async fn probe_once(&self, address: Address) -> ProbeOutcome {
        let timeout = self.run.options.probe_timeout;
        let probe = AssertUnwindSafe(self.probe.probe(address, timeout)).catch_unwind();
        match time::timeout(timeout + PROBE_GRACE, probe).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                error!(%address, "probe panicked");
                ProbeOutcome::error(address, "probe panicked")
            }
            Err(_) => ProbeOutcome::unreachable(
                address,
                format!("probe timed out after {} ms", timeout.as_millis()),
            ),
        }
    }

    /// Holds on to the probe slot until a session slot is free, so sessions
    /// waiting for the smaller limiter never outnumber the probe limit.
    async fn run_session(
        &self,
        address: Address,
        generation: u64,
        probe_permit: OwnedSemaphorePermit,
    ) {
        let (Some(command), Some(executor)) = (self.command.as_deref(), self.executor.as_deref())
        else {
            return;
        };
        if !self.run.is_running() {
            debug!(%address, "run cancelled, not starting session");
            return;
        }
        let Some(_claim) = self.sessions.claim(address) else {
            warn!(%address, "session already in flight, skipping");
            return;
        };

        let permit = tokio::select! {
            biased;
            _ = self.run.stop.cancelled() => {
                debug!(%address, "run cancelled while waiting for a session slot");
                return;
            }
            permit = self.session_permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    error!(%address, "session limiter closed");
                    return;
                }
            },
        };
        drop(probe_permit);
        if !self.run.is_running() {
            debug!(%address, "run cancelled, not starting session");
            return;
        }

        let timeout = self.run.options.session_timeout;
        // connect, auth, channel and command each get `timeout`.
        let bound = timeout.saturating_mul(4) + SESSION_GRACE;
        let exec = AssertUnwindSafe(executor.execute(
            address,
            &command.credentials,
            &command.command,
            timeout,
        ))
        .catch_unwind();
        let fail = |status, detail: &str| SessionResult::failed(address, &command.command, status, detail);

        let mut result = tokio::select! {
            biased;
            _ = self.run.abort.cancelled() => fail(SessionStatus::Aborted, "aborted by hard cancel"),
            r = time::timeout(bound, exec) => match r {
                Ok(Ok(r)) => r,
                Ok(Err(_)) => {
                    error!(%address, "session executor panicked");
                    fail(SessionStatus::ConnectFailure, "session executor panicked")
                }
                Err(_) => fail(SessionStatus::Timeout, "session exceeded its overall time bound"),
            },
        };
        drop(permit);

        result.address = address;
        result.generation = generation;
        if result.status == SessionStatus::Success {
            info!(%address, exit_status = ?result.exit_status, "command finished");
        } else {
            warn!(%address, status = ?result.status, detail = result.detail.as_deref().unwrap_or(""), "session failed");
        }
        self.run.store.record(result).await;
    }
}

/// Counts a probe as in flight for as long as it lives.
struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Addresses with a session in flight. At most one per address.
#[derive(Debug, Default, Clone)]
struct SessionClaims {
    active: Arc<Mutex<HashSet<Address>>>,
}

impl SessionClaims {
    fn claim(&self, address: Address) -> Option<SessionClaim> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.insert(address).then(|| SessionClaim {
            active: self.active.clone(),
            address,
        })
    }
}

struct SessionClaim {
    active: Arc<Mutex<HashSet<Address>>>,
    address: Address,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.address);
    }
}

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::{self, Instant};

use lan_sweep_rs::probe::LivenessProbe;
use lan_sweep_rs::session::SessionExecutor;
use lan_sweep_rs::types::{
    Address, Credentials, ProbeOutcome, ProbeStatus, RemoteCommand, SessionResult, SessionStatus,
};
use lan_sweep_rs::{AddressRange, ConfigError, RunState, ScanOptions, ScanOrchestrator};

#[derive(Clone, Copy)]
enum Reply {
    Up,
    Down,
    Hang,
    Panic,
}

/// Probe whose answer is scripted per address. Tracks concurrency and can be
/// held at a gate until the test releases it.
struct ScriptedProbe {
    script: Box<dyn Fn(Address) -> Reply + Send + Sync>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn new(script: impl Fn(Address) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            gate: None,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn probe(&self, address: Address, timeout: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let _ = gate.acquire().await.map(|p| p.forget());
        }
        if !self.delay.is_zero() {
            time::sleep(self.delay).await;
        }
        let reply = (self.script)(address);
        if matches!(reply, Reply::Hang) {
            time::sleep(timeout * 10).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Up => ProbeOutcome::reachable(address, 1),
            Reply::Down => ProbeOutcome::unreachable(address, "connection refused"),
            Reply::Hang => ProbeOutcome::reachable(address, 0),
            Reply::Panic => panic!("probe blew up"),
        }
    }
}

/// Executor that answers after `delay` and records overlapping calls per address.
#[derive(Default)]
struct RecordingExecutor {
    delay: Duration,
    active: Mutex<HashMap<Address, usize>>,
    peak_per_address: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl SessionExecutor for RecordingExecutor {
    async fn execute(
        &self,
        address: Address,
        credentials: &Credentials,
        command: &str,
        _timeout: Duration,
    ) -> SessionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut active = self.active.lock().unwrap();
            let n = active.entry(address).or_default();
            *n += 1;
            self.peak_per_address.fetch_max(*n, Ordering::SeqCst);
        }
        time::sleep(self.delay).await;
        *self.active.lock().unwrap().get_mut(&address).unwrap() -= 1;

        let mut r = SessionResult::new(address, command, SessionStatus::Success);
        r.stdout = format!("{}@{address}: up 3 days\n", credentials.username);
        r.exit_status = Some(0);
        r
    }
}

#[derive(Clone, Copy)]
enum SessionReply {
    Ok,
    Fail(SessionStatus),
    Hang,
}

/// Executor whose result is scripted per address.
struct ScriptedExecutor {
    script: fn(Address) -> SessionReply,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(script: fn(Address) -> SessionReply) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        address: Address,
        _credentials: &Credentials,
        command: &str,
        _timeout: Duration,
    ) -> SessionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.script)(address) {
            SessionReply::Ok => SessionResult::new(address, command, SessionStatus::Success),
            SessionReply::Fail(status) => {
                SessionResult::failed(address, command, status, "scripted failure")
            }
            SessionReply::Hang => {
                time::sleep(Duration::from_secs(120)).await;
                SessionResult::new(address, command, SessionStatus::Success)
            }
        }
    }
}

fn ip(last: u8) -> Address {
    Ipv4Addr::new(192, 168, 1, last)
}

fn uptime() -> RemoteCommand {
    RemoteCommand::new(Credentials::new("ops", "pw"), "uptime").unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        time::sleep(Duration::from_millis(5)).await;
    }
}

fn options(limit: usize, timeout: Duration) -> ScanOptions {
    ScanOptions {
        probe_timeout: timeout,
        ..ScanOptions::new(limit)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_up_one_timing_out_with_command() {
    let probe = ScriptedProbe::new(|a| if a == ip(3) { Reply::Hang } else { Reply::Up });
    let executor = Arc::new(RecordingExecutor::default());
    let orch = ScanOrchestrator::new(Arc::new(probe)).with_executor(executor.clone());
    let range = AddressRange::parse("192.168.1.1-192.168.1.3").unwrap();

    let handle = orch
        .run(range, options(8, Duration::from_millis(200)), Some(uptime()))
        .unwrap();
    let store = handle.store().clone();
    let summary = handle.wait().await;

    assert_eq!(summary.state, RunState::Completed);
    assert!(!summary.running);
    assert_eq!(summary.stats.reachable, 2);
    assert_eq!(summary.stats.unreachable, 1);

    let down = store.unreachable().await;
    assert_eq!(down.len(), 1);
    assert_eq!(down[0].address, ip(3));
    assert_eq!(down[0].status, ProbeStatus::Unreachable);
    assert!(!down[0].detail.as_deref().unwrap_or("").is_empty());

    let sessions = store.sessions().await;
    let addrs: Vec<_> = sessions.iter().map(|s| s.address).collect();
    assert_eq!(addrs, vec![ip(1), ip(2)]);
    assert!(sessions.iter().all(|s| s.status == SessionStatus::Success));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn no_command_means_no_sessions() {
    let probe = ScriptedProbe::new(|a| if a == ip(2) { Reply::Down } else { Reply::Up });
    let executor = Arc::new(RecordingExecutor::default());
    let orch = ScanOrchestrator::new(Arc::new(probe)).with_executor(executor.clone());
    let range = AddressRange::parse("192.168.1.1-192.168.1.3").unwrap();

    let handle = orch.run(range, options(8, Duration::from_millis(200)), None).unwrap();
    let store = handle.store().clone();
    handle.wait().await;

    assert_eq!(store.len().await, 3);
    assert!(store.sessions().await.is_empty());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn in_flight_probes_never_exceed_limit() {
    let probe = Arc::new(ScriptedProbe::new(|_| Reply::Up).with_delay(Duration::from_millis(1)));
    let orch = ScanOrchestrator::new(probe.clone());
    // 10.0.0.1 ..= 10.0.39.16 is exactly 10,000 addresses.
    let range = AddressRange::parse("10.0.0.1-10.0.39.16").unwrap();
    assert_eq!(range.len(), 10_000);

    let handle = orch.run(range, options(50, Duration::from_secs(1)), None).unwrap();
    let store = handle.store().clone();
    let summary = handle.wait().await;

    let peak = probe.peak.load(Ordering::SeqCst);
    assert!(peak <= 50, "peak concurrency {peak} exceeded limit");
    assert!(peak > 1, "probes never overlapped");
    assert_eq!(summary.dispatched, 10_000);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 10_000);
    assert_eq!(store.len().await, 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_stops_dispatch_and_drains_in_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let probe = ScriptedProbe::new(|_| Reply::Up).with_gate(gate.clone());
    let orch = ScanOrchestrator::new(Arc::new(probe));
    let range = AddressRange::parse("192.168.1.1-192.168.1.5").unwrap();

    let handle = orch
        .run(range, options(2, Duration::from_secs(5)), None)
        .unwrap();
    let run = handle.run().clone();
    wait_until(|| run.in_flight() == 2).await;

    handle.cancel();
    assert!(!run.is_running());
    gate.add_permits(10);

    let store = handle.store().clone();
    let summary = handle.wait().await;

    assert_eq!(summary.state, RunState::Cancelled);
    assert_eq!(summary.dispatched, 2);
    let seen: Vec<_> = store.snapshot().await.into_iter().map(|h| h.address).collect();
    assert_eq!(seen, vec![ip(1), ip(2)]);
    // Drained, not dropped: both finished normally.
    assert_eq!(summary.stats.reachable, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hard_cancel_drops_in_flight_work() {
    let gate = Arc::new(Semaphore::new(0));
    let probe = ScriptedProbe::new(|_| Reply::Up).with_gate(gate);
    let orch = ScanOrchestrator::new(Arc::new(probe));
    let range = AddressRange::parse("192.168.1.1-192.168.1.5").unwrap();

    let handle = orch
        .run(range, options(2, Duration::from_secs(30)), None)
        .unwrap();
    let run = handle.run().clone();
    wait_until(|| run.in_flight() == 2).await;

    handle.hard_cancel();
    let store = handle.store().clone();
    let summary = time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("hard cancel returns promptly");

    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(run.in_flight(), 0);
    let snap = store.snapshot().await;
    assert_eq!(snap.len(), 2);
    for h in snap {
        let p = h.probe.unwrap();
        assert_eq!(p.status, ProbeStatus::Error);
        assert!(p.detail.unwrap().contains("aborted"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn continuous_mode_repeats_until_cancelled() {
    let probe = Arc::new(ScriptedProbe::new(|_| Reply::Up));
    let orch = ScanOrchestrator::new(probe.clone());
    let range = AddressRange::parse("10.1.1.1-10.1.1.4").unwrap();
    let opts = ScanOptions {
        interval: Some(Duration::from_millis(20)),
        ..options(4, Duration::from_millis(200))
    };

    let handle = orch.run(range, opts, None).unwrap();
    let run = handle.run().clone();
    wait_until(|| run.cycles() >= 3).await;
    handle.cancel();

    let store = handle.store().clone();
    let summary = handle.wait().await;
    assert_eq!(summary.state, RunState::Cancelled);
    assert!(summary.cycles >= 3);
    assert_eq!(summary.dispatched, probe.calls.load(Ordering::SeqCst) as u64);

    // One entry per address, carrying the latest generation.
    let snap = store.snapshot().await;
    assert_eq!(snap.len(), 4);
    assert!(snap.iter().all(|h| h.probe.as_ref().unwrap().generation >= 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_session_per_address() {
    let probe = ScriptedProbe::new(|_| Reply::Up);
    let executor = Arc::new(RecordingExecutor {
        delay: Duration::from_millis(30),
        ..RecordingExecutor::default()
    });
    let orch = ScanOrchestrator::new(Arc::new(probe)).with_executor(executor.clone());
    let range = AddressRange::parse("10.2.0.1-10.2.0.6").unwrap();
    let opts = ScanOptions {
        session_limit: 3,
        interval: Some(Duration::from_millis(1)),
        ..options(6, Duration::from_millis(200))
    };

    let handle = orch.run(range, opts, Some(uptime())).unwrap();
    let run = handle.run().clone();
    wait_until(|| run.cycles() >= 4).await;
    handle.cancel();
    let store = handle.store().clone();
    handle.wait().await;

    assert_eq!(executor.peak_per_address.load(Ordering::SeqCst), 1);
    assert!(executor.calls.load(Ordering::SeqCst) >= 24);
    // The cycle cut short by the cancel may have left some hosts without one.
    for h in store.snapshot().await {
        if let Some(s) = h.session {
            assert_eq!(s.generation, h.probe.unwrap().generation);
            assert!(s.stdout.contains("up 3 days"));
        }
    }
}

#[tokio::test]
async fn panicking_probe_is_recorded_as_error() {
    let probe = ScriptedProbe::new(|a| if a == ip(2) { Reply::Panic } else { Reply::Up });
    let orch = ScanOrchestrator::new(Arc::new(probe));
    let range = AddressRange::parse("192.168.1.1-192.168.1.3").unwrap();

    let handle = orch.run(range, options(3, Duration::from_millis(200)), None).unwrap();
    let store = handle.store().clone();
    let summary = handle.wait().await;

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.stats.errors, 1);
    let down = store.unreachable().await;
    assert_eq!(down[0].address, ip(2));
    assert_eq!(down[0].status, ProbeStatus::Error);
}

#[tokio::test]
async fn setup_errors_are_returned_synchronously() {
    let range = AddressRange::parse("192.168.1.1-192.168.1.3").unwrap();
    let bare = ScanOrchestrator::new(Arc::new(ScriptedProbe::new(|_| Reply::Up)));

    assert!(matches!(
        bare.run(range, ScanOptions::new(0), None),
        Err(ConfigError::InvalidLimit { .. })
    ));
    assert!(matches!(
        bare.run(range, ScanOptions::default(), Some(uptime())),
        Err(ConfigError::NoSessionExecutor)
    ));

    let with_exec = bare.clone().with_executor(Arc::new(RecordingExecutor::default()));
    let empty = RemoteCommand {
        credentials: Credentials::new("ops", "pw"),
        command: String::new(),
    };
    assert!(matches!(
        with_exec.run(range, ScanOptions::default(), Some(empty)),
        Err(ConfigError::EmptyCommand)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_results_visible_while_running() {
    let gate = Arc::new(Semaphore::new(0));
    let probe = ScriptedProbe::new(|_| Reply::Down).with_gate(gate.clone());
    let orch = ScanOrchestrator::new(Arc::new(probe));
    let range = AddressRange::parse("192.168.1.1-192.168.1.4").unwrap();

    let handle = orch.run(range, options(1, Duration::from_secs(5)), None).unwrap();
    gate.add_permits(2);
    let store = handle.store().clone();
    let run = handle.run().clone();
    let deadline = Instant::now() + Duration::from_secs(10);
    while store.len().await < 2 {
        assert!(Instant::now() < deadline);
        time::sleep(Duration::from_millis(5)).await;
    }
    assert!(run.is_running());
    assert!(!handle.is_finished());

    gate.add_permits(2);
    let summary = handle.wait().await;
    assert_eq!(summary.stats.unreachable, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_skips_sessions_queued_behind_the_session_limit() {
    let probe = ScriptedProbe::new(|_| Reply::Up);
    let executor = Arc::new(RecordingExecutor {
        delay: Duration::from_millis(200),
        ..RecordingExecutor::default()
    });
    let orch = ScanOrchestrator::new(Arc::new(probe)).with_executor(executor.clone());
    let range = AddressRange::parse("10.3.0.1-10.3.3.232").unwrap();
    let opts = ScanOptions {
        session_limit: 1,
        ..options(8, Duration::from_millis(200))
    };

    let handle = orch.run(range, opts, Some(uptime())).unwrap();
    let run = handle.run().clone();
    wait_until(|| executor.calls.load(Ordering::SeqCst) == 1).await;
    // Probe slots are held by hosts waiting for a session, so dispatch stalls.
    time::sleep(Duration::from_millis(50)).await;
    assert!(run.dispatched() <= 9, "dispatched {}", run.dispatched());

    handle.cancel();
    let store = handle.store().clone();
    let summary = time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancel drains promptly");

    assert_eq!(summary.state, RunState::Cancelled);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.sessions().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hanging_session_is_reported_as_timeout() {
    let probe = ScriptedProbe::new(|_| Reply::Up);
    let executor = Arc::new(ScriptedExecutor::new(|a| {
        if a == ip(1) {
            SessionReply::Hang
        } else {
            SessionReply::Ok
        }
    }));
    let orch = ScanOrchestrator::new(Arc::new(probe)).with_executor(executor.clone());
    let range = AddressRange::parse("192.168.1.1-192.168.1.2").unwrap();
    let opts = ScanOptions {
        session_timeout: Duration::from_millis(50),
        ..options(4, Duration::from_millis(200))
    };

    let handle = orch.run(range, opts, Some(uptime())).unwrap();
    let store = handle.store().clone();
    let summary = time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("session bound applies");

    assert_eq!(summary.state, RunState::Completed);
    let sessions = store.sessions().await;
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].address, ip(1));
    assert_eq!(sessions[0].status, SessionStatus::Timeout);
    assert!(sessions[0].detail.is_some());
    assert_eq!(sessions[1].status, SessionStatus::Success);
    assert_eq!(summary.stats.session_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hard_cancel_aborts_running_session() {
    let probe = ScriptedProbe::new(|_| Reply::Up);
    let executor = Arc::new(ScriptedExecutor::new(|_| SessionReply::Hang));
    let orch = ScanOrchestrator::new(Arc::new(probe)).with_executor(executor.clone());
    let range = AddressRange::parse("192.168.1.1").unwrap();
    let opts = ScanOptions {
        session_timeout: Duration::from_secs(30),
        ..options(4, Duration::from_millis(200))
    };

    let handle = orch.run(range, opts, Some(uptime())).unwrap();
    wait_until(|| executor.calls.load(Ordering::SeqCst) == 1).await;
    handle.hard_cancel();

    let store = handle.store().clone();
    let summary = time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("hard cancel returns promptly");

    assert_eq!(summary.state, RunState::Aborted);
    let sessions = store.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Aborted);
    assert_eq!(sessions[0].command, "uptime");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_sessions_do_not_stop_the_run() {
    let probe = ScriptedProbe::new(|_| Reply::Up);
    let executor = Arc::new(ScriptedExecutor::new(|a| match a.octets()[3] {
        1 => SessionReply::Fail(SessionStatus::AuthFailure),
        2 => SessionReply::Fail(SessionStatus::ConnectFailure),
        _ => SessionReply::Ok,
    }));
    let orch = ScanOrchestrator::new(Arc::new(probe)).with_executor(executor.clone());
    let range = AddressRange::parse("192.168.1.1-192.168.1.4").unwrap();
    let opts = ScanOptions {
        session_limit: 1,
        ..options(4, Duration::from_millis(200))
    };

    let handle = orch.run(range, opts, Some(uptime())).unwrap();
    let store = handle.store().clone();
    let summary = handle.wait().await;

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 4);
    let statuses: Vec<_> = store.sessions().await.into_iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            SessionStatus::AuthFailure,
            SessionStatus::ConnectFailure,
            SessionStatus::Success,
            SessionStatus::Success,
        ]
    );
    assert_eq!(summary.stats.sessions, 4);
    assert_eq!(summary.stats.session_failures, 2);
}

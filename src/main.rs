use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lan_sweep_rs::config::Opts;
use lan_sweep_rs::server::{self, AppState};
use lan_sweep_rs::session::HostKeyPolicy;
use lan_sweep_rs::store::HostRecord;
use lan_sweep_rs::types::{ProbeStatus, SessionStatus};
use lan_sweep_rs::{RunSummary, ScanOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let mut opts = Opts::parse();
    init_tracing(&opts.log_level);
    opts.load_config()?;

    let options = opts.scan_options()?;
    let command = opts.remote_command()?;

    let mut orchestrator = ScanOrchestrator::new(opts.probe());
    if command.is_some() || opts.serve {
        let executor = opts.executor();
        if executor.verifier().policy() == HostKeyPolicy::AcceptAny {
            warn!("host key verification is disabled (accept-any)");
        }
        orchestrator = orchestrator.with_executor(Arc::new(executor));
    }

    if opts.serve {
        let state = AppState::new(orchestrator, options);
        let bind = opts.bind_addr().to_string();
        println!("Status API at http://{bind}/api (Ctrl+C to stop)");
        tokio::select! {
            res = server::spawn_server(&bind, state) => res?,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        return Ok(());
    }

    let range = opts.address_range()?;
    println!("lan-sweep-rs configuration:");
    println!("  range        : {} ({} addresses)", range, range.len());
    println!("  concurrency  : {}", options.concurrency_limit);
    println!("  timeout_ms   : {}", options.probe_timeout.as_millis());
    println!(
        "  command      : {}",
        command.as_ref().map(|c| c.command.as_str()).unwrap_or("<none>")
    );
    if let Some(interval) = options.interval {
        println!("  interval     : {}s (continuous)", interval.as_secs());
    }

    let handle = orchestrator.run(range, options, command)?;

    // First Ctrl+C drains in-flight work, a second one aborts it.
    let run = handle.run().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping: waiting for in-flight probes (Ctrl+C again to abort)...");
            run.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            run.hard_cancel();
        }
    });

    let store = handle.store().clone();
    let summary = handle.wait().await;
    let hosts = store.snapshot().await;
    print_results_table(&summary, &hosts);

    if let Some(path) = opts.output.as_deref() {
        write_results_json(path, &summary, &hosts)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("Wrote JSON results to {}", path.display());
    }
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_results_table(summary: &RunSummary, hosts: &[HostRecord]) {
    let stats = &summary.stats;
    println!(
        "\nScan {:?}: {} probed, {} reachable, {} unreachable, {} errors, {} sessions ({} failed)",
        summary.state,
        stats.hosts,
        stats.reachable,
        stats.unreachable,
        stats.errors,
        stats.sessions,
        stats.session_failures
    );

    let down: Vec<_> = hosts
        .iter()
        .filter_map(|h| h.probe.as_ref())
        .filter(|p| p.status != ProbeStatus::Reachable)
        .collect();
    if !down.is_empty() {
        let ip_w = down.iter().map(|p| p.address.to_string().len()).max().unwrap_or(2).max(2);
        let status_w = "unreachable".len();
        println!("\n{:<ip_w$}  {:<status_w$}  detail", "ip", "status");
        println!("{:-<ip_w$}  {:-<status_w$}  {:-<6}", "", "", "");
        for p in down {
            let status = match p.status {
                ProbeStatus::Error => "error",
                _ => "unreachable",
            };
            let detail: String = p.detail.as_deref().unwrap_or("").chars().take(60).collect();
            println!("{:<ip_w$}  {:<status_w$}  {}", p.address, status, detail);
        }
    }

    for s in hosts.iter().filter_map(|h| h.session.as_ref()) {
        match s.status {
            SessionStatus::Success => {
                let code = s.exit_status.map_or_else(|| "?".to_string(), |c| c.to_string());
                println!("\n== {} (exit {code}){}", s.address, if s.truncated { " [truncated]" } else { "" });
                print!("{}", s.stdout);
                if !s.stderr.is_empty() {
                    println!("-- stderr --");
                    print!("{}", s.stderr);
                }
            }
            status => println!(
                "\n== {} {:?}: {}",
                s.address,
                status,
                s.detail.as_deref().unwrap_or("")
            ),
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    summary: &'a RunSummary,
    hosts: &'a [HostRecord],
}

fn write_results_json(path: &Path, summary: &RunSummary, hosts: &[HostRecord]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &Report { summary, hosts })?;
    Ok(())
}

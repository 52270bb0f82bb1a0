mod accumulator;
mod aggregator;
mod capture;
mod classify;
mod config;
mod control;
mod probe;
mod procs;
mod resolver;
mod storage;
mod sync;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;

use crate::accumulator::TrafficAccumulator;
use crate::aggregator::{RateAggregator, TickOutput};
use crate::capture::{CaptureEngine, PacketSource, PnetSource, monitored_interfaces};
use crate::classify::{ClassifyPolicy, PacketClassifier};
use crate::config::Config;
use crate::probe::LatencyProbe;
use crate::procs::ProcfsTable;
use crate::resolver::PortResolver;
use crate::storage::{SqliteStore, TrafficStore};
use crate::sync::CloudSync;

/// Lifetime totals hit the database once per this many ticks.
const PERSIST_EVERY_TICKS: u64 = 5;

/// NetPulse - per-process network bandwidth monitor for Linux
#[derive(Parser, Debug)]
#[command(name = "netpulse")]
#[command(version = "0.2.0")]
#[command(about = "Per-process network bandwidth monitor - who is eating your pipe", long_about = None)]
struct Args {
    /// Interfaces to capture on, comma-separated (default: config file, else all up non-loopback)
    #[arg(long, value_name = "IFACES", value_delimiter = ',')]
    interfaces: Option<Vec<String>>,

    /// Print the N most recent stored traffic log records and exit
    #[arg(long, value_name = "N")]
    logs: Option<u32>,

    /// Restrict --logs output to one application name
    #[arg(long, value_name = "NAME", requires = "logs")]
    process: Option<String>,

    /// List running processes and exit
    #[arg(long)]
    list_processes: bool,

    /// Send SIGTERM to all processes with this name and exit
    #[arg(long, value_name = "NAME")]
    kill: Option<String>,
}

fn print_process_listing() {
    let processes = control::list_active_processes();
    println!("{} running process(es):", processes.len());
    for (pid, name) in processes {
        println!("  {:>7}  {}", pid, name);
    }
}

fn print_recent_logs(config: &Config, limit: u32, process: Option<&str>) -> Result<()> {
    let store = SqliteStore::open(&config.database_file()?)?;
    let records = store.fetch_recent_logs(limit, process)?;

    if records.is_empty() {
        println!("No traffic log records stored yet");
        return Ok(());
    }

    for record in records {
        println!(
            "{}  {:<24} down {:>10.3} KB  up {:>10.3} KB  {} -> {}",
            format_timestamp(record.timestamp),
            record.app_name,
            record.download_kb,
            record.upload_kb,
            record.src_addr,
            record.dst_addr
        );
    }
    Ok(())
}

/// Render a float Unix timestamp in local time.
fn format_timestamp(timestamp: f64) -> String {
    use chrono::{Local, TimeZone};

    let secs = timestamp as i64;
    let nanos = ((timestamp - secs as f64) * 1e9) as u32;
    match Local.timestamp_opt(secs, nanos) {
        chrono::LocalResult::Single(moment) => moment.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => format!("{:.3}", timestamp),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    let config = Config::load().unwrap_or_default();

    // Handle the one-shot commands before touching any capture machinery
    if args.list_processes {
        print_process_listing();
        return Ok(());
    }

    if let Some(name) = args.kill.as_deref() {
        let signalled = control::terminate_by_name(name);
        println!("Sent SIGTERM to {} process(es) named '{}'", signalled, name);
        return Ok(());
    }

    if let Some(limit) = args.logs {
        return print_recent_logs(&config, limit, args.process.as_deref());
    }

    run_monitor(&args, &config).await
}

async fn run_monitor(args: &Args, config: &Config) -> Result<()> {
    if !ProcfsTable::is_available() {
        log::warn!("procfs socket tables not available; traffic will show up unattributed");
    }

    let resolver = PortResolver::new(Box::new(ProcfsTable::new()));
    let policy = ClassifyPolicy {
        account_arp: config.arp_accounting,
        account_unknown_protocols: config.unknown_protocol_accounting,
    };
    let classifier = Arc::new(PacketClassifier::new(resolver, policy));
    let accumulator = Arc::new(TrafficAccumulator::new());

    let database_path = config.database_file()?;
    let store = Arc::new(SqliteStore::open(&database_path)?);
    log::info!("Traffic database at {:?}", database_path);
    let mut aggregator = RateAggregator::load(Arc::clone(&accumulator), store);

    let filter = args.interfaces.as_deref().or(config.interfaces.as_deref());
    let interfaces = monitored_interfaces(filter);
    if interfaces.is_empty() {
        anyhow::bail!("No capture interfaces matched; check --interfaces or the config filter");
    }

    let mut sources: Vec<Box<dyn PacketSource>> = Vec::new();
    for interface in &interfaces {
        match PnetSource::open(interface) {
            Ok(source) => {
                sources.push(Box::new(source));
            }
            Err(e) => {
                log::warn!("Skipping {}: {}", interface.name, e);
            }
        }
    }
    if sources.is_empty() {
        anyhow::bail!("Could not open any capture interface (needs root or CAP_NET_RAW)");
    }
    log::info!("Monitoring {} interface(s)", sources.len());

    let engine = CaptureEngine::start(sources, classifier, Arc::clone(&accumulator));
    let sync = CloudSync::start(&config.sync);
    if sync.is_enabled() {
        log::info!("Cloud sync enabled ({})", config.sync.server_url);
    }
    let probe = config
        .probe
        .enabled
        .then(|| LatencyProbe::start(config.probe.targets.clone()));

    let mut tick_interval = interval(Duration::from_secs(1));
    // The first tick completes immediately; consume it so ticks land at 1 Hz
    tick_interval.tick().await;
    let mut tick_count = 0u64;

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                tick_count += 1;
                let output = aggregator.tick();
                sync.push_status(&output.live_rates);
                sync.push_logs(&output.log_records);
                log_tick_summary(&output, probe.as_ref());

                if tick_count % PERSIST_EVERY_TICKS == 0 {
                    aggregator.persist();
                }
            }
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    engine.stop();
    sync.stop();
    if let Some(probe) = probe {
        probe.stop();
    }
    aggregator.persist();

    Ok(())
}

/// One info line per tick with the busiest processes, so `RUST_LOG=info`
/// gives a usable live view without the database.
fn log_tick_summary(output: &TickOutput, probe: Option<&LatencyProbe>) {
    let mut active: Vec<_> = output
        .live_rates
        .iter()
        .filter(|(_, rate)| rate.download_kb > 0.0 || rate.upload_kb > 0.0)
        .collect();

    if active.is_empty() {
        log::debug!("Tick: no traffic");
        return;
    }

    active.sort_by(|a, b| {
        let a_total = a.1.download_kb + a.1.upload_kb;
        let b_total = b.1.download_kb + b.1.upload_kb;
        b_total
            .partial_cmp(&a_total)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let summary: Vec<String> = active
        .iter()
        .take(5)
        .map(|(name, rate)| format!("{} {:.1}/{:.1} KB/s", name, rate.download_kb, rate.upload_kb))
        .collect();
    log::info!("{} app(s) active: {}", active.len(), summary.join(", "));

    if let Some(probe) = probe {
        let readings = probe.readings();
        if !readings.is_empty() {
            let mut parts: Vec<String> = readings
                .iter()
                .map(|(name, millis)| format!("{} {:.1}ms", name, millis))
                .collect();
            parts.sort();
            log::debug!("Latency: {}", parts.join(", "));
        }
    }
}

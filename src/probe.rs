// Active latency probing of well-known hosts via the system ping binary

use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use regex::Regex;

use crate::config::ProbeTarget;

/// Delay between full probe rounds.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
/// Matches the RTT in ping's reply line, e.g. `time=12.4 ms` or `time<1ms`.
const PING_TIME_PATTERN: &str = r"time[=<](\d+\.?\d*)";

/// Pings each configured target from a background thread and keeps the
/// latest round-trip time per target name. A failed or unparseable ping
/// reports 0.0 rather than going stale silently.
pub struct LatencyProbe {
    readings: Arc<Mutex<HashMap<String, f64>>>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LatencyProbe {
    pub fn start(targets: Vec<ProbeTarget>) -> Self {
        let readings = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        if targets.is_empty() {
            log::debug!("Latency probe disabled (no targets configured)");
            return Self {
                readings,
                running,
                handle: None,
            };
        }

        let handle = thread::spawn({
            let readings = Arc::clone(&readings);
            let running = Arc::clone(&running);
            move || probe_worker(targets, readings, running)
        });

        Self {
            readings,
            running,
            handle: Some(handle),
        }
    }

    /// Latest round-trip time in milliseconds per target name.
    pub fn readings(&self) -> HashMap<String, f64> {
        self.readings.lock().unwrap().clone()
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn probe_worker(
    targets: Vec<ProbeTarget>,
    readings: Arc<Mutex<HashMap<String, f64>>>,
    running: Arc<AtomicBool>,
) {
    let pattern = match Regex::new(PING_TIME_PATTERN) {
        Ok(pattern) => pattern,
        Err(e) => {
            log::error!("Latency probe unavailable: {}", e);
            return;
        }
    };
    log::info!("Latency probe started ({} target(s))", targets.len());

    while running.load(Ordering::Relaxed) {
        for target in &targets {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let millis = ping_once(&pattern, &target.host);
            readings.lock().unwrap().insert(target.name.clone(), millis);
        }
        sleep_while_running(&running, PROBE_INTERVAL);
    }

    log::debug!("Latency probe exiting");
}

/// One ping round-trip in milliseconds, or 0.0 when the host is
/// unreachable or the output is unrecognized.
fn ping_once(pattern: &Regex, host: &str) -> f64 {
    match Command::new("ping").args(["-c", "1", "-w", "2", host]).output() {
        Ok(output) if output.status.success() => {
            parse_ping_time(pattern, &String::from_utf8_lossy(&output.stdout))
        }
        Ok(_) => 0.0,
        Err(e) => {
            log::debug!("Could not spawn ping for {}: {}", host, e);
            0.0
        }
    }
}

fn parse_ping_time(pattern: &Regex, stdout: &str) -> f64 {
    pattern
        .captures(stdout)
        .and_then(|captures| captures.get(1))
        .and_then(|group| group.as_str().parse().ok())
        .unwrap_or(0.0)
}

/// Sleep in short slices so a stop request is honored quickly.
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(250);
    let mut remaining = total;
    while running.load(Ordering::Relaxed) && remaining > Duration::ZERO {
        let nap = remaining.min(slice);
        thread::sleep(nap);
        remaining -= nap;
    }
}

// Background upload of traffic logs and status to a remote collector

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::aggregator::{LiveRate, TrafficLogRecord};
use crate::config::SyncConfig;

/// Upload cadence.
const UPLOAD_INTERVAL: Duration = Duration::from_secs(5);
/// Largest batch per request; anything beyond waits for the next cycle.
const MAX_BATCH: usize = 50;
/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Serialize)]
struct UploadPayload<'a> {
    api_key: &'a str,
    logs: &'a [TrafficLogRecord],
    status: &'a HashMap<String, LiveRate>,
}

/// Ships tick output to a remote endpoint from a dedicated thread, so the
/// tick path never touches the network. Without an API key the client is
/// inert: pushes are discarded and no thread is spawned.
///
/// Delivery is best-effort. A failed batch is dropped, not re-queued -
/// this is live telemetry, not a ledger.
pub struct CloudSync {
    queue: Arc<Mutex<Vec<TrafficLogRecord>>>,
    status: Arc<Mutex<HashMap<String, LiveRate>>>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    enabled: bool,
}

impl CloudSync {
    pub fn start(config: &SyncConfig) -> Self {
        let queue = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let api_key = config.api_key.clone().filter(|key| !key.is_empty());
        let Some(api_key) = api_key else {
            log::debug!("Cloud sync disabled (no API key configured)");
            return Self {
                queue,
                status,
                running,
                handle: None,
                enabled: false,
            };
        };

        let url = config.server_url.clone();
        let handle = thread::spawn({
            let queue = Arc::clone(&queue);
            let status = Arc::clone(&status);
            let running = Arc::clone(&running);
            move || upload_worker(url, api_key, queue, status, running)
        });

        Self {
            queue,
            status,
            running,
            handle: Some(handle),
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Queue records for the next upload cycle. Never blocks on the
    /// network.
    pub fn push_logs(&self, records: &[TrafficLogRecord]) {
        if !self.enabled || records.is_empty() {
            return;
        }
        self.queue.lock().unwrap().extend_from_slice(records);
    }

    /// Replace the status snapshot sent alongside the next batch.
    pub fn push_status(&self, live_rates: &HashMap<String, LiveRate>) {
        if !self.enabled {
            return;
        }
        *self.status.lock().unwrap() = live_rates.clone();
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn take_batch(queue: &Mutex<Vec<TrafficLogRecord>>) -> Vec<TrafficLogRecord> {
    let mut queue = queue.lock().unwrap();
    let take = queue.len().min(MAX_BATCH);
    queue.drain(..take).collect()
}

fn upload_worker(
    url: String,
    api_key: String,
    queue: Arc<Mutex<Vec<TrafficLogRecord>>>,
    status: Arc<Mutex<HashMap<String, LiveRate>>>,
    running: Arc<AtomicBool>,
) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            log::error!("Cloud sync unavailable: {}", e);
            return;
        }
    };
    log::info!("Cloud sync worker started ({})", url);

    while running.load(Ordering::Relaxed) {
        sleep_while_running(&running, UPLOAD_INTERVAL);

        let batch = take_batch(&queue);
        let status_snapshot = status.lock().unwrap().clone();
        if batch.is_empty() && status_snapshot.is_empty() {
            continue;
        }

        let payload = UploadPayload {
            api_key: &api_key,
            logs: &batch,
            status: &status_snapshot,
        };
        match client.post(url.as_str()).json(&payload).send() {
            Ok(response) if response.status().is_success() => {
                log::debug!("Uploaded {} log record(s)", batch.len());
            }
            Ok(response) => {
                log::warn!("Upload rejected: HTTP {}", response.status());
            }
            Err(e) => {
                log::warn!("Upload failed: {}", e);
            }
        }
    }

    log::debug!("Cloud sync worker exiting");
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

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timestamp: f64) -> TrafficLogRecord {
        TrafficLogRecord {
            timestamp,
            app_name: "chrome".to_string(),
            download_kb: 1.0,
            upload_kb: 0.0,
            src_addr: "10.0.0.5".to_string(),
            dst_addr: "142.250.1.1".to_string(),
        }
    }

    #[test]
    fn test_batches_cap_at_fifty_in_arrival_order() {
        let queue = Mutex::new((0..120).map(|i| record(i as f64)).collect::<Vec<_>>());

        let first = take_batch(&queue);
        assert_eq!(first.len(), 50);
        assert_eq!(first[0].timestamp, 0.0);
        assert_eq!(first[49].timestamp, 49.0);

        let second = take_batch(&queue);
        assert_eq!(second.len(), 50);
        assert_eq!(second[0].timestamp, 50.0);

        let third = take_batch(&queue);
        assert_eq!(third.len(), 20);
        assert!(take_batch(&queue).is_empty());
    }

    #[test]
    fn test_without_api_key_the_client_is_inert() {
        let sync = CloudSync::start(&SyncConfig {
            server_url: "http://127.0.0.1:5000/api/upload".to_string(),
            api_key: None,
        });

        assert!(!sync.is_enabled());
        sync.push_logs(&[record(1.0)]);
        assert!(sync.queue.lock().unwrap().is_empty());
        sync.stop();
    }

    #[test]
    fn test_empty_api_key_counts_as_unconfigured() {
        let sync = CloudSync::start(&SyncConfig {
            server_url: "http://127.0.0.1:5000/api/upload".to_string(),
            api_key: Some(String::new()),
        });

        assert!(!sync.is_enabled());
        sync.stop();
    }

    #[test]
    fn test_payload_wire_shape() {
        let logs = vec![record(1.5)];
        let mut status = HashMap::new();
        status.insert(
            "chrome".to_string(),
            LiveRate {
                download_kb: 3.5,
                upload_kb: 0.5,
            },
        );
        let payload = UploadPayload {
            api_key: "secret",
            logs: &logs,
            status: &status,
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["api_key"], "secret");
        assert_eq!(value["logs"][0]["app_name"], "chrome");
        assert_eq!(value["logs"][0]["timestamp"], 1.5);
        assert_eq!(value["status"]["chrome"]["download_kb"], 3.5);
    }
}

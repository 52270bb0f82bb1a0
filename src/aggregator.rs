// Rate aggregation: drained byte counters to per-process speeds and totals

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::accumulator::{ByteCounters, TrafficAccumulator};
use crate::classify::Attribution;
use crate::storage::TrafficStore;

/// Floor for the elapsed time used in speed computation. Ticks arriving
/// faster than this (or a clock step backwards) use the floor instead of
/// blowing the rates up.
const MIN_ELAPSED_SECS: f64 = 0.1;

/// Instantaneous per-process speeds in KB/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LiveRate {
    pub download_kb: f64,
    pub upload_kb: f64,
}

/// One non-zero activity observation, as appended to the log sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficLogRecord {
    /// Unix timestamp, fractional seconds.
    pub timestamp: f64,
    pub app_name: String,
    pub download_kb: f64,
    pub upload_kb: f64,
    pub src_addr: String,
    pub dst_addr: String,
}

/// What one aggregation tick produced.
pub struct TickOutput {
    pub live_rates: HashMap<String, LiveRate>,
    pub log_records: Vec<TrafficLogRecord>,
}

/// Drains the accumulator once per tick and turns the byte deltas into
/// speeds, lifetime totals, and log records.
///
/// The live-rate snapshot is seeded with a zero entry for every process
/// in the lifetime totals, so a process that goes quiet stays visible at
/// (0, 0) instead of vanishing from the view.
pub struct RateAggregator {
    accumulator: Arc<TrafficAccumulator>,
    store: Arc<dyn TrafficStore>,
    totals: HashMap<String, ByteCounters>,
    last_tick: SystemTime,
}

impl RateAggregator {
    /// Build the aggregator, seeding lifetime totals from the store. A
    /// load failure starts from an empty baseline rather than refusing
    /// to run.
    pub fn load(accumulator: Arc<TrafficAccumulator>, store: Arc<dyn TrafficStore>) -> Self {
        let totals = match store.load_totals() {
            Ok(totals) => {
                log::info!("Loaded lifetime totals for {} process(es)", totals.len());
                totals
            }
            Err(e) => {
                log::warn!("Could not load lifetime totals, starting empty: {}", e);
                HashMap::new()
            }
        };

        Self {
            accumulator,
            store,
            totals,
            last_tick: SystemTime::now(),
        }
    }

    pub fn tick(&mut self) -> TickOutput {
        self.tick_at(SystemTime::now())
    }

    fn tick_at(&mut self, now: SystemTime) -> TickOutput {
        let elapsed = now
            .duration_since(self.last_tick)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
            .max(MIN_ELAPSED_SECS);
        self.last_tick = now;

        // Every process ever accounted stays visible, idle or not.
        let mut live_rates: HashMap<String, LiveRate> = self
            .totals
            .keys()
            .map(|name| (name.clone(), LiveRate::default()))
            .collect();

        let timestamp = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let mut log_records = Vec::new();

        for (key, counters) in self.accumulator.drain_and_reset() {
            // Ping chatter would drown the real rows; it never reaches
            // totals, rates, or logs.
            if key.attribution == Attribution::Icmp {
                continue;
            }
            let name = key.attribution.to_string();

            let total = self.totals.entry(name.clone()).or_default();
            total.download_bytes += counters.download_bytes;
            total.upload_bytes += counters.upload_bytes;

            let download_kb = (counters.download_bytes as f64 / 1024.0) / elapsed;
            let upload_kb = (counters.upload_bytes as f64 / 1024.0) / elapsed;

            // Buckets differing only by peer address sum into one row
            let rate = live_rates.entry(name.clone()).or_default();
            rate.download_kb += download_kb;
            rate.upload_kb += upload_kb;

            if counters.download_bytes > 0 || counters.upload_bytes > 0 {
                log_records.push(TrafficLogRecord {
                    timestamp,
                    app_name: name,
                    download_kb,
                    upload_kb,
                    src_addr: key.src_addr.to_string(),
                    dst_addr: key.dst_addr.to_string(),
                });
            }
        }

        if !log_records.is_empty() {
            if let Err(e) = self.store.append_logs(&log_records) {
                log::warn!("Could not append traffic logs: {}", e);
            }
        }

        TickOutput {
            live_rates,
            log_records,
        }
    }

    /// Flush lifetime totals to the store. Called on a slow cadence and
    /// once at shutdown; a failure is logged and retried next time.
    pub fn persist(&self) {
        match self.store.save_totals(&self.totals) {
            Ok(()) => log::debug!("Persisted totals for {} process(es)", self.totals.len()),
            Err(e) => log::warn!("Could not persist lifetime totals: {}", e),
        }
    }

    pub fn totals(&self) -> &HashMap<String, ByteCounters> {
        &self.totals
    }
}

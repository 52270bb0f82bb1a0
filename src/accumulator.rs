// Concurrent per-flow byte accounting

use std::collections::HashMap;
use std::mem;
use std::sync::Mutex;

use crate::classify::{Direction, TrafficEvent, TrafficKey};

/// Cumulative bytes for one flow bucket within the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub download_bytes: u64,
    pub upload_bytes: u64,
}

/// Flow buckets shared between the capture threads (writers) and the
/// aggregator tick (drainer). One lock covers both paths, so a drain can
/// never observe a half-applied increment, and everything recorded after
/// the drain lands in the next window.
#[derive(Default)]
pub struct TrafficAccumulator {
    buckets: Mutex<HashMap<TrafficKey, ByteCounters>>,
}

impl TrafficAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: TrafficEvent) {
        let mut buckets = self.buckets.lock().unwrap();
        let counters = buckets.entry(event.key).or_default();
        match event.direction {
            Direction::Download => counters.download_bytes += event.size,
            Direction::Upload => counters.upload_bytes += event.size,
        }
    }

    /// Take the window's buckets, leaving the accumulator empty.
    pub fn drain_and_reset(&self) -> HashMap<TrafficKey, ByteCounters> {
        let mut buckets = self.buckets.lock().unwrap();
        mem::take(&mut *buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Attribution;
    use std::sync::Arc;
    use std::thread;

    fn key(name: &str, src: &str, dst: &str) -> TrafficKey {
        TrafficKey {
            attribution: Attribution::Process(name.to_string()),
            src_addr: src.parse().unwrap(),
            dst_addr: dst.parse().unwrap(),
        }
    }

    fn event(key: TrafficKey, size: u64, direction: Direction) -> TrafficEvent {
        TrafficEvent {
            key,
            size,
            direction,
        }
    }

    #[test]
    fn test_drain_returns_exact_bytes_and_clears() {
        let acc = TrafficAccumulator::new();
        let chrome = key("chrome", "10.0.0.5", "142.250.1.1");
        let sshd = key("sshd", "10.0.0.5", "10.0.0.9");

        acc.record(event(chrome.clone(), 1024, Direction::Download));
        acc.record(event(chrome.clone(), 512, Direction::Download));
        acc.record(event(chrome.clone(), 256, Direction::Upload));
        acc.record(event(sshd.clone(), 100, Direction::Upload));

        let drained = acc.drain_and_reset();
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[&chrome],
            ByteCounters {
                download_bytes: 1536,
                upload_bytes: 256,
            }
        );
        assert_eq!(
            drained[&sshd],
            ByteCounters {
                download_bytes: 0,
                upload_bytes: 100,
            }
        );

        // Everything was taken; the next window starts empty
        assert!(acc.drain_and_reset().is_empty());
    }

    #[test]
    fn test_zero_sized_record_still_creates_the_bucket() {
        let acc = TrafficAccumulator::new();
        acc.record(event(
            key("idle", "10.0.0.5", "10.0.0.9"),
            0,
            Direction::Download,
        ));

        let drained = acc.drain_and_reset();
        assert_eq!(drained.len(), 1);
        assert_eq!(
            drained.values().next().unwrap(),
            &ByteCounters::default()
        );
    }

    #[test]
    fn test_no_bytes_lost_across_concurrent_drains() {
        const WRITERS: usize = 4;
        const RECORDS_PER_WRITER: u64 = 500;

        let acc = Arc::new(TrafficAccumulator::new());
        let mut handles = Vec::new();

        for writer in 0..WRITERS {
            let acc = Arc::clone(&acc);
            handles.push(thread::spawn(move || {
                let k = key(&format!("writer-{}", writer), "10.0.0.5", "10.0.0.9");
                for _ in 0..RECORDS_PER_WRITER {
                    acc.record(event(k.clone(), 1, Direction::Download));
                }
            }));
        }

        // Drain while the writers are running; drained epochs plus the
        // final drain must account for every byte exactly once.
        let mut total = 0u64;
        for _ in 0..20 {
            for counters in acc.drain_and_reset().values() {
                total += counters.download_bytes;
            }
            thread::yield_now();
        }

        for handle in handles {
            handle.join().unwrap();
        }
        for counters in acc.drain_and_reset().values() {
            total += counters.download_bytes;
        }

        assert_eq!(total, WRITERS as u64 * RECORDS_PER_WRITER);
    }
}

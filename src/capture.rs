// Packet capture threads feeding the classifier and accumulator

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, NetworkInterface};

use crate::accumulator::TrafficAccumulator;
use crate::classify::PacketClassifier;

/// Cap on how long a blocked read can delay a stop request.
const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause after a capture error before trying the source again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// One source of raw link-layer frames. `Ok(None)` is a poll timeout, not
/// an error; workers use it to re-check the stop flag.
pub trait PacketSource: Send {
    fn name(&self) -> &str;
    fn next_packet(&mut self) -> io::Result<Option<&[u8]>>;
}

/// Frames from one interface via a pnet datalink channel.
pub struct PnetSource {
    name: String,
    rx: Box<dyn DataLinkReceiver>,
}

impl PnetSource {
    pub fn open(interface: &NetworkInterface) -> Result<Self> {
        let config = Config {
            read_timeout: Some(READ_TIMEOUT),
            read_buffer_size: 65536,
            ..Default::default()
        };

        match datalink::channel(interface, config) {
            Ok(Channel::Ethernet(_, rx)) => Ok(Self {
                name: interface.name.clone(),
                rx,
            }),
            Ok(_) => Err(anyhow::anyhow!(
                "Unsupported channel type for {}",
                interface.name
            )),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to open capture on {}: {}",
                interface.name,
                e
            )),
        }
    }
}

impl PacketSource for PnetSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_packet(&mut self) -> io::Result<Option<&[u8]>> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame)),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Interfaces worth capturing on. With a filter, exact names win; without
/// one, every interface that is up, has an address, and is not loopback.
pub fn monitored_interfaces(filter: Option<&[String]>) -> Vec<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .filter(|iface| match filter {
            Some(names) => names.iter().any(|name| name == &iface.name),
            None => iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty(),
        })
        .collect()
}

/// Owns one capture thread per source plus the shared stop flag.
pub struct CaptureEngine {
    running: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl CaptureEngine {
    pub fn start(
        sources: Vec<Box<dyn PacketSource>>,
        classifier: Arc<PacketClassifier>,
        accumulator: Arc<TrafficAccumulator>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::new();

        for source in sources {
            let running = Arc::clone(&running);
            let classifier = Arc::clone(&classifier);
            let accumulator = Arc::clone(&accumulator);
            handles.push(thread::spawn(move || {
                capture_worker(source, running, classifier, accumulator);
            }));
        }

        log::info!("Started packet capture on {} source(s)", handles.len());
        Self { running, handles }
    }

    /// Ask the workers to exit and wait for them. Bounded by the source
    /// read timeout (plus one error backoff in the worst case).
    pub fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.join();
        }
        log::info!("Packet capture stopped");
    }
}

fn capture_worker(
    mut source: Box<dyn PacketSource>,
    running: Arc<AtomicBool>,
    classifier: Arc<PacketClassifier>,
    accumulator: Arc<TrafficAccumulator>,
) {
    let name = source.name().to_string();
    log::info!("Capture thread started on {}", name);

    while running.load(Ordering::Relaxed) {
        match source.next_packet() {
            Ok(Some(frame)) => {
                if let Some(event) = classifier.classify(frame) {
                    accumulator.record(event);
                }
            }
            Ok(None) => {}
            Err(e) => {
                // Transient driver/device errors self-heal; sit out one
                // backoff instead of spinning or dying.
                log::warn!("Capture error on {}: {}", name, e);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    log::debug!("Capture thread on {} exiting", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassifyPolicy;
    use crate::procs::ProcessTable;
    use crate::resolver::PortResolver;
    use std::time::Instant;

    struct EmptyTable;

    impl ProcessTable for EmptyTable {
        fn name(&self) -> &'static str {
            "empty"
        }

        fn find_by_local_port(&self, _port: u16) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    /// Yields the queued frames once, then behaves like an idle interface.
    struct FakeSource {
        frames: Vec<Vec<u8>>,
        cursor: usize,
    }

    impl FakeSource {
        fn new(frames: Vec<Vec<u8>>) -> Self {
            Self { frames, cursor: 0 }
        }
    }

    impl PacketSource for FakeSource {
        fn name(&self) -> &str {
            "fake0"
        }

        fn next_packet(&mut self) -> io::Result<Option<&[u8]>> {
            if self.cursor < self.frames.len() {
                let index = self.cursor;
                self.cursor += 1;
                Ok(Some(&self.frames[index]))
            } else {
                thread::sleep(Duration::from_millis(5));
                Ok(None)
            }
        }
    }

    /// Fails the first read, then serves frames like `FakeSource`.
    struct RecoveringSource {
        inner: FakeSource,
        failed: bool,
    }

    impl PacketSource for RecoveringSource {
        fn name(&self) -> &str {
            "flaky0"
        }

        fn next_packet(&mut self) -> io::Result<Option<&[u8]>> {
            if !self.failed {
                self.failed = true;
                return Err(io::Error::other("device reset"));
            }
            self.inner.next_packet()
        }
    }

    fn arp_frame(len: usize) -> Vec<u8> {
        use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
        let mut buf = vec![0u8; len];
        let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
        eth.set_ethertype(EtherTypes::Arp);
        buf
    }

    fn test_classifier() -> Arc<PacketClassifier> {
        Arc::new(PacketClassifier::new(
            PortResolver::new(Box::new(EmptyTable)),
            ClassifyPolicy::default(),
        ))
    }

    #[test]
    fn test_captured_frames_reach_the_accumulator() {
        let accumulator = Arc::new(TrafficAccumulator::new());
        let source = FakeSource::new(vec![arp_frame(60), arp_frame(60), arp_frame(60)]);

        let engine = CaptureEngine::start(
            vec![Box::new(source)],
            test_classifier(),
            Arc::clone(&accumulator),
        );

        // Drain repeatedly until every byte has shown up; summing across
        // drains also exercises the window boundary under a live writer.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = 0u64;
        while seen < 180 && Instant::now() < deadline {
            for counters in accumulator.drain_and_reset().values() {
                seen += counters.download_bytes + counters.upload_bytes;
            }
            thread::sleep(Duration::from_millis(10));
        }
        engine.stop();

        assert_eq!(seen, 180);
    }

    #[test]
    fn test_worker_resumes_after_a_read_error() {
        let accumulator = Arc::new(TrafficAccumulator::new());
        let source = RecoveringSource {
            inner: FakeSource::new(vec![arp_frame(60), arp_frame(60), arp_frame(60)]),
            failed: false,
        };

        let engine = CaptureEngine::start(
            vec![Box::new(source)],
            test_classifier(),
            Arc::clone(&accumulator),
        );

        // The first read fails, so the worker sits out one backoff before
        // any frame arrives. Everything queued must still be accounted.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = 0u64;
        while seen < 180 && Instant::now() < deadline {
            for counters in accumulator.drain_and_reset().values() {
                seen += counters.download_bytes + counters.upload_bytes;
            }
            thread::sleep(Duration::from_millis(10));
        }
        engine.stop();

        assert_eq!(seen, 180);
    }

    #[test]
    fn test_stop_returns_promptly_while_idle() {
        let accumulator = Arc::new(TrafficAccumulator::new());
        let engine = CaptureEngine::start(
            vec![Box::new(FakeSource::new(Vec::new()))],
            test_classifier(),
            accumulator,
        );

        thread::sleep(Duration::from_millis(50));
        let begin = Instant::now();
        engine.stop();
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}

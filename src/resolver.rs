// Port-to-process resolution with a time-bounded cache

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::procs::ProcessTable;

/// How long a resolved port stays trusted before the table is rescanned.
const CACHE_TTL: Duration = Duration::from_secs(10);

struct CacheEntry {
    name: String,
    resolved_at: Instant,
}

/// Maps local transport ports to owning process names.
///
/// A connection-table scan is O(open sockets) and far too slow to run per
/// packet, so successful lookups are cached for [`CACHE_TTL`]. Failed
/// lookups are never cached: the owning process may appear a moment later
/// (accept race), and a negative entry would hide it for a full TTL.
/// Expired entries are overwritten in place on the next lookup for that
/// port; nothing sweeps the cache.
pub struct PortResolver {
    table: Box<dyn ProcessTable>,
    cache: Mutex<HashMap<u16, CacheEntry>>,
}

impl PortResolver {
    pub fn new(table: Box<dyn ProcessTable>) -> Self {
        log::debug!("Port resolver using {} process table", table.name());
        Self {
            table,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `port` to a process name. `None` means no local process
    /// currently claims the port (or the lookup failed).
    pub fn resolve(&self, port: u16) -> Option<String> {
        self.resolve_at(port, Instant::now())
    }

    fn resolve_at(&self, port: u16, now: Instant) -> Option<String> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&port) {
                if now.duration_since(entry.resolved_at) < CACHE_TTL {
                    return Some(entry.name.clone());
                }
            }
        }

        // Miss or expired. The lock is not held across the scan, so two
        // capture threads may scan the same port concurrently; the loser
        // just overwrites with an equally fresh entry.
        match self.table.find_by_local_port(port) {
            Ok(Some(name)) => {
                let mut cache = self.cache.lock().unwrap();
                cache.insert(
                    port,
                    CacheEntry {
                        name: name.clone(),
                        resolved_at: now,
                    },
                );
                Some(name)
            }
            Ok(None) => None,
            Err(e) => {
                log::debug!("Lookup for port {} failed: {}", port, e);
                None
            }
        }
    }
}

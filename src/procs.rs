// Process ownership lookup via the Linux proc filesystem
//
// Socket ownership comes from two places:
// - /proc/net/{tcp,tcp6,udp,udp6} - local port -> socket inode
// - /proc/[pid]/fd/               - socket inode -> owning process

use anyhow::Result;
use procfs::process::{FDTarget, all_processes};

/// Resolves which local process owns a transport endpoint. One call may
/// scan the whole connection table, so callers cache aggressively (see
/// `resolver::PortResolver`).
pub trait ProcessTable: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Find the process with a socket bound locally to `port`, in any of
    /// the inet tables (TCP/UDP, v4/v6). `Ok(None)` when nothing matches.
    fn find_by_local_port(&self, port: u16) -> Result<Option<String>>;
}

pub struct ProcfsTable;

impl ProcfsTable {
    pub fn new() -> Self {
        Self
    }

    pub fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }

    /// Socket inodes bound to `port` across the four inet tables.
    fn socket_inodes(port: u16) -> Vec<u64> {
        let mut inodes = Vec::new();

        if let Ok(entries) = procfs::net::tcp() {
            inodes.extend(
                entries
                    .iter()
                    .filter(|e| e.local_address.port() == port)
                    .map(|e| e.inode),
            );
        }

        if let Ok(entries) = procfs::net::tcp6() {
            inodes.extend(
                entries
                    .iter()
                    .filter(|e| e.local_address.port() == port)
                    .map(|e| e.inode),
            );
        }

        if let Ok(entries) = procfs::net::udp() {
            inodes.extend(
                entries
                    .iter()
                    .filter(|e| e.local_address.port() == port)
                    .map(|e| e.inode),
            );
        }

        if let Ok(entries) = procfs::net::udp6() {
            inodes.extend(
                entries
                    .iter()
                    .filter(|e| e.local_address.port() == port)
                    .map(|e| e.inode),
            );
        }

        inodes
    }
}

impl ProcessTable for ProcfsTable {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn find_by_local_port(&self, port: u16) -> Result<Option<String>> {
        let inodes = Self::socket_inodes(port);
        if inodes.is_empty() {
            return Ok(None);
        }

        // Walk every process's fd table looking for one of the inodes.
        // Individual processes may vanish or deny access mid-scan; both
        // count as a miss for that process, not an error. A process that
        // exits between the fd match and the stat read is skipped too -
        // a forked sibling holding the same socket can still match later.
        for proc_result in all_processes()? {
            if let Ok(process) = proc_result {
                if let Ok(fds) = process.fd() {
                    for fd_result in fds {
                        if let Ok(fd_info) = fd_result {
                            if let FDTarget::Socket(inode) = fd_info.target {
                                if inodes.contains(&inode) {
                                    if let Ok(stat) = process.stat() {
                                        return Ok(Some(stat.comm));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_own_listener_is_found() {
        // Bind an ephemeral port; the test binary itself owns the socket,
        // and its own /proc entries are always readable.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let table = ProcfsTable::new();
        let name = table.find_by_local_port(port).unwrap();
        assert!(name.is_some(), "expected to resolve our own listener");
        assert!(!name.unwrap().is_empty());
    }

    #[test]
    fn test_unbound_port_resolves_to_nothing() {
        // Grab a free port, then release it before looking it up.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let table = ProcfsTable::new();
        assert_eq!(table.find_by_local_port(port).unwrap(), None);
    }

    #[test]
    fn test_procfs_reports_available() {
        assert!(ProcfsTable::is_available());
    }
}

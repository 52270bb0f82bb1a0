// Process listing and termination for the interactive commands

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::System;

/// Snapshot of running processes as `(pid, name)`, sorted by name with
/// one entry per name. Multi-process apps keep their lowest pid.
pub fn list_active_processes() -> Vec<(u32, String)> {
    let system = System::new_all();
    let mut processes: Vec<(u32, String)> = system
        .processes()
        .iter()
        .map(|(pid, process)| {
            (
                pid.as_u32(),
                process.name().to_str().unwrap_or("unknown").to_string(),
            )
        })
        .collect();
    processes.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    processes.dedup_by(|a, b| a.1 == b.1);
    processes
}

/// Send SIGTERM to every process whose name matches, case-insensitively.
/// Returns how many signals were actually delivered; processes we lack
/// permission for are logged and skipped.
pub fn terminate_by_name(name: &str) -> usize {
    let needle = name.to_lowercase();
    let system = System::new_all();
    let mut terminated = 0;

    for (pid, process) in system.processes() {
        let process_name = process.name().to_str().unwrap_or("unknown");
        if process_name.to_lowercase() != needle {
            continue;
        }
        let pid = Pid::from_raw(pid.as_u32() as i32);
        match signal::kill(pid, Signal::SIGTERM) {
            Ok(()) => {
                log::info!("Sent SIGTERM to {} (pid {})", process_name, pid);
                terminated += 1;
            }
            Err(e) => {
                log::warn!("Could not signal {} (pid {}): {}", process_name, pid, e);
            }
        }
    }

    terminated
}

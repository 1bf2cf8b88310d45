//! Container-to-PID resolution via proc filesystem scanning.
//!
//! Container runtimes embed the container's opaque ID in the cgroup paths of
//! every process belonging to it, so a substring match against
//! `/proc/<pid>/cgroup` is enough to find a host PID inside the container.
//! Any matching PID will do: all processes of a container share the network
//! namespace the capture needs to enter.

use std::fs;
use std::path::Path;

use tracing::warn;

/// Find a host PID whose cgroup membership contains `container_id`.
///
/// Scans the numeric subdirectories of `proc_root` (normally `/proc`).
/// Entries that cannot be read are skipped: processes exit mid-scan and
/// permission errors are routine in a live process table. Returns `None`
/// when no process matches, which callers treat as retryable - the
/// container may not have started yet.
pub fn find_pid_by_container_id(proc_root: &Path, container_id: &str) -> Option<i32> {
    let entries = match fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(root = %proc_root.display(), error = %err, "failed to read proc table");
            return None;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Ok(pid) = name.parse::<i32>() else {
            continue;
        };
        let Ok(cgroup) = fs::read_to_string(entry.path().join("cgroup")) else {
            continue;
        };
        if cgroup.lines().any(|line| line.contains(container_id)) {
            return Some(pid);
        }
    }

    None
}

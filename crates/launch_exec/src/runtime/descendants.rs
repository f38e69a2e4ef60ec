//! Tracking of descendant processes that inherited a child's stdio

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};

/// Interval between two scans of the process table
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Kernel inodes of the stdin/stdout/stderr descriptors of `pid`.
///
/// Best effort: descriptors that cannot be inspected (permissions, the
/// process already gone) are skipped.
#[cfg(target_os = "linux")]
pub fn stdio_inodes(pid: u32) -> HashSet<u64> {
    use std::os::unix::fs::MetadataExt;

    (0..=2)
        .filter_map(|fd| std::fs::metadata(format!("/proc/{}/fd/{}", pid, fd)).ok())
        .map(|meta| meta.ino())
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub fn stdio_inodes(_pid: u32) -> HashSet<u64> {
    HashSet::new()
}

/// Polls the process table for holders of a set of stdio inodes
pub struct DescendantTracker {
    inodes: HashSet<u64>,
    system: System,
    own_pid: u32,
}

impl DescendantTracker {
    pub fn new(inodes: HashSet<u64>) -> Self {
        Self {
            inodes,
            system: System::new(),
            own_pid: std::process::id(),
        }
    }

    /// Processes, other than this one, currently holding a tracked inode on
    /// one of their standard descriptors
    pub fn holders(&mut self) -> BTreeSet<u32> {
        if self.inodes.is_empty() {
            return BTreeSet::new();
        }

        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let own_pid = self.own_pid;
        let inodes = &self.inodes;
        self.system
            .processes()
            .iter()
            // Threads share their process's descriptors
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, _)| pid.as_u32())
            .filter(|pid| *pid != own_pid)
            .filter(|pid| !stdio_inodes(*pid).is_disjoint(inodes))
            .collect()
    }

    /// Wait until no process holds a tracked inode. Returns every holder seen.
    pub async fn wait_for_release(&mut self, name: &str, interval: Duration) -> BTreeSet<u32> {
        let mut seen = BTreeSet::new();
        loop {
            let holders = self.holders();
            if holders.is_empty() {
                return seen;
            }

            log::debug!(
                "[{}] process has child processes with PIDs: {}",
                name,
                join_pids(&holders)
            );
            seen.extend(holders);
            tokio::time::sleep(interval).await;
        }
    }
}

pub fn join_pids(pids: &BTreeSet<u32>) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

//! Process Tree Snapshots
//!
//! Native runtimes invoked by a task may start helper processes of their own.
//! A worker is placed in its own process group, so one group kill normally
//! reaches everything it started. Helpers that moved to another group (for
//! example via `setsid`) are found by walking parent links in `/proc` while the
//! worker is still unreaped, which keeps those links intact.

use std::collections::{BTreeSet, HashMap};
use std::io;

/// Parent pid and process group of one process, from `/proc/<pid>/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcStat {
    pub ppid: u32,
    pub pgrp: u32,
}

/// Parse the fields after the command name of a `/proc/<pid>/stat` line.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so parsing starts after the last `)`.
pub(crate) fn parse_stat(contents: &str) -> Option<ProcStat> {
    let after_comm = &contents[contents.rfind(')')? + 1..];
    let mut fields = after_comm.split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(ProcStat { ppid, pgrp })
}

/// A worker and the descendants observed at snapshot time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTree {
    root: u32,
    descendants: BTreeSet<u32>,
}

impl ProcessTree {
    /// Snapshot `root` and every live process descending from it or sharing
    /// its process group.
    pub fn snapshot(root: u32) -> Self {
        let descendants = Self::scan(root).unwrap_or_else(|e| {
            tracing::debug!(root, error = %e, "process table scan failed; relying on group kill");
            BTreeSet::new()
        });
        Self { root, descendants }
    }

    #[cfg(target_os = "linux")]
    fn scan(root: u32) -> io::Result<BTreeSet<u32>> {
        let mut table: HashMap<u32, ProcStat> = HashMap::new();
        for entry in std::fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes may vanish between readdir and read
            let Ok(contents) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some(stat) = parse_stat(&contents) {
                table.insert(pid, stat);
            }
        }
        Ok(Self::descendants_of(root, &table))
    }

    #[cfg(not(target_os = "linux"))]
    fn scan(_root: u32) -> io::Result<BTreeSet<u32>> {
        Ok(BTreeSet::new())
    }

    fn descendants_of(root: u32, table: &HashMap<u32, ProcStat>) -> BTreeSet<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (&pid, stat) in table {
            children.entry(stat.ppid).or_default().push(pid);
        }

        let mut found = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(pid) = stack.pop() {
            for &child in children.get(&pid).map(Vec::as_slice).unwrap_or(&[]) {
                if found.insert(child) {
                    stack.push(child);
                }
            }
        }

        // Reparented group members (their parent already exited)
        for (&pid, stat) in table {
            if stat.pgrp == root && pid != root {
                found.insert(pid);
            }
        }

        found
    }

    /// Root pid (the worker)
    pub fn root(&self) -> u32 {
        self.root
    }

    /// Descendant pids found by the snapshot
    pub fn descendants(&self) -> impl Iterator<Item = u32> + '_ {
        self.descendants.iter().copied()
    }

    /// SIGKILL the worker's process group and every snapshotted descendant.
    ///
    /// Already-exited processes are skipped silently. Returns the number of
    /// signals that were delivered.
    pub fn kill(&self) -> usize {
        let mut delivered = 0;
        if signal(-(self.root as i32), libc::SIGKILL) {
            delivered += 1;
        }
        // The group kill covers the root; this catches a root that never made it
        // into its own group.
        if signal(self.root as i32, libc::SIGKILL) {
            delivered += 1;
        }
        for pid in &self.descendants {
            if signal(*pid as i32, libc::SIGKILL) {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Send `sig` to `pid` (a negative pid addresses a process group).
///
/// ESRCH means the target is already gone and is not reported; anything else
/// is logged and otherwise ignored.
fn signal(pid: i32, sig: libc::c_int) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if ret == 0 {
        return true;
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        tracing::debug!(pid, "kill: no such process");
    } else {
        tracing::warn!(pid, error = %err, "failed to signal process");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_simple() {
        let stat = parse_stat("1234 (sleep) S 1200 1200 1200 0 -1 4194304").unwrap();
        assert_eq!(
            stat,
            ProcStat {
                ppid: 1200,
                pgrp: 1200
            }
        );
    }

    #[test]
    fn test_parse_stat_comm_with_parens_and_spaces() {
        let stat = parse_stat("77 (my (odd) prog) R 5 9 9 0").unwrap();
        assert_eq!(stat, ProcStat { ppid: 5, pgrp: 9 });
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat("12 (x) S").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_descendants_walk_and_group() {
        let mut table = HashMap::new();
        // 100 is the worker; 101 its child; 102 a grandchild that called setsid;
        // 103 reparented to init but still in group 100; 200 unrelated.
        table.insert(100, ProcStat { ppid: 1, pgrp: 100 });
        table.insert(101, ProcStat { ppid: 100, pgrp: 100 });
        table.insert(102, ProcStat { ppid: 101, pgrp: 102 });
        table.insert(103, ProcStat { ppid: 1, pgrp: 100 });
        table.insert(200, ProcStat { ppid: 1, pgrp: 200 });

        let found = ProcessTree::descendants_of(100, &table);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![101, 102, 103]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_snapshot_finds_spawned_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let tree = ProcessTree::snapshot(std::process::id());
        assert!(tree.descendants().any(|pid| pid == child.id()));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_signal_missing_process_is_quiet() {
        // pid_max on Linux never reaches this value
        assert!(!signal(i32::MAX - 1, 0));
    }
}

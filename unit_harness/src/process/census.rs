//! Process Census
//! ==============
//!
//! Point-in-time view of the OS process table (via `sysinfo`) plus the
//! descriptor counter. Each query takes a fresh snapshot; nothing is cached
//! between calls because the supervised tree changes underneath us.
//!
//! ```text
//!  count_descriptors(pid)          → DescriptorCount
//!  find_pid_by_name(parent, "unit: router") → Option<u32>
//!  list_zombies()                  → {ppid, …}
//!  rooted_at(pid)                  → [pid itself, direct children]
//! ```

use std::collections::BTreeSet;

use serde::Serialize;
use sysinfo::{ProcessRefreshKind, ProcessStatus, RefreshKind, UpdateKind};

use super::fds::*;

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: Option<u32>,
    /// Kernel short name (`comm`).
    pub name: String,
    /// Full command line; servers that retitle themselves show it here.
    pub command: String,
    pub zombie: bool,
}

impl ProcEntry {
    /// Substring match over the command line, falling back to the short
    /// name for processes without one (zombies, kernel threads).
    pub fn matches(&self, pattern: &str) -> bool {
        self.command.contains(pattern) || self.name.contains(pattern)
    }
}

impl std::fmt::Display for ProcEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ppid = self.ppid.map_or_else(|| "-".to_owned(), |p| p.to_string());
        let state = if self.zombie { "Z" } else { " " };
        let command = if self.command.is_empty() {
            &self.name
        } else {
            &self.command
        };
        write!(f, "{:>7} {:>7} {state} {command}", self.pid, ppid)
    }
}

#[derive(Debug, Default)]
pub struct ProcessCensus {
    fds: DescriptorCounter,
}

impl ProcessCensus {
    pub fn new(fds: DescriptorCounter) -> Self {
        Self { fds }
    }

    pub fn count_descriptors(&self, pid: u32) -> DescriptorCount {
        self.fds.count(pid)
    }

    pub fn snapshot(&self) -> Vec<ProcEntry> {
        let sys = sysinfo::System::new_with_specifics(
            RefreshKind::nothing()
                .with_processes(ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always)),
        );

        let mut entries: Vec<ProcEntry> = sys
            .processes()
            .values()
            .filter(|p| p.thread_kind().is_none())
            .map(|p| ProcEntry {
                pid: p.pid().as_u32(),
                ppid: p.parent().map(|pp| pp.as_u32()),
                name: p.name().to_string_lossy().into_owned(),
                command: p
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ")
                    .trim()
                    .to_owned(),
                zombie: matches!(p.status(), ProcessStatus::Zombie),
            })
            .collect();
        entries.sort_by_key(|e| e.pid);
        entries
    }

    /// First live child of `parent` whose command line contains `pattern`.
    /// `None` means "not observed yet", not an error.
    pub fn find_pid_by_name(&self, parent: u32, pattern: &str) -> Option<u32> {
        find_child(&self.snapshot(), parent, pattern)
    }

    /// Parent pids of every zombie in the table.
    pub fn list_zombies(&self) -> BTreeSet<u32> {
        zombie_parents(&self.snapshot())
    }

    /// `root` itself and its direct children.
    pub fn rooted_at(&self, root: u32) -> Vec<ProcEntry> {
        rooted(&self.snapshot(), root)
    }
}

pub fn find_child(table: &[ProcEntry], parent: u32, pattern: &str) -> Option<u32> {
    table
        .iter()
        .find(|e| e.ppid == Some(parent) && !e.zombie && e.matches(pattern))
        .map(|e| e.pid)
}

pub fn zombie_parents(table: &[ProcEntry]) -> BTreeSet<u32> {
    table
        .iter()
        .filter(|e| e.zombie)
        .filter_map(|e| e.ppid)
        .collect()
}

pub fn rooted(table: &[ProcEntry], root: u32) -> Vec<ProcEntry> {
    table
        .iter()
        .filter(|e| e.pid == root || e.ppid == Some(root))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::process::tests_helpers::*;

    fn entry(pid: u32, ppid: u32, command: &str, zombie: bool) -> ProcEntry {
        ProcEntry {
            pid,
            ppid: Some(ppid),
            name: "unitd".into(),
            command: command.into(),
            zombie,
        }
    }

    fn table() -> Vec<ProcEntry> {
        vec![
            entry(100, 1, "unit: main v1.32.0 [/build/sbin/unitd --no-daemon]", false),
            entry(101, 100, "unit: controller", false),
            entry(102, 100, "unit: router", false),
            entry(103, 100, "", true),
            entry(200, 1, "sleep 30", false),
        ]
    }

    #[test]
    fn table_queries() {
        let t = table();
        assert_eq!(find_child(&t, 100, "unit: router"), Some(102));
        assert_eq!(find_child(&t, 100, "unit: controller"), Some(101));
        assert_eq!(find_child(&t, 1, "unit: router"), None);
        assert_eq!(zombie_parents(&t), BTreeSet::from([100]));
        assert_eq!(rooted(&t, 100).len(), 4);
        assert!(rooted(&t, 999).is_empty());
        assert!(t[0].to_string().contains("unit: main"));
    }

    #[test]
    #[serial]
    fn snapshot_sees_children() {
        let census = ProcessCensus::default();
        let me = std::process::id();
        let mut child = long_cmd().spawn().unwrap();

        let found = census.find_pid_by_name(me, "sleep 30");
        let rooted = census.rooted_at(me);
        child.kill().unwrap();
        child.wait().unwrap();

        assert_eq!(found, Some(child.id()));
        assert!(rooted.iter().any(|e| e.pid == me));
        assert!(rooted.iter().any(|e| e.pid == child.id()));
    }

    #[test]
    #[serial]
    fn unreaped_child_is_a_zombie_of_ours() {
        let census = ProcessCensus::default();
        let me = std::process::id();
        let mut child = std::process::Command::new("true").spawn().unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if census.list_zombies().contains(&me) {
                seen = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        child.wait().unwrap();
        assert!(seen, "exited but unreaped child should show as zombie");
    }
}

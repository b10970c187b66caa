//! Open-descriptor counting
//! ========================
//!
//! A ranked chain of [`FdCounter`] strategies; the first one that produces a
//! number wins:
//!
//! 1. [`ProcFdDir`]  – list `/proc/<pid>/fd`
//! 2. [`Procstat`]   – `procstat -f <pid>`, one line per descriptor
//! 3. [`Lsof`]       – `lsof -n -p <pid>`, one line per descriptor
//!
//! When the whole chain comes up empty the result is
//! [`DescriptorCount::Unavailable`], which compares as zero for leak checks
//! and is announced with one warning per pid.

use std::{
    collections::HashSet,
    process::{Command, Stdio},
    sync::Mutex,
};

use serde::Serialize;

pub trait FdCounter: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when this strategy cannot answer for `pid`.
    fn count(&self, pid: u32) -> Option<usize>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFdDir;

impl FdCounter for ProcFdDir {
    fn name(&self) -> &'static str {
        "/proc"
    }

    fn count(&self, pid: u32) -> Option<usize> {
        std::fs::read_dir(format!("/proc/{pid}/fd"))
            .ok()
            .map(|entries| entries.count())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Procstat;

impl FdCounter for Procstat {
    fn name(&self) -> &'static str {
        "procstat"
    }

    fn count(&self, pid: u32) -> Option<usize> {
        count_output_lines(Command::new("procstat").arg("-f").arg(pid.to_string()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Lsof;

impl FdCounter for Lsof {
    fn name(&self) -> &'static str {
        "lsof"
    }

    fn count(&self, pid: u32) -> Option<usize> {
        count_output_lines(Command::new("lsof").arg("-n").arg("-p").arg(pid.to_string()))
    }
}

fn count_output_lines(cmd: &mut Command) -> Option<usize> {
    let out = cmd.stdin(Stdio::null()).stderr(Stdio::null()).output().ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).lines().count())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DescriptorCount {
    Counted { count: usize, source: &'static str },
    Unavailable,
}

impl DescriptorCount {
    /// Value used for leak arithmetic: unavailable counts as zero.
    pub fn value(&self) -> usize {
        match self {
            Self::Counted { count, .. } => *count,
            Self::Unavailable => 0,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Counted { .. })
    }
}

impl std::fmt::Display for DescriptorCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Counted { count, source } => write!(f, "{count} (via {source})"),
            Self::Unavailable => f.write_str("unavailable"),
        }
    }
}

#[derive(Debug)]
pub struct DescriptorCounter {
    chain: Vec<Box<dyn FdCounter>>,
    /// Pids already warned about.
    warned: Mutex<HashSet<u32>>,
}

impl Default for DescriptorCounter {
    fn default() -> Self {
        Self::with_chain(vec![Box::new(ProcFdDir), Box::new(Procstat), Box::new(Lsof)])
    }
}

impl DescriptorCounter {
    pub fn with_chain(chain: Vec<Box<dyn FdCounter>>) -> Self {
        Self {
            chain,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn count(&self, pid: u32) -> DescriptorCount {
        for strategy in &self.chain {
            if let Some(count) = strategy.count(pid) {
                crate::trace!("pid {pid}: {count} descriptors via {}", strategy.name());
                return DescriptorCount::Counted {
                    count,
                    source: strategy.name(),
                };
            }
        }
        let first = self
            .warned
            .lock()
            .expect("Failed to acquire warned lock")
            .insert(pid);
        if first {
            crate::warn!(
                "cannot count descriptors of pid {pid} (tried {}); descriptor leak checks are disabled",
                self.chain
                    .iter()
                    .map(|s| s.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        DescriptorCount::Unavailable
    }
}

//! Harness-level hygiene failures.
//!
//! Teardown never stops at the first problem: each check appends to a
//! [`TeardownReport`], and the report is turned into an error once every
//! check has run, so one failing test shows all of its hygiene problems.

use std::fmt::{self, Write as _};

use serde::Serialize;

use super::baseline::Role;
use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HygieneFailure {
    /// Graceful stop of the server failed (non-zero exit, timeout, wait error).
    StopUnit(String),
    /// A registered background process did not join in time.
    StopProcesses(String),
    DescriptorLeak {
        role: Role,
        pid: Option<u32>,
        baseline: usize,
        observed: usize,
        threshold: usize,
    },
    PidChanged {
        role: Role,
        before: Option<u32>,
        after: Option<u32>,
    },
    /// The process tree under the instance pid has the wrong shape.
    ProcessCount {
        expectation: &'static str,
        observed: Vec<String>,
    },
    /// A zombie whose parent is the instance.
    Zombie { parent: u32 },
    Alerts(Vec<String>),
    /// Resetting the configuration or the temp directory failed.
    Cleanup(String),
}

impl fmt::Display for HygieneFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopUnit(msg) => write!(f, "stop unit: {msg}"),
            Self::StopProcesses(msg) => write!(f, "stop processes: {msg}"),
            Self::DescriptorLeak {
                role,
                pid,
                baseline,
                observed,
                threshold,
            } => write!(
                f,
                "descriptors leak {role} process (pid {}): {observed} open, baseline {baseline}, threshold {threshold}",
                pid.map_or_else(|| "?".to_owned(), |p| p.to_string())
            ),
            Self::PidChanged { role, before, after } => {
                write!(f, "same pid {role}: was {before:?}, now {after:?}")
            }
            Self::ProcessCount {
                expectation,
                observed,
            } => {
                writeln!(f, "{expectation}; observed {} process(es):", observed.len())?;
                let mut ind = indenter::indented(f).with_str("    ");
                for line in observed {
                    writeln!(ind, "{line}")?;
                }
                Ok(())
            }
            Self::Zombie { parent } => write!(f, "no zombies: zombie child of pid {parent}"),
            Self::Alerts(lines) => {
                writeln!(f, "alert(s) in log:")?;
                let mut ind = indenter::indented(f).with_str("    ");
                for line in lines {
                    writeln!(ind, "{line}")?;
                }
                Ok(())
            }
            Self::Cleanup(msg) => write!(f, "cleanup: {msg}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub test: String,
    pub failures: Vec<HygieneFailure>,
}

impl TeardownReport {
    pub fn new(test: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, failure: HygieneFailure) {
        crate::debug!("{}: {failure}", self.test);
        self.failures.push(failure);
    }

    pub fn extend(&mut self, failures: impl IntoIterator<Item = HygieneFailure>) {
        for f in failures {
            self.push(f);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> HarnessResult<()> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(HarnessError::Hygiene(self))
        }
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} failure(s)):", self.test, self.failures.len())?;
        let mut ind = indenter::indented(f).with_str("  ");
        for failure in &self.failures {
            writeln!(ind, "- {failure}")?;
        }
        Ok(())
    }
}

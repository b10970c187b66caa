//! Alert scanning with a per-test allow-list.

use regex::Regex;

use crate::error::HarnessResult;

/// Alerts the server emits during normal operation.
pub const DEFAULT_SKIP_ALERTS: &[&str] = &[
    r"read signalfd\(4\) failed",
    r"sendmsg.+failed",
    r"recvmsg.+failed",
];

#[derive(Debug, Clone)]
pub struct AlertFilter {
    skip: Vec<Regex>,
}

impl Default for AlertFilter {
    fn default() -> Self {
        Self {
            skip: DEFAULT_SKIP_ALERTS
                .iter()
                .map(|p| Regex::new(p).expect("default alert patterns are valid"))
                .collect(),
        }
    }
}

impl AlertFilter {
    /// Allows `patterns` for the rest of the current test.
    pub fn skip(&mut self, patterns: &[&str]) -> HarnessResult<()> {
        for p in patterns {
            self.skip.push(Regex::new(p)?);
        }
        Ok(())
    }

    /// `[alert]` lines of `log` not covered by the allow-list.
    pub fn unexpected<'a>(&self, log: &'a str) -> Vec<&'a str> {
        log.lines()
            .filter(|line| line.contains("[alert]"))
            .filter(|line| !self.skip.iter().any(|re| re.is_match(line)))
            .collect()
    }
}

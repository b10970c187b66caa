//! Log – Tailer
//! ============
//!
//! Incremental reader over the append-only `unit.log`.
//!
//! ```text
//!  unit.log  ┌──────────── consumed ────────────┬──── new ────┐
//!            0                                  pos           EOF
//! ```
//!
//! * [`UnitLog::read`] returns everything after the cursor.
//! * [`UnitLog::checkpoint`] moves the cursor to the current end of file.
//! * [`UnitLog::wait_for_record`] polls a fresh read of the file every
//!   100 ms until a pattern matches or the attempts run out.
//!
//! No file handle is kept between calls: the file may be truncated or
//! recreated when the instance restarts, so every read opens it again.

use std::{
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};

use bon::Builder;
use regex::{Regex, RegexBuilder};

use super::*;
use crate::error::{HarnessError, HarnessResult};

/// Polling parameters for [`UnitLog::wait_for_record`].
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct PatternWait {
    /// Number of polls before giving up.
    #[builder(default = DEFAULT_WAIT_ATTEMPTS)]
    pub attempts: u32,
    #[builder(default = Duration::from_millis(POLL_INTERVAL_MS))]
    pub interval: Duration,
    /// Log file inside the instance directory.
    #[builder(default = LOG_FILE.to_string())]
    pub name: String,
    /// `^` / `$` match at line boundaries.
    #[builder(default = true)]
    pub multi_line: bool,
    #[builder(default)]
    pub case_insensitive: bool,
}

impl Default for PatternWait {
    fn default() -> Self {
        PatternWait::builder().build()
    }
}

impl PatternWait {
    /// Poll budget expressed as wall time instead of attempts.
    pub fn within(timeout: Duration) -> Self {
        let interval = Duration::from_millis(POLL_INTERVAL_MS);
        let attempts = timeout.as_millis().div_ceil(interval.as_millis()).max(1);
        PatternWait::builder()
            .attempts(u32::try_from(attempts).unwrap_or(u32::MAX))
            .interval(interval)
            .build()
    }

    fn compile(&self, pattern: &str) -> HarnessResult<Regex> {
        Ok(RegexBuilder::new(pattern)
            .multi_line(self.multi_line)
            .case_insensitive(self.case_insensitive)
            .build()?)
    }
}

/// Reader over the log files of one instance directory plus the "already
/// consumed" cursor of the main log.
#[derive(Debug, Clone)]
pub struct UnitLog {
    dir: PathBuf,
    pos: u64,
}

impl UnitLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pos: 0,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn set_pos(&mut self, pos: u64) {
        debug_assert!(
            pos >= self.pos || pos == 0,
            "log cursor may only move backwards to zero"
        );
        self.pos = pos;
    }

    /// Moves the cursor to the current end of the main log and returns it.
    pub fn checkpoint(&mut self) -> HarnessResult<u64> {
        let path = self.path();
        let len = std::fs::metadata(&path)
            .map_err(|e| HarnessError::file_system("stat log", &path, e))?
            .len();
        if len < self.pos {
            crate::debug!("log truncated below cursor {}; now {len} bytes", self.pos);
        }
        self.pos = len;
        Ok(self.pos)
    }

    /// Points the tailer at a new instance directory with a zero cursor.
    pub fn rebind(&mut self, dir: impl Into<PathBuf>) {
        self.dir = dir.into();
        self.pos = 0;
    }

    /// Text of the main log appended after the cursor.
    pub fn read(&self) -> HarnessResult<String> {
        self.read_from(LOG_FILE, self.pos)
    }

    /// Whole main log, ignoring the cursor.
    pub fn read_all(&self) -> HarnessResult<String> {
        self.read_from(LOG_FILE, 0)
    }

    /// Text of `name` starting at byte `offset`. An offset past the end of a
    /// truncated file reads from the start.
    pub fn read_from(&self, name: &str, offset: u64) -> HarnessResult<String> {
        let path = self.path_of(name);
        let mut file = std::fs::File::open(&path)
            .map_err(|e| HarnessError::file_system("open log", &path, e))?;
        let len = file
            .metadata()
            .map_err(|e| HarnessError::file_system("stat log", &path, e))?
            .len();
        let start = if offset > len { 0 } else { offset };
        file.seek(SeekFrom::Start(start))
            .map_err(|e| HarnessError::file_system("seek log", &path, e))?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut buf)
            .map_err(|e| HarnessError::file_system("read log", &path, e))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Polls the file named in `wait` for `pattern`, scoped to content after
    /// the cursor. Returns the matched text, or `None` once the attempts are
    /// exhausted; absence is not an error.
    pub fn wait_for_record(&self, pattern: &str, wait: &PatternWait) -> HarnessResult<Option<String>> {
        debug_assert!(wait.attempts > 0);
        let re = wait.compile(pattern)?;
        let offset = if wait.name == LOG_FILE { self.pos } else { 0 };

        for attempt in 0..wait.attempts {
            // missing file: the server may not have created it yet
            if let Ok(text) = self.read_from(&wait.name, offset) {
                if let Some(m) = re.find(&text) {
                    crate::trace!("'{pattern}' found after {attempt} polls");
                    return Ok(Some(m.as_str().to_owned()));
                }
            }
            std::thread::sleep(wait.interval);
        }
        crate::debug!(
            "'{pattern}' not found in {} after {} polls",
            wait.name,
            wait.attempts
        );
        Ok(None)
    }

    /// Every match of `pattern` after the cursor; capture groups are
    /// flattened into one vector per match.
    pub fn findall(&self, pattern: &str) -> HarnessResult<Vec<Vec<String>>> {
        let re = PatternWait::default().compile(pattern)?;
        let text = self.read()?;
        Ok(re
            .captures_iter(&text)
            .map(|caps| {
                if caps.len() == 1 {
                    vec![caps[0].to_owned()]
                } else {
                    caps.iter()
                        .skip(1)
                        .map(|m| m.map(|m| m.as_str().to_owned()).unwrap_or_default())
                        .collect()
                }
            })
            .collect())
    }

    /// First match of `pattern` after the cursor.
    pub fn search(&self, pattern: &str) -> HarnessResult<Option<String>> {
        let re = PatternWait::default().compile(pattern)?;
        let text = self.read()?;
        Ok(re.find(&text).map(|m| m.as_str().to_owned()))
    }
}

//! Scoped log dump.
//!
//! A [`DiagnosticCapture`] is armed when created and writes the log it
//! points at to its sink when dropped, unless [`DiagnosticCapture::disarm`]
//! was called first. Wrap any step whose failure should come with the server
//! log; the dump then happens on every exit path, early returns included.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

#[derive(Debug)]
enum LogSource {
    /// Read at drop time, from the byte offset on.
    File { path: PathBuf, from: u64 },
    /// Text taken before the file could go away.
    Text(String),
}

#[derive(Debug)]
pub struct DiagnosticCapture<W: Write = io::Stderr> {
    label: String,
    source: LogSource,
    sink: W,
    armed: bool,
}

impl DiagnosticCapture {
    pub fn new(label: impl Into<String>, log: &Path, from: u64) -> Self {
        Self::with_sink(label, log, from, io::stderr())
    }

    pub fn from_text(label: impl Into<String>, text: String) -> Self {
        Self {
            label: label.into(),
            source: LogSource::Text(text),
            sink: io::stderr(),
            armed: true,
        }
    }
}

impl<W: Write> DiagnosticCapture<W> {
    pub fn with_sink(label: impl Into<String>, log: &Path, from: u64, sink: W) -> Self {
        Self {
            label: label.into(),
            source: LogSource::File {
                path: log.to_path_buf(),
                from,
            },
            sink,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn dump(&mut self) -> io::Result<()> {
        let text = match &self.source {
            LogSource::Text(text) => text.clone(),
            LogSource::File { path, from } => {
                let bytes = std::fs::read(path)?;
                let start = usize::try_from(*from).unwrap_or(usize::MAX).min(bytes.len());
                String::from_utf8_lossy(&bytes[start..]).into_owned()
            }
        };
        writeln!(self.sink, "\n===== unit.log ({}) =====", self.label)?;
        self.sink.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            writeln!(self.sink)?;
        }
        writeln!(self.sink, "===== end of unit.log =====")?;
        self.sink.flush()
    }
}

impl<W: Write> Drop for DiagnosticCapture<W> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.dump() {
            crate::warn!("could not dump log for {}: {e}", self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_capture_dumps_from_offset() {
        let td = tempfile::tempdir().unwrap();
        let log = td.path().join("unit.log");
        std::fs::write(&log, "old line\n[alert] 1#1 new line\n").unwrap();

        let mut out = Vec::new();
        {
            let _capture = DiagnosticCapture::with_sink("test_sni", &log, 9, &mut out);
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("unit.log (test_sni)"));
        assert!(text.contains("[alert] 1#1 new line"));
        assert!(!text.contains("old line"));
    }

    #[test]
    fn disarmed_capture_is_silent() {
        let mut out = Vec::new();
        {
            let mut capture =
                DiagnosticCapture::with_sink("t", Path::new("/nonexistent/unit.log"), 0, &mut out);
            capture.disarm();
            assert!(!capture.is_armed());
        }
        assert!(out.is_empty());
    }
}

//! Registry of helper processes a test spawns (peer clients, stub servers).
//! Teardown terminates whatever is still alive, waits a bounded time for
//! each, and reports the stragglers instead of raising.

use std::{
    process::{Child, Command},
    time::Duration,
};

use wait_timeout::ChildExt;

use super::{error::*, kill::*};

#[derive(Debug)]
struct Background {
    label: String,
    child: Child,
}

#[derive(Debug, Default)]
pub struct BackgroundProcesses {
    entries: Vec<Background>,
}

impl BackgroundProcesses {
    pub fn spawn(&mut self, mut cmd: Command) -> Result<u32> {
        let label = format!("{:?}", cmd.get_program());
        let child = cmd.spawn().map_err(|e| ProcessError::CommandFailed {
            action: "spawn background",
            source: e.into(),
        })?;
        Ok(self.register(label, child))
    }

    pub fn register(&mut self, label: impl Into<String>, child: Child) -> u32 {
        let pid = child.id();
        let label = label.into();
        crate::debug!("registered background process {label} (PID {pid})");
        self.entries.push(Background { label, child });
        pid
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Terminates and joins every registered process, emptying the registry.
    /// Returns a failure message when any of them outlived `join_timeout`.
    pub fn stop_all(&mut self, join_timeout: Duration) -> Option<String> {
        let mut stuck = Vec::new();
        for Background { label, mut child } in self.entries.drain(..) {
            if let Err(e) = stop_one(&mut child, join_timeout) {
                crate::error!("background process {label} (PID {}): {e}", child.id());
                stuck.push(format!("{label} (PID {})", child.id()));
            }
        }
        if stuck.is_empty() {
            None
        } else {
            Some(format!("Fail to stop process(es): {}", stuck.join(", ")))
        }
    }
}

fn stop_one(child: &mut Child, join_timeout: Duration) -> Result<()> {
    let waited = |e: std::io::Error| ProcessError::CommandFailed {
        action: "wait for background",
        source: e.into(),
    };
    if child.try_wait().map_err(waited)?.is_some() {
        return Ok(());
    }
    terminate_pid(child.id())?;
    if child.wait_timeout(join_timeout).map_err(waited)?.is_some() {
        return Ok(());
    }

    // still running: do not leave it behind for the next test
    let _ = child.kill();
    let _ = child.wait_timeout(Duration::from_secs(1));
    Err(ProcessError::TerminationTimeout {
        operation: "join background",
        elapsed: join_timeout,
        leftovers: vec![child.id()],
    })
}

impl Drop for BackgroundProcesses {
    fn drop(&mut self) {
        if let Some(msg) = self.stop_all(Duration::from_secs(1)) {
            crate::error!("{msg}");
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::process::{pid::pid_alive, tests_helpers::*};

    #[test]
    #[serial]
    fn stop_all_joins_cooperative_children() {
        let mut reg = BackgroundProcesses::default();
        let a = reg.spawn(long_cmd()).unwrap();
        let b = reg.spawn(short_cmd()).unwrap();
        let done = reg.spawn(Command::new("true")).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(reg.len(), 3);

        assert_eq!(reg.stop_all(Duration::from_secs(5)), None);
        assert!(reg.is_empty());
        for pid in [a, b, done] {
            assert!(!pid_alive(pid).unwrap());
        }
    }

    #[test]
    #[serial]
    fn straggler_is_reported_and_killed() {
        let mut reg = BackgroundProcesses::default();
        let pid = reg.spawn(stubborn_cmd()).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let msg = reg.stop_all(Duration::from_millis(300)).unwrap();
        assert!(msg.starts_with("Fail to stop process(es)"));
        assert!(msg.contains(&pid.to_string()));
        assert!(!pid_alive(pid).unwrap());
        assert_eq!(reg.stop_all(Duration::from_millis(10)), None);
    }
}

//! Process – PID
//! =============
//!
//! ```text
//!  ┌─ disk • pid file ──────────────────────────────┐
//!  │ pid_from_pidfile()  → read & parse u32         │
//!  │ wait_for_pidfile()  → poll until it parses     │
//!  └────────────────────────────────────────────────┘
//!
//!  ┌─ kernel • liveness probe ──────────────────────┐
//!  │ pid_alive() → signal 0, then /proc/<pid>/stat  │
//!  └────────────────────────────────────────────────┘
//! ```

use std::{
    path::Path,
    time::{Duration, Instant},
};

use super::error::*;

pub fn pid_from_pidfile(pidfile_path: &Path) -> Result<u32> {
    let content =
        std::fs::read_to_string(pidfile_path).map_err(|e| ProcessError::CommandFailed {
            action: "read pidfile",
            source: e.into(),
        })?;
    content
        .trim()
        .parse::<u32>()
        .map_err(|e| ProcessError::CommandFailed {
            action: "parse pid from pidfile",
            source: e.into(),
        })
}

/// Polls until the server has written a parseable pid. The file may exist
/// empty for a moment before the write lands.
pub fn wait_for_pidfile(pidfile_path: &Path, budget: Duration, interval: Duration) -> Result<u32> {
    let deadline = Instant::now() + budget;
    loop {
        match pid_from_pidfile(pidfile_path) {
            Ok(pid) => return Ok(pid),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => std::thread::sleep(interval),
        }
    }
}

/// `true` while the kernel knows `pid` and it is not a zombie.
pub fn pid_alive(pid: u32) -> Result<bool> {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    let raw = i32::try_from(pid).map_err(|e| ProcessError::CommandFailed {
        action: "convert pid",
        source: e.into(),
    })?;
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => Ok(!is_zombie(pid)),
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => Err(ProcessError::PermissionDenied {
            action: "signal 0 a foreign process",
            source: Errno::EPERM.into(),
        }),
        Err(e) => Err(ProcessError::CommandFailed {
            action: "signal 0",
            source: e.into(),
        }),
    }
}

/// Reads the state letter from `/proc/<pid>/stat`; off Linux nothing is a
/// zombie as far as this probe can tell.
fn is_zombie(pid: u32) -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // the command name may contain spaces and parens; the state follows the last ')'
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        == Some("Z")
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::process::tests_helpers::*;

    #[test]
    fn pidfile_parsing() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("unit.pid");

        assert!(pid_from_pidfile(&path).is_err());
        std::fs::write(&path, "garbage").unwrap();
        assert!(pid_from_pidfile(&path).is_err());
        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(pid_from_pidfile(&path).unwrap(), 4242);
    }

    #[test]
    fn wait_for_pidfile_sees_late_write() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("unit.pid");
        std::fs::write(&path, "").unwrap();

        let writer = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(150));
                std::fs::write(&path, "77\n").unwrap();
            })
        };
        let pid = wait_for_pidfile(&path, Duration::from_secs(5), Duration::from_millis(20));
        writer.join().unwrap();
        assert_eq!(pid.unwrap(), 77);

        let missing = td.path().join("none.pid");
        assert!(
            wait_for_pidfile(&missing, Duration::from_millis(50), Duration::from_millis(10))
                .is_err()
        );
    }

    #[test]
    #[serial]
    fn liveness_tracks_child() {
        assert!(pid_alive(std::process::id()).unwrap());

        let mut child = long_cmd().spawn().unwrap();
        let pid = child.id();
        assert!(pid_alive(pid).unwrap());
        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!pid_alive(pid).unwrap());
    }
}

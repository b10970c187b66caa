//! Process – Kill
//! ==============
//!
//! Signal delivery helpers built on `nix`. A target that has already gone
//! (`ESRCH`) counts as success; `EPERM` is surfaced as
//! [`ProcessError::PermissionDenied`] rather than swallowed.
//!
//! | Helper              | Signal      | Target          |
//! |---------------------|-------------|-----------------|
//! | [`signal_pid`]      | any         | one pid         |
//! | [`terminate_pid`]   | `SIGTERM`   | one pid         |
//! | [`kill_group`]      | `SIGKILL`   | process group   |

use nix::{
    errno::Errno,
    sys::signal::{Signal, kill, killpg},
    unistd::Pid,
};

use super::error::*;

fn map_errno(result: nix::Result<()>, action: &'static str) -> Result<()> {
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()), // gone already → success

        Err(Errno::EPERM) => Err(ProcessError::PermissionDenied {
            action,
            source: "operation not permitted".into(),
        }),

        Err(e) => Err(ProcessError::CommandFailed {
            action,
            source: e.into(),
        }),
    }
}

pub fn signal_pid(pid: u32, signal: Signal) -> Result<()> {
    debug_assert!(pid > 0, "refusing to signal pid 0 (own process group)");
    map_errno(kill(Pid::from_raw(pid as i32), signal), signal_action(signal))
}

pub fn terminate_pid(pid: u32) -> Result<()> {
    signal_pid(pid, Signal::SIGTERM)
}

/// Kills every member of the process group led by `pgid`.
pub fn kill_group(pgid: u32) -> Result<()> {
    debug_assert!(pgid > 1, "refusing to kill process group {pgid}");
    map_errno(
        killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL),
        "send SIGKILL to process group",
    )
}

fn signal_action(signal: Signal) -> &'static str {
    match signal {
        Signal::SIGTERM => "send SIGTERM",
        Signal::SIGQUIT => "send SIGQUIT",
        Signal::SIGKILL => "send SIGKILL",
        Signal::SIGINT => "send SIGINT",
        _ => "send signal",
    }
}

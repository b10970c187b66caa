//! Instance – process guard
//! ========================
//!
//! RAII handle around the main `unitd` process.
//!
//! * **Spawn** with the server's diagnostic stream (stderr) appended to
//!   `unit.log`, in a fresh process group, with `PDEATHSIG` armed on Linux so
//!   a crashed harness does not leave servers behind.
//! * **Stop** politely with `SIGQUIT` (graceful shutdown), wait up to the
//!   stop budget, and escalate to `SIGKILL` on the whole process group when
//!   the wait fails.
//!
//! Dropping the guard stops the server if that has not happened yet.

use std::{
    fs::OpenOptions,
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::RwLock,
    time::Duration,
};

use nix::{
    sys::signal::Signal,
    unistd::{Pid, setpgid},
};
use wait_timeout::ChildExt;

use super::args::UnitdArgs;
use crate::process::{error::*, kill::*};

/// Stop budget used from `Drop`, where nobody is waiting for a report.
const DROP_WAIT: Duration = Duration::from_secs(5);
const FORCE_KILL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct UnitProcessGuard {
    /// `None` once reaped.
    child: RwLock<Option<Child>>,
    pid: u32,
}

impl UnitProcessGuard {
    pub fn spawn(unitd: &Path, args: &UnitdArgs, log: &Path) -> Result<Self> {
        debug_assert!(unitd.is_absolute() || unitd.components().count() == 1);

        let log_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log)
            .map_err(|e| ProcessError::CommandFailed {
                action: "open server log",
                source: e.into(),
            })?;

        let mut cmd = Command::new(unitd);
        use cmdstruct::Command as _;
        cmd.args(args.command().get_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log_file);

        // Own process group, and die with the harness.
        unsafe {
            cmd.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

                #[cfg(target_os = "linux")]
                nix::sys::prctl::set_pdeathsig(Some(Signal::SIGTERM))?;

                Ok(())
            })
        };

        crate::info!("Starting unitd: {cmd:?}");
        let child = cmd.spawn().map_err(|e| ProcessError::CommandFailed {
            action: "spawn unitd",
            source: e.into(),
        })?;
        let pid = child.id();
        debug_assert!(pid > 0, "OS returned an invalid PID (0)");

        Ok(Self {
            child: Some(child).into(),
            pid,
        })
    }

    /// Pid of the spawned process; it stays valid for reporting after exit.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Spawned, not yet stopped, and not exited on its own.
    pub fn is_running(&self) -> bool {
        let mut slot = self.child.write().expect("Failed to acquire write lock");
        slot.as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    /// Graceful stop: `SIGQUIT`, then wait up to `budget`.
    ///
    /// * already exited → `Ok`, whatever the status
    /// * clean exit → `Ok`
    /// * non-zero exit → [`ProcessError::UnexpectedExit`]
    /// * timeout or wait failure → group SIGKILL, then the error
    ///
    /// Idempotent: a second call is a no-op.
    pub fn stop(&self, budget: Duration) -> Result<()> {
        let Some(mut child) = self
            .child
            .write()
            .expect("Failed to acquire write lock")
            .take()
        else {
            return Ok(());
        };

        match child.try_wait() {
            Ok(Some(status)) if status.success() => {
                crate::debug!("unitd (PID {}) had already exited: {status}", self.pid);
                return Ok(());
            }
            Ok(Some(status)) => {
                return Err(ProcessError::UnexpectedExit {
                    pid: self.pid,
                    status: exit_description(status),
                });
            }
            Ok(None) => (),
            Err(e) => crate::warn!("try_wait on unitd (PID {}): {e}", self.pid),
        }

        if let Err(e) = signal_pid(self.pid, Signal::SIGQUIT) {
            crate::error!("Failed to send QUIT to PID {}: {e}", self.pid);
        }

        let outcome = match child.wait_timeout(budget) {
            Ok(Some(status)) if status.success() => {
                crate::info!("unitd (PID {}) exited gracefully", self.pid);
                return Ok(());
            }
            Ok(Some(status)) => {
                // the main process is gone, but workers may linger
                if let Err(e) = kill_group(self.pid) {
                    crate::error!("Failed to kill process group {}: {e}", self.pid);
                }
                return Err(ProcessError::UnexpectedExit {
                    pid: self.pid,
                    status: exit_description(status),
                });
            }
            Ok(None) => ProcessError::TerminationTimeout {
                operation: "graceful stop",
                elapsed: budget,
                leftovers: vec![self.pid],
            },
            Err(e) => ProcessError::CommandFailed {
                action: "wait for graceful exit",
                source: e.into(),
            },
        };
        crate::error!("Could not terminate unitd (PID {}): {outcome}", self.pid);
        self.escalate(&mut child);
        Err(outcome)
    }

    fn escalate(&self, child: &mut Child) {
        if let Err(e) = kill_group(self.pid) {
            crate::error!("Failed to kill process group {}: {e}", self.pid);
        }
        let _ = child.kill();
        match child.wait_timeout(FORCE_KILL_WAIT) {
            Ok(Some(status)) => crate::info!("unitd force-killed; exit status {status}"),
            Ok(None) => crate::error!("unitd (PID {}) survived SIGKILL", self.pid),
            Err(e) => crate::error!("wait after force-kill of PID {}: {e}", self.pid),
        }
    }
}

fn exit_description(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("code {code}"),
        (None, Some(sig)) => format!("signal {sig}"),
        _ => status.to_string(),
    }
}

impl Drop for UnitProcessGuard {
    fn drop(&mut self) {
        if let Err(e) = self.stop(DROP_WAIT) {
            crate::error!("Failed to stop unitd on drop: {e}");
        }
    }
}

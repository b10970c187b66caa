//! One supervised server instance: how it is invoked, where it lives on
//! disk, the process guard around it, and the lifecycle state machine.

pub mod args;
pub mod guard;
pub mod layout;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod tests_helpers;

/// Names inside the instance directory that survive a cleanup.
pub const CONTROL_SOCKET: &str = "control.unit.sock";
pub const STATE_DIR: &str = "state";
pub const PID_FILE: &str = "unit.pid";

//! Process layer: signalling, pid files, descriptor counting, the process
//! table census, and the registry of helper processes a test spawns.

pub mod background;
pub mod census;
pub mod error;
pub mod fds;
pub mod kill;
pub mod pid;

pub use error::*;
pub use kill::*;
pub use pid::*;

#[cfg(test)]
// Shared test utilities for process management
pub(crate) mod tests_helpers {
    pub fn long_cmd() -> std::process::Command {
        let mut c = std::process::Command::new("sleep");
        c.arg("30");
        c
    }

    pub fn short_cmd() -> std::process::Command {
        let mut c = std::process::Command::new("sleep");
        c.arg("1");
        c
    }

    /// A shell that ignores SIGTERM, so only SIGKILL ends it.
    pub fn stubborn_cmd() -> std::process::Command {
        let mut c = std::process::Command::new("sh");
        c.args(["-c", "trap '' TERM; exec sleep 30"]);
        c
    }
}

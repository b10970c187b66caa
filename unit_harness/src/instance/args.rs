//! Instance – server invocation
//! ============================
//!
//! `unitd` command line as a typed struct. It derives
//! [`cmdstruct::Command`] so the argument vector is rendered from the field
//! attributes, and [`bon::Builder`] so callers only set what differs from a
//! plain foreground run.
//!
//! ```text
//! unitd --no-daemon --modulesdir <dir> --statedir <dir> --pid <file>
//!       --log <file> --control <addr> --tmpdir <dir> [--user <name>]
//! ```

use std::{
    ops::Not,
    path::{Path, PathBuf},
    process::{Command as StdCommand, Stdio},
};

use bon::Builder;
use cmdstruct::{Arg, Command};
use serde::{Deserialize, Serialize};

use super::{layout::InstanceLayout, *};
use crate::{
    error::{HarnessError, HarnessResult},
    ipc::ControlAddr,
    log::LOG_FILE,
};

/// Filesystem path rendered verbatim as one argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ArgPath(pub PathBuf);

impl Arg for ArgPath {
    fn append_arg(&self, cmd: &mut StdCommand) {
        cmd.arg(&self.0);
    }
}

impl<P: AsRef<Path>> From<P> for ArgPath {
    fn from(p: P) -> Self {
        Self(p.as_ref().to_path_buf())
    }
}

impl std::fmt::Display for ArgPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Command, Builder)]
#[builder(derive(Debug, Clone))]
#[command(executable = "overwritten_at_runtime")]
pub struct UnitdArgs {
    /// Stay in the foreground so the guard owns the main process.
    #[serde(default, skip_serializing_if = "<&bool>::not")]
    #[builder(default = true)]
    #[arg(flag = "--no-daemon")]
    pub no_daemon: bool,

    /// Directory of the language modules (`<builddir>/lib/unit/modules`).
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    #[arg(option = "--modulesdir")]
    pub modulesdir: Option<ArgPath>,

    /// Persistent configuration and certificate store.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    #[arg(option = "--statedir")]
    pub statedir: Option<ArgPath>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    #[arg(option = "--pid")]
    pub pid: Option<ArgPath>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    #[arg(option = "--log")]
    pub log: Option<ArgPath>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(option = "--control")]
    pub control: Option<ControlAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    #[arg(option = "--tmpdir")]
    pub tmpdir: Option<ArgPath>,

    /// Unprivileged user for the application processes.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    #[arg(option = "--user")]
    pub user: Option<String>,
}

impl UnitdArgs {
    /// Arguments for an instance rooted at `layout`. `statedir` overrides the
    /// layout's own state directory, for tests that restart over a kept
    /// state.
    pub fn for_layout(
        layout: &InstanceLayout,
        modulesdir: &Path,
        statedir: Option<&Path>,
        user: Option<&str>,
    ) -> Self {
        UnitdArgs::builder()
            .modulesdir(modulesdir)
            .statedir(statedir.map_or_else(|| layout.state_dir(), Path::to_path_buf))
            .pid(layout.path(PID_FILE))
            .log(layout.path(LOG_FILE))
            .control(layout.control_addr())
            .tmpdir(layout.root())
            .maybe_user(user)
            .build()
    }

    pub fn to_args(&self) -> Vec<String> {
        use cmdstruct::Command as _;
        self.command()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

/// Runs `unitd --version` and returns stdout and stderr merged; the server
/// prints its version and configure line on stderr.
pub fn probe_version(unitd: &Path) -> HarnessResult<String> {
    let failed = |reason: String| HarnessError::VersionProbe {
        path: unitd.to_path_buf(),
        reason,
    };
    let out = StdCommand::new(unitd)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| failed(e.to_string()))?;
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    if !out.status.success() {
        return Err(failed(format!("{}: {}", out.status, text.trim())));
    }
    crate::debug!("{} --version: {}", unitd.display(), text.trim());
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_full_invocation() {
        let args = UnitdArgs::builder()
            .modulesdir("/b/lib/unit/modules")
            .statedir("/t/state")
            .pid("/t/unit.pid")
            .log("/t/unit.log")
            .control(ControlAddr::unix("/t/control.unit.sock"))
            .tmpdir("/t")
            .user("nobody")
            .build();
        assert_eq!(
            args.to_args(),
            [
                "--no-daemon",
                "--modulesdir",
                "/b/lib/unit/modules",
                "--statedir",
                "/t/state",
                "--pid",
                "/t/unit.pid",
                "--log",
                "/t/unit.log",
                "--control",
                "unix:/t/control.unit.sock",
                "--tmpdir",
                "/t",
                "--user",
                "nobody",
            ]
        );
    }

    #[test]
    fn user_is_optional() {
        let args = UnitdArgs::builder().build();
        assert_eq!(args.to_args(), ["--no-daemon"]);
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json, serde_json::json!({"no_daemon": true}));
    }

    #[test]
    fn for_layout_points_into_instance_dir() -> HarnessResult<()> {
        let base = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::create_in(base.path())?;
        let args = UnitdArgs::for_layout(&layout, Path::new("/mods"), None, None);
        let rendered = args.to_args().join(" ");
        let root = layout.root().display().to_string();
        assert!(rendered.contains(&format!("--statedir {root}/state")));
        assert!(rendered.contains(&format!("--control unix:{root}/control.unit.sock")));
        assert!(!rendered.contains("--user"));

        let kept = UnitdArgs::for_layout(&layout, Path::new("/mods"), Some(Path::new("/kept")), Some("u"));
        let rendered = kept.to_args().join(" ");
        assert!(rendered.contains("--statedir /kept"));
        assert!(rendered.ends_with("--user u"));
        layout.remove()
    }

    #[test]
    fn probe_version_failures_are_fatal() {
        let err = probe_version(Path::new("/nonexistent/sbin/unitd")).unwrap_err();
        assert!(err.is_fatal());
        let err = probe_version(Path::new("false")).unwrap_err();
        assert!(matches!(err, HarnessError::VersionProbe { .. }));
    }
}

//! Instance – supervisor
//! =====================
//!
//! Drives one server instance through its lifecycle:
//!
//! ```text
//!  Unstarted ──launch──► Starting ──socket + pid file──► Ready ──stop──► Stopping ──► Stopped
//!                            │                                                          ▲
//!                            └──────────────── launch failure ─────────────────────────┘
//! ```
//!
//! ## Core ideas
//! * **Readiness is the control socket** – the instance counts as started once
//!   `control.unit.sock` exists; if it never appears the whole run aborts
//!   ([`HarnessError::StartupTimeout`] is fatal).
//! * **Clean slate on entry** – entering `Ready` resets the configuration to
//!   the empty baseline, purges the certificate and script-module stores the
//!   build supports, captures the three [`ResourceBaseline`]s, and checks that
//!   the status counters start at zero.
//! * **Stop reports, never raises** – [`InstanceSupervisor::stop`] returns
//!   every problem as a [`HygieneFailure`] so teardown can keep going.
//!
//! A stopped [`UnitInstance`] stays around so its directory and log remain
//! readable until [`InstanceSupervisor::discard`] removes them.
//!
//! [`ResourceBaseline`]: crate::session::baseline::ResourceBaseline

use std::{
    path::{Path, PathBuf},
    thread::sleep,
    time::{Duration, Instant},
};

use super::{args::*, guard::UnitProcessGuard, layout::*};
use crate::{
    error::{HarnessError, HarnessResult},
    ipc::control::{CERTIFICATES_PATH, ControlClient, JS_MODULES_PATH},
    log::records::AvailableModules,
    process::{census::ProcessCensus, error::ProcessError, pid::wait_for_pidfile},
    session::{baseline::BaselineSet, options::*, report::HygieneFailure},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum InstanceState {
    Unstarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The supervised process tree and everything needed to talk to it.
#[derive(Debug)]
pub struct UnitInstance {
    guard: UnitProcessGuard,
    /// Main pid as written to the pid file.
    pid: u32,
    layout: InstanceLayout,
    state_dir: PathBuf,
    control: ControlClient,
}

impl UnitInstance {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    pub fn temp_dir(&self) -> &Path {
        self.layout.root()
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn log_file(&self) -> PathBuf {
        self.layout.log_file()
    }

    pub fn control(&self) -> &ControlClient {
        &self.control
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Empty configuration, then the stores of the features the build has.
    pub fn reset_config(&self, modules: &AvailableModules) -> HarnessResult<()> {
        self.control.clear_config()?;
        if modules.has("openssl") {
            self.control.purge_store(CERTIFICATES_PATH)?;
        }
        if modules.has("njs") {
            self.control.purge_store(JS_MODULES_PATH)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for UnitInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unitd (PID {}) in {}", self.pid, self.layout.root().display())
    }
}

#[derive(Debug)]
pub struct InstanceSupervisor {
    paths: UnitPaths,
    user: Option<String>,
    tmp_root: Option<PathBuf>,
    startup_budget: Duration,
    stop_budget: Duration,
    poll_interval: Duration,
    state: InstanceState,
    instance: Option<UnitInstance>,
}

impl InstanceSupervisor {
    pub fn new(options: &HarnessOptions) -> Self {
        Self {
            paths: options.paths(),
            user: options.user.clone(),
            tmp_root: options.tmp_root.clone(),
            startup_budget: options.startup_budget,
            stop_budget: options.stop_budget,
            poll_interval: options.poll_interval,
            state: InstanceState::Unstarted,
            instance: None,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == InstanceState::Ready
    }

    /// The current or most recently stopped instance.
    pub fn instance(&self) -> Option<&UnitInstance> {
        self.instance.as_ref()
    }

    pub fn paths(&self) -> &UnitPaths {
        &self.paths
    }

    fn transition(&mut self, next: InstanceState) {
        crate::debug!("instance {} -> {next}", self.state);
        self.state = next;
    }

    /// Starts a fresh instance and returns its baselines.
    ///
    /// `state_dir` reuses an existing configuration store; the configuration
    /// is then left as the server restored it instead of being reset.
    ///
    /// Allowed from `Unstarted` or `Stopped`. A previous, stopped instance is
    /// dropped (its directory stays on disk; see [`discard`](Self::discard)).
    pub fn launch(
        &mut self,
        census: &ProcessCensus,
        modules: &AvailableModules,
        state_dir: Option<&Path>,
    ) -> HarnessResult<BaselineSet> {
        if !matches!(self.state, InstanceState::Unstarted | InstanceState::Stopped) {
            return Err(HarnessError::InvalidState {
                expected: "unstarted or stopped",
                actual: self.state.as_str(),
            });
        }
        if !self.paths.unitd.is_file() {
            return Err(HarnessError::UnitNotFound {
                path: self.paths.unitd.clone(),
            });
        }
        self.transition(InstanceState::Starting);

        let instance = match self.spawn(state_dir) {
            Ok(instance) => instance,
            Err(e) => {
                self.transition(InstanceState::Stopped);
                return Err(e);
            }
        };
        crate::info!("Started {instance}");
        let spawned_pid = instance.pid;
        let pid_file = instance.layout.pid_file();
        self.instance = Some(instance);

        if let Err(e) = self.wait_for_control_socket() {
            self.abort_launch();
            return Err(e);
        }
        let pid = match wait_for_pidfile(&pid_file, self.startup_budget, self.poll_interval) {
            Ok(pid) => pid,
            Err(e) => {
                crate::warn!("no pid file from unitd (PID {spawned_pid}): {e}");
                self.abort_launch();
                return Err(e.into());
            }
        };
        if let Some(instance) = self.instance.as_mut() {
            instance.pid = pid;
        }
        self.transition(InstanceState::Ready);

        let instance = self.ready_instance()?;
        if state_dir.is_none() {
            instance.reset_config(modules)?;
        }
        let baselines =
            BaselineSet::capture_when_ready(census, pid, self.startup_budget, self.poll_interval);
        instance.control.check_status_zeros()?;
        Ok(baselines)
    }

    fn spawn(&self, state_dir: Option<&Path>) -> HarnessResult<UnitInstance> {
        ensure_public(&self.paths.builddir)?;
        let layout = match &self.tmp_root {
            Some(base) => InstanceLayout::create_in(base)?,
            None => InstanceLayout::create()?,
        };
        let state_dir = state_dir.map_or_else(|| layout.state_dir(), Path::to_path_buf);
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| HarnessError::file_system("create dir", &state_dir, e))?;

        let args = UnitdArgs::for_layout(
            &layout,
            &self.paths.modulesdir,
            Some(&state_dir),
            self.user.as_deref(),
        );
        let guard = UnitProcessGuard::spawn(&self.paths.unitd, &args, &layout.log_file())?;
        let control = ControlClient::new(layout.control_addr());
        Ok(UnitInstance {
            pid: guard.pid(),
            guard,
            layout,
            state_dir,
            control,
        })
    }

    fn ready_instance(&self) -> HarnessResult<&UnitInstance> {
        match (&self.instance, self.state) {
            (Some(instance), InstanceState::Ready) => Ok(instance),
            _ => Err(HarnessError::InvalidState {
                expected: "ready",
                actual: self.state.as_str(),
            }),
        }
    }

    /// Polls for the control socket; gives up early when the server exits.
    fn wait_for_control_socket(&self) -> HarnessResult<()> {
        let Some(instance) = &self.instance else {
            return Err(HarnessError::InvalidState {
                expected: "starting",
                actual: self.state.as_str(),
            });
        };
        let socket = instance.layout.control_socket();
        let deadline = Instant::now() + self.startup_budget;
        loop {
            if socket.exists() {
                crate::debug!("control socket {} is up", socket.display());
                return Ok(());
            }
            if !instance.is_running() {
                crate::error!("unitd exited before creating {}", socket.display());
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(self.poll_interval);
        }
        Err(HarnessError::StartupTimeout {
            control: socket.display().to_string(),
            budget: self.startup_budget,
        })
    }

    fn abort_launch(&mut self) {
        if let Some(instance) = &self.instance {
            if let Err(e) = instance.guard.stop(self.stop_budget) {
                crate::error!("Failed to stop half-started {instance}: {e}");
            }
        }
        self.transition(InstanceState::Stopped);
    }

    /// Graceful stop of the current instance.
    ///
    /// The zombie check runs first and always. A non-zero exit, a timeout or
    /// a failed wait each become a [`HygieneFailure::StopUnit`]; the guard has
    /// already escalated to a kill by then. A no-op unless the instance is
    /// `Ready`.
    pub fn stop(&mut self, census: &ProcessCensus) -> Vec<HygieneFailure> {
        if self.state != InstanceState::Ready {
            crate::trace!("stop requested while {}", self.state);
            return Vec::new();
        }
        let Some(pid) = self.instance.as_ref().map(UnitInstance::pid) else {
            return Vec::new();
        };
        self.transition(InstanceState::Stopping);

        let mut failures = Vec::new();
        if census.list_zombies().contains(&pid) {
            failures.push(HygieneFailure::Zombie { parent: pid });
        }

        let outcome = match &self.instance {
            Some(instance) => instance.guard.stop(self.stop_budget),
            None => Ok(()),
        };
        match outcome {
            Ok(()) => crate::info!("Stopped unitd (PID {pid})"),
            Err(ProcessError::UnexpectedExit { status, .. }) => {
                failures.push(HygieneFailure::StopUnit(format!(
                    "Child process terminated with {status}"
                )));
            }
            Err(e) => {
                failures.push(HygieneFailure::StopUnit(format!("Could not terminate unit: {e}")));
            }
        }
        self.transition(InstanceState::Stopped);
        failures
    }

    /// Removes the directory of a stopped instance and forgets it.
    pub fn discard(&mut self) -> HarnessResult<()> {
        if !matches!(self.state, InstanceState::Stopped | InstanceState::Unstarted) {
            return Err(HarnessError::InvalidState {
                expected: "stopped",
                actual: self.state.as_str(),
            });
        }
        match self.instance.take() {
            Some(UnitInstance { layout, .. }) => {
                crate::debug!("removing {}", layout.root().display());
                layout.remove()
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::{
        instance::tests_helpers::{ControlStub, fake_build, fake_unitd},
        process::pid::pid_alive,
        session::baseline::Role,
    };

    fn options(builddir: &Path, tmp_root: &Path) -> HarnessOptions {
        HarnessOptions::builder()
            .builddir(builddir)
            .tmp_root(tmp_root)
            .startup_budget(Duration::from_secs(5))
            .stop_budget(Duration::from_secs(5))
            .build()
    }

    #[test]
    fn missing_binary_is_fatal() {
        let td = tempfile::tempdir().unwrap();
        let mut sup = InstanceSupervisor::new(&options(td.path(), td.path()));
        let err = sup
            .launch(&ProcessCensus::default(), &AvailableModules::default(), None)
            .unwrap_err();
        assert!(matches!(err, HarnessError::UnitNotFound { .. }));
        assert!(err.is_fatal());
        assert_eq!(sup.state(), InstanceState::Unstarted);
    }

    #[test]
    #[serial]
    fn silent_server_times_out_and_stops() {
        let build = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        fake_unitd(&build.path().join("sbin"), "exit 0");
        let opts = HarnessOptions::builder()
            .builddir(build.path())
            .tmp_root(tmp.path())
            .startup_budget(Duration::from_millis(500))
            .build();

        let mut sup = InstanceSupervisor::new(&opts);
        let err = sup
            .launch(&ProcessCensus::default(), &AvailableModules::default(), None)
            .unwrap_err();
        assert!(matches!(err, HarnessError::StartupTimeout { .. }));
        assert!(err.is_fatal());
        assert_eq!(sup.state(), InstanceState::Stopped);

        let instance = sup.instance().unwrap();
        assert!(!instance.is_running());
        let log = std::fs::read_to_string(instance.log_file()).unwrap();
        assert!(log.contains("--control unix:"));

        let root = instance.temp_dir().to_path_buf();
        sup.discard().unwrap();
        assert!(!root.exists());
    }

    #[test]
    #[serial]
    fn launch_reset_and_stop() -> HarnessResult<()> {
        let build = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let builddir = fake_build(build.path());
        let stub = ControlStub::watch(tmp.path());
        let census = ProcessCensus::default();

        let mut sup = InstanceSupervisor::new(&options(&builddir, tmp.path()));
        let mut modules = AvailableModules::default();
        modules.insert("openssl", "any");
        let baselines = sup.launch(&census, &modules, None)?;
        assert!(sup.is_ready());

        let pid = sup.instance().unwrap().pid();
        assert_eq!(baselines.main_pid(), pid);
        assert!(baselines.get(Role::Router).pid.is_some());
        assert!(baselines.get(Role::Controller).pid.is_some());
        assert_eq!(stub.seen("PUT /config "), 1);
        assert_eq!(stub.seen("GET /certificates "), 1);
        assert_eq!(stub.seen("GET /status "), 1);

        assert!(matches!(
            sup.launch(&census, &modules, None),
            Err(HarnessError::InvalidState { .. })
        ));
        assert!(sup.discard().is_err());

        let failures = sup.stop(&census);
        assert!(failures.is_empty(), "{failures:?}");
        assert_eq!(sup.state(), InstanceState::Stopped);
        assert!(!pid_alive(pid).unwrap());
        assert!(sup.stop(&census).is_empty());
        sup.discard()
    }

    #[test]
    #[serial]
    fn nonzero_exit_is_a_stop_failure() -> HarnessResult<()> {
        let build = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let builddir = fake_build(build.path());
        let unitd = builddir.join("sbin").join("unitd");
        let script = std::fs::read_to_string(&unitd).unwrap().replace("exit 0' QUIT", "exit 2' QUIT");
        std::fs::write(&unitd, script).unwrap();
        let _stub = ControlStub::watch(tmp.path());
        let census = ProcessCensus::default();

        let mut sup = InstanceSupervisor::new(&options(&builddir, tmp.path()));
        sup.launch(&census, &AvailableModules::default(), None)?;
        let failures = sup.stop(&census);
        assert_eq!(
            failures,
            vec![HygieneFailure::StopUnit(
                "Child process terminated with code 2".into()
            )]
        );
        sup.discard()
    }

    #[test]
    #[serial]
    fn unreaped_child_is_a_zombie_failure() -> HarnessResult<()> {
        let build = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let builddir = fake_build(build.path());
        let unitd = builddir.join("sbin").join("unitd");
        // main turns into a process that never reaps the short-lived child
        let script = std::fs::read_to_string(&unitd)
            .unwrap()
            .replace("wait $c\n", "sleep 0.3 &\nexec sleep 300\n");
        std::fs::write(&unitd, script).unwrap();
        let _stub = ControlStub::watch(tmp.path());
        let census = ProcessCensus::default();

        let mut sup = InstanceSupervisor::new(&options(&builddir, tmp.path()));
        sup.launch(&census, &AvailableModules::default(), None)?;
        let pid = sup.instance().unwrap().pid();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !census.list_zombies().contains(&pid) {
            assert!(std::time::Instant::now() < deadline, "no zombie under {pid}");
            std::thread::sleep(Duration::from_millis(50));
        }

        let failures = sup.stop(&census);
        assert_eq!(failures.first(), Some(&HygieneFailure::Zombie { parent: pid }));
        // SIGQUIT's default action ends the bare `sleep`, which is not a clean exit
        assert!(matches!(failures.get(1), Some(HygieneFailure::StopUnit(msg))
            if msg.starts_with("Child process terminated with")));
        assert_eq!(sup.state(), InstanceState::Stopped);
        assert!(!pid_alive(pid).unwrap());
        sup.discard()
    }
}

//! Session – orchestrator
//! ======================
//!
//! Owns everything that lives for a whole run: the instance supervisor, the
//! descriptor baselines, the log cursor, the alert allow-list and the
//! registry of background processes. Implements [`HarnessLifecycle`].
//!
//! ## Per-test protocol
//! ```text
//! before_test   launch (restart mode, or first test) · reset allow-list and fd skips
//! execute       case body with a TestContext
//! after_test    stop unit (restart mode)            → StopUnit
//!               stop background processes           → StopProcesses
//!               read new log, advance cursor
//!               restart: remove temp dir, cursor 0  (unless save_log)
//!               reuse:   reset config, purge temp   → Cleanup
//!               descriptor settle per role          → DescriptorLeak / PidChanged
//!               process tree shape                  → ProcessCount
//!               unexpected [alert] lines            → Alerts
//! ```
//! Every teardown step runs; the failures are collected into one
//! [`TeardownReport`]. The log of the test is dumped when the body failed,
//! when the report is not clean, or when `print_log` is set.

use std::{
    path::{Path, PathBuf},
    process::{Child, Command},
    time::Duration,
};

use super::{
    baseline::{BaselineSet, RoleSet},
    diagnostic::DiagnosticCapture,
    driver::{HarnessCase, HarnessLifecycle},
    options::HarnessOptions,
    report::{HygieneFailure, TeardownReport},
};
use crate::{
    error::{HarnessError, HarnessResult},
    instance::{
        args::probe_version,
        supervisor::{InstanceSupervisor, UnitInstance},
    },
    ipc::{control::ControlClient, http::HttpClient},
    log::{
        alerts::AlertFilter,
        records::{AvailableModules, RouteDecision, route_decisions},
        tailer::{PatternWait, UnitLog},
    },
    process::{background::BackgroundProcesses, census::ProcessCensus},
};

const CONTROLLER_STARTED: &str = "controller started";

#[derive(Debug)]
pub struct SessionOrchestrator {
    options: HarnessOptions,
    supervisor: InstanceSupervisor,
    census: ProcessCensus,
    log: UnitLog,
    alerts: AlertFilter,
    background: BackgroundProcesses,
    baselines: Option<BaselineSet>,
    modules: AvailableModules,
    version: String,
}

impl SessionOrchestrator {
    pub fn new(options: HarnessOptions) -> HarnessResult<Self> {
        Self::with_census(options, ProcessCensus::default())
    }

    pub fn with_census(options: HarnessOptions, census: ProcessCensus) -> HarnessResult<Self> {
        options.validate()?;
        Ok(Self {
            supervisor: InstanceSupervisor::new(&options),
            log: UnitLog::new(PathBuf::new()),
            options,
            census,
            alerts: AlertFilter::default(),
            background: BackgroundProcesses::default(),
            baselines: None,
            modules: AvailableModules::default(),
            version: String::new(),
        })
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    /// Merged `unitd --version` output, empty before the suite starts.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn supervisor(&self) -> &InstanceSupervisor {
        &self.supervisor
    }

    pub fn baselines(&self) -> Option<&BaselineSet> {
        self.baselines.as_ref()
    }

    pub fn log(&self) -> &UnitLog {
        &self.log
    }

    /// Launches unless a reusable instance is already running.
    fn ensure_ready(&mut self) -> HarnessResult<()> {
        if self.supervisor.is_ready() && !self.options.restart {
            return Ok(());
        }
        match self.supervisor.launch(&self.census, &self.modules, None) {
            Ok(baselines) => {
                self.baselines = Some(baselines);
                if let Some(instance) = self.supervisor.instance() {
                    self.log.rebind(instance.temp_dir());
                }
                Ok(())
            }
            Err(e) => {
                self.baselines = None;
                if let Some(instance) = self.supervisor.instance() {
                    drop(DiagnosticCapture::new("launch", &instance.log_file(), 0));
                }
                Err(e)
            }
        }
    }

    fn instance(&self) -> HarnessResult<&UnitInstance> {
        self.supervisor
            .instance()
            .ok_or(HarnessError::InvalidState {
                expected: "launched",
                actual: self.supervisor.state().as_str(),
            })
    }

    /// Reset for reuse: empty configuration, temp dir trimmed to the
    /// residual set.
    fn recycle(&self, report: &mut TeardownReport) {
        let Ok(instance) = self.instance() else {
            return;
        };
        if let Err(e) = instance.reset_config(&self.modules) {
            report.push(HygieneFailure::Cleanup(format!("reset configuration: {e}")));
        }
        if let Err(e) = instance.layout().purge() {
            report.push(HygieneFailure::Cleanup(format!("clear temp dir: {e}")));
        }
    }

    fn check_alerts(&self, log: &str, report: &mut TeardownReport) {
        let unexpected = self.alerts.unexpected(log);
        if !unexpected.is_empty() {
            report.push(HygieneFailure::Alerts(
                unexpected.into_iter().map(str::to_owned).collect(),
            ));
        }
    }

    fn remove_instance_dir(&mut self, report: &mut TeardownReport) {
        if let Err(e) = self.supervisor.discard() {
            report.push(HygieneFailure::Cleanup(format!("remove temp dir: {e}")));
        }
    }
}

impl HarnessLifecycle for SessionOrchestrator {
    /// Probes the build, starts the first instance, waits for the controller,
    /// and discovers modules. Everything that fails here is fatal.
    fn before_suite(&mut self) -> HarnessResult<()> {
        let paths = self.options.paths();
        if !paths.unitd.is_file() {
            return Err(HarnessError::UnitNotFound { path: paths.unitd });
        }
        self.version = probe_version(&paths.unitd)?;
        self.ensure_ready()?;

        let started = self
            .log
            .wait_for_record(CONTROLLER_STARTED, &PatternWait::default())?;
        if started.is_none() {
            drop(DiagnosticCapture::new("suite start", &self.log.path(), 0));
            return Err(HarnessError::LogTimeout {
                pattern: CONTROLLER_STARTED.into(),
            });
        }

        let mut modules = AvailableModules::from_log(&self.log.read_all()?);
        modules.detect_features(&self.version);
        crate::info!("available: {modules}");
        self.modules = modules;

        let mut report = TeardownReport::new("suite start");
        self.instance()?.reset_config(&self.modules)?;
        if self.options.restart {
            report.extend(self.supervisor.stop(&self.census));
        }
        self.check_alerts(&self.log.read()?, &mut report);
        self.log.checkpoint()?;
        if self.options.restart {
            self.remove_instance_dir(&mut report);
            self.log.set_pos(0);
        } else if let Err(e) = self.instance()?.layout().purge() {
            report.push(HygieneFailure::Cleanup(format!("clear temp dir: {e}")));
        }
        report.into_result()
    }

    fn before_test(&mut self, test: &str) -> HarnessResult<()> {
        crate::debug!("setting up {test}");
        self.ensure_ready()?;
        self.alerts = AlertFilter::default();
        if let Some(baselines) = self.baselines.as_mut() {
            baselines.skip(RoleSet::NONE);
        }
        Ok(())
    }

    fn execute(&mut self, case: &dyn HarnessCase) -> HarnessResult<()> {
        let instance = self.supervisor.instance().ok_or(HarnessError::InvalidState {
            expected: "launched",
            actual: self.supervisor.state().as_str(),
        })?;
        let mut ctx = TestContext {
            options: &self.options,
            instance,
            census: &self.census,
            modules: &self.modules,
            log: &mut self.log,
            alerts: &mut self.alerts,
            background: &mut self.background,
            baselines: self.baselines.as_mut(),
        };
        case.run(&mut ctx)
    }

    fn after_test(&mut self, test: &str, failed: bool) -> HarnessResult<()> {
        let mut report = TeardownReport::new(test);
        let restart = self.options.restart;

        if restart {
            report.extend(self.supervisor.stop(&self.census));
        }
        if let Some(msg) = self.background.stop_all(self.options.join_budget) {
            report.push(HygieneFailure::StopProcesses(msg));
        }

        let log = match self.log.read() {
            Ok(text) => text,
            Err(e) => {
                crate::warn!("could not read log after {test}: {e}");
                String::new()
            }
        };
        let mut capture = DiagnosticCapture::from_text(test, log.clone());
        if let Err(e) = self.log.checkpoint() {
            crate::warn!("could not advance log cursor: {e}");
        }

        if restart {
            if !self.options.save_log {
                self.remove_instance_dir(&mut report);
                self.log.set_pos(0);
            }
        } else {
            self.recycle(&mut report);
        }

        if let Some(baselines) = self.baselines.as_mut() {
            let (settle, interval) = (self.options.settle_budget, self.options.poll_interval);
            report.extend(baselines.check_leaks(
                &self.census,
                self.options.fds_threshold,
                settle,
                interval,
                restart,
            ));
            report.extend(baselines.check_processes(&self.census, settle, interval, restart));
        }

        self.check_alerts(&log, &mut report);

        if !failed && report.is_clean() && !self.options.print_log {
            capture.disarm();
        }
        drop(capture);
        report.into_result()
    }

    /// Final stop with restart semantics, then the temp dir goes unless the
    /// log is to be kept.
    fn after_suite(&mut self) -> HarnessResult<()> {
        let mut report = TeardownReport::new("suite end");
        if self.options.save_log {
            if let Some(instance) = self.supervisor.instance() {
                crate::info!("Path to unit.log:\n{}", instance.log_file().display());
            }
        }
        report.extend(self.supervisor.stop(&self.census));
        if let Some(msg) = self.background.stop_all(self.options.join_budget) {
            report.push(HygieneFailure::StopProcesses(msg));
        }
        if !self.options.save_log {
            self.remove_instance_dir(&mut report);
        }
        self.baselines = None;
        report.into_result()
    }

    fn allows_unsafe(&self) -> bool {
        self.options.unsafe_tests
    }

    fn modules(&self) -> &AvailableModules {
        &self.modules
    }
}

/// What a test body gets to work with.
#[derive(Debug)]
pub struct TestContext<'a> {
    options: &'a HarnessOptions,
    instance: &'a UnitInstance,
    census: &'a ProcessCensus,
    modules: &'a AvailableModules,
    log: &'a mut UnitLog,
    alerts: &'a mut AlertFilter,
    background: &'a mut BackgroundProcesses,
    baselines: Option<&'a mut BaselineSet>,
}

impl TestContext<'_> {
    pub fn control(&self) -> &ControlClient {
        self.instance.control()
    }

    /// Client for test traffic to a listener on `127.0.0.1:port`.
    pub fn http(&self, port: u16) -> HttpClient {
        HttpClient::local(port)
    }

    pub fn log(&self) -> &UnitLog {
        &*self.log
    }

    pub fn log_mut(&mut self) -> &mut UnitLog {
        &mut *self.log
    }

    /// Polls the log for `pattern` with the default budget (150 × 100 ms).
    pub fn wait_for_record(&self, pattern: &str) -> HarnessResult<Option<String>> {
        self.log.wait_for_record(pattern, &PatternWait::default())
    }

    /// Like [`Self::wait_for_record`], polling for at most `budget` at the
    /// session's poll interval.
    pub fn wait_for_record_within(
        &self,
        pattern: &str,
        budget: Duration,
    ) -> HarnessResult<Option<String>> {
        let wait = PatternWait::builder()
            .attempts(self.options.attempts(budget))
            .interval(self.options.poll_interval)
            .build();
        self.log.wait_for_record(pattern, &wait)
    }

    /// Route selections the router logged during this test.
    pub fn route_decisions(&self) -> HarnessResult<Vec<RouteDecision>> {
        Ok(route_decisions(&self.log.read()?))
    }

    pub fn findall(&self, pattern: &str) -> HarnessResult<Vec<Vec<String>>> {
        self.log.findall(pattern)
    }

    pub fn search(&self, pattern: &str) -> HarnessResult<Option<String>> {
        self.log.search(pattern)
    }

    /// Tolerates `[alert]` lines matching any of `patterns` for this test.
    pub fn skip_alerts(&mut self, patterns: &[&str]) -> HarnessResult<()> {
        self.alerts.skip(patterns)
    }

    /// Exempts roles from this test's descriptor check.
    pub fn skip_fds_check(&mut self, roles: RoleSet) {
        if let Some(baselines) = self.baselines.as_deref_mut() {
            baselines.skip(roles);
        }
    }

    pub fn temp_dir(&self) -> &Path {
        self.instance.temp_dir()
    }

    pub fn unit_pid(&self) -> u32 {
        self.instance.pid()
    }

    pub fn modules(&self) -> &AvailableModules {
        self.modules
    }

    pub fn options(&self) -> &HarnessOptions {
        self.options
    }

    pub fn census(&self) -> &ProcessCensus {
        self.census
    }

    /// Spawns a helper that teardown will terminate and join.
    pub fn spawn_background(&mut self, cmd: Command) -> HarnessResult<u32> {
        Ok(self.background.spawn(cmd)?)
    }

    pub fn register_background(&mut self, label: impl Into<String>, child: Child) -> u32 {
        self.background.register(label, child)
    }

    /// A supervisor for an extra instance of the same build, independent of
    /// the session's own.
    pub fn scratch_supervisor(&self) -> InstanceSupervisor {
        InstanceSupervisor::new(self.options)
    }
}

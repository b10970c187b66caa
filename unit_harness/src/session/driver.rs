//! Session – driver
//! ================
//!
//! The loop that runs a suite:
//!
//! ```text
//! before_suite
//!   for each case:
//!     unsafe without opt-in? ──────► Skipped
//!     prerequisites? ── missing ──► Skipped
//!     before_test → execute → after_test (always)
//! after_suite (always, also when a fatal error aborts the loop)
//! ```
//!
//! A case fails on its own errors and on the hygiene report of its teardown;
//! both end up in [`CaseOutcome::Failed`]. Errors for which
//! [`HarnessError::is_fatal`] holds stop the suite.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;

use super::orchestrator::{SessionOrchestrator, TestContext};
use crate::{
    error::{HarnessError, HarnessResult},
    log::records::AvailableModules,
};

/// Ordered lifecycle of a harness session.
pub trait HarnessLifecycle {
    fn before_suite(&mut self) -> HarnessResult<()>;

    fn before_test(&mut self, test: &str) -> HarnessResult<()>;

    fn execute(&mut self, case: &dyn HarnessCase) -> HarnessResult<()>;

    /// Runs whatever happened before; `failed` tells whether the setup or
    /// the body already failed.
    fn after_test(&mut self, test: &str, failed: bool) -> HarnessResult<()>;

    fn after_suite(&mut self) -> HarnessResult<()>;

    /// What the build under test provides, known after `before_suite`.
    fn modules(&self) -> &AvailableModules;

    /// Whether cases that change host state may run.
    fn allows_unsafe(&self) -> bool {
        false
    }
}

/// One test body.
pub trait HarnessCase {
    fn name(&self) -> &str;

    /// Modules the case needs; it is skipped when any is missing.
    fn required_modules(&self) -> &[&'static str] {
        &[]
    }

    /// Cases that touch host state outside the instance directory run only
    /// when the session opts in.
    fn is_unsafe(&self) -> bool {
        false
    }

    fn run(&self, ctx: &mut TestContext<'_>) -> HarnessResult<()>;
}

type CaseFn = dyn Fn(&mut TestContext<'_>) -> HarnessResult<()> + Send + Sync;

/// Closure-backed [`HarnessCase`].
pub struct TestCase {
    name: String,
    modules: Vec<&'static str>,
    unsafe_only: bool,
    body: Box<CaseFn>,
}

impl TestCase {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut TestContext<'_>) -> HarnessResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            modules: Vec::new(),
            unsafe_only: false,
            body: Box::new(body),
        }
    }

    pub fn requires(mut self, modules: &[&'static str]) -> Self {
        self.modules.extend_from_slice(modules);
        self
    }

    pub fn unsafe_only(mut self) -> Self {
        self.unsafe_only = true;
        self
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("modules", &self.modules)
            .field("unsafe_only", &self.unsafe_only)
            .finish_non_exhaustive()
    }
}

impl HarnessCase for TestCase {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_modules(&self) -> &[&'static str] {
        &self.modules
    }

    fn is_unsafe(&self) -> bool {
        self.unsafe_only
    }

    fn run(&self, ctx: &mut TestContext<'_>) -> HarnessResult<()> {
        (self.body)(ctx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CaseOutcome {
    Passed,
    Failed(Vec<String>),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseRecord {
    pub name: String,
    pub outcome: CaseOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SuiteSummary {
    pub cases: Vec<CaseRecord>,
    /// Problems of the suite teardown itself.
    pub suite_errors: Vec<String>,
    pub interrupted: bool,
}

impl SuiteSummary {
    pub fn count(&self, pred: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.cases.iter().filter(|c| pred(&c.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Skipped(_)))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.suite_errors.is_empty() && !self.interrupted
    }
}

impl fmt::Display for SuiteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use fmt::Write as _;

        for case in &self.cases {
            match &case.outcome {
                CaseOutcome::Passed => writeln!(f, "PASSED  {} ({:.2?})", case.name, case.elapsed)?,
                CaseOutcome::Skipped(why) => writeln!(f, "SKIPPED {}: {why}", case.name)?,
                CaseOutcome::Failed(reasons) => {
                    writeln!(f, "FAILED  {} ({:.2?})", case.name, case.elapsed)?;
                    let mut ind = indenter::indented(f).with_str("        ");
                    for reason in reasons {
                        writeln!(ind, "{reason}")?;
                    }
                }
            }
        }
        for e in &self.suite_errors {
            writeln!(f, "SUITE   {e}")?;
        }
        if self.interrupted {
            writeln!(f, "interrupted")?;
        }
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failed(),
            self.skipped()
        )
    }
}

#[derive(Debug)]
pub struct SuiteDriver<L: HarnessLifecycle = SessionOrchestrator> {
    lifecycle: L,
    interrupt: Arc<AtomicBool>,
}

impl<L: HarnessLifecycle> SuiteDriver<L> {
    pub fn new(lifecycle: L) -> Self {
        Self {
            lifecycle,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops scheduling new cases once set, e.g. from a Ctrl-C
    /// handler. The running case and the suite teardown still complete.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }

    pub fn into_inner(self) -> L {
        self.lifecycle
    }

    pub fn run(&mut self, cases: &[&dyn HarnessCase]) -> HarnessResult<SuiteSummary> {
        let mut summary = SuiteSummary::default();

        if let Err(e) = self.lifecycle.before_suite() {
            crate::error!("suite setup failed: {e}");
            self.finish_suite(&mut summary);
            return Err(e);
        }

        for case in cases {
            if self.interrupt.load(Ordering::SeqCst) {
                crate::warn!("interrupted; not starting {}", case.name());
                summary.interrupted = true;
                break;
            }
            let (record, fatal) = self.run_case(*case);
            crate::info!("{}: {:?}", record.name, record.outcome);
            summary.cases.push(record);

            if let Some(e) = fatal {
                crate::error!("aborting run: {e}");
                self.finish_suite(&mut summary);
                return Err(e);
            }
        }

        self.finish_suite(&mut summary);
        Ok(summary)
    }

    fn run_case(&mut self, case: &dyn HarnessCase) -> (CaseRecord, Option<HarnessError>) {
        let name = case.name().to_owned();
        let started = Instant::now();

        if case.is_unsafe() && !self.lifecycle.allows_unsafe() {
            let record = CaseRecord {
                name,
                outcome: CaseOutcome::Skipped("unsafe tests are disabled".into()),
                elapsed: started.elapsed(),
            };
            return (record, None);
        }

        let missing = self.lifecycle.modules().missing(case.required_modules());
        if !missing.is_empty() {
            let record = CaseRecord {
                name,
                outcome: CaseOutcome::Skipped(format!(
                    "Unit has no {} module(s)",
                    missing.join(", ")
                )),
                elapsed: started.elapsed(),
            };
            return (record, None);
        }

        let mut reasons = Vec::new();
        let mut fatal = None;
        match self.lifecycle.before_test(&name) {
            Ok(()) => {
                if let Err(e) = self.lifecycle.execute(case) {
                    reasons.push(e.to_string());
                }
            }
            Err(e) if e.is_fatal() => {
                reasons.push(e.to_string());
                fatal = Some(e);
            }
            Err(e) => reasons.push(e.to_string()),
        }

        if let Err(e) = self.lifecycle.after_test(&name, !reasons.is_empty()) {
            reasons.push(e.to_string());
            if fatal.is_none() && e.is_fatal() {
                fatal = Some(e);
            }
        }

        let outcome = if reasons.is_empty() {
            CaseOutcome::Passed
        } else {
            CaseOutcome::Failed(reasons)
        };
        let record = CaseRecord {
            name,
            outcome,
            elapsed: started.elapsed(),
        };
        (record, fatal)
    }

    fn finish_suite(&mut self, summary: &mut SuiteSummary) {
        if let Err(e) = self.lifecycle.after_suite() {
            crate::error!("suite teardown failed: {e}");
            summary.suite_errors.push(e.to_string());
        }
    }
}

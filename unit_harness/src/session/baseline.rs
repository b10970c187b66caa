//! Resource baselines
//! ==================
//!
//! Descriptor count and pid of the three watched roles of an instance:
//!
//! | Role         | Found by                                  |
//! |--------------|-------------------------------------------|
//! | `main`       | pid file                                  |
//! | `router`     | child of main titled `unit: router`       |
//! | `controller` | child of main titled `unit: controller`   |
//!
//! After each test the observed count must settle to within the threshold
//! of the baseline; the baseline then absorbs whatever delta remained, so a
//! tolerated growth does not accumulate into the next test's check.

use std::{
    fmt,
    time::{Duration, Instant},
};

use serde::Serialize;

use super::report::HygieneFailure;
use crate::process::{
    census::{ProcEntry, ProcessCensus},
    fds::DescriptorCount,
    pid::pid_alive,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Main,
    Router,
    Controller,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Main, Role::Router, Role::Controller];

    /// Process title the server gives this role.
    pub fn title(self) -> &'static str {
        match self {
            Role::Main => "unit: main",
            Role::Router => "unit: router",
            Role::Controller => "unit: controller",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Main => "main",
            Role::Router => "router",
            Role::Controller => "controller",
        })
    }
}

/// Roles whose descriptor check is waived for the current test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleSet {
    pub main: bool,
    pub router: bool,
    pub controller: bool,
}

impl RoleSet {
    pub const NONE: RoleSet = RoleSet {
        main: false,
        router: false,
        controller: false,
    };

    pub fn contains(&self, role: Role) -> bool {
        match role {
            Role::Main => self.main,
            Role::Router => self.router,
            Role::Controller => self.controller,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceBaseline {
    pub role: Role,
    pub pid: Option<u32>,
    pub fds: usize,
    /// Whether the count came from a working strategy.
    pub counted: bool,
}

impl ResourceBaseline {
    fn unobserved(role: Role) -> Self {
        Self {
            role,
            pid: None,
            fds: 0,
            counted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaselineSet {
    main_pid: u32,
    roles: [ResourceBaseline; 3],
    skip: RoleSet,
}

impl BaselineSet {
    /// Snapshot right after launch. Children that have not appeared yet are
    /// recorded without a pid.
    pub fn capture(census: &ProcessCensus, main_pid: u32) -> Self {
        let mut set = Self {
            main_pid,
            roles: Role::ALL.map(ResourceBaseline::unobserved),
            skip: RoleSet::NONE,
        };
        for role in Role::ALL {
            let pid = set.locate(census, role);
            let count = count_or_zero(census, pid);
            set.roles[role.index()] = ResourceBaseline {
                role,
                pid,
                fds: count.value(),
                counted: count.is_available(),
            };
        }
        crate::debug!("baselines: {set}");
        set
    }

    /// Like [`capture`](Self::capture), but polls until both child roles
    /// have been observed or `budget` runs out.
    pub fn capture_when_ready(
        census: &ProcessCensus,
        main_pid: u32,
        budget: Duration,
        interval: Duration,
    ) -> Self {
        let deadline = Instant::now() + budget;
        loop {
            let set = Self::capture(census, main_pid);
            let complete = set.roles.iter().all(|b| b.pid.is_some());
            if complete || Instant::now() >= deadline {
                if !complete {
                    crate::warn!("not every role of pid {main_pid} appeared: {set}");
                }
                return set;
            }
            std::thread::sleep(interval);
        }
    }

    pub fn main_pid(&self) -> u32 {
        self.main_pid
    }

    pub fn get(&self, role: Role) -> &ResourceBaseline {
        &self.roles[role.index()]
    }

    pub fn skip(&mut self, roles: RoleSet) {
        self.skip = roles;
    }

    pub fn skipped(&self) -> RoleSet {
        self.skip
    }

    fn locate(&self, census: &ProcessCensus, role: Role) -> Option<u32> {
        match role {
            Role::Main => Some(self.main_pid),
            _ => census.find_pid_by_name(self.main_pid, role.title()),
        }
    }

    /// Re-measures every role after a test.
    ///
    /// Non-skipped roles are polled until `observed - baseline <= threshold`
    /// or `settle` elapses; the baseline then moves by the final delta.
    /// Skipped roles just take a fresh baseline. Outside restart mode the
    /// router and controller pids must not have changed. Skips are cleared
    /// for the next test.
    pub fn check_leaks(
        &mut self,
        census: &ProcessCensus,
        threshold: usize,
        settle: Duration,
        interval: Duration,
        restart: bool,
    ) -> Vec<HygieneFailure> {
        let mut failures = Vec::new();
        let threshold_i = i64::try_from(threshold).unwrap_or(i64::MAX);

        for role in Role::ALL {
            let before = self.get(role).pid;
            let pid = self.locate(census, role);
            let skip = self.skip.contains(role);

            if skip {
                let count = count_or_zero(census, pid);
                let b = &mut self.roles[role.index()];
                b.pid = pid;
                b.fds = count.value();
                b.counted = count.is_available();
                continue;
            }

            let base = self.get(role).fds as i64;
            let deadline = Instant::now() + settle;
            let (diff, count) = loop {
                let count = count_or_zero(census, pid);
                let diff = count.value() as i64 - base;
                if diff <= threshold_i || Instant::now() >= deadline {
                    break (diff, count);
                }
                std::thread::sleep(interval);
            };

            let b = &mut self.roles[role.index()];
            b.pid = pid;
            b.fds = (base + diff).max(0) as usize;
            b.counted = count.is_available();

            if role != Role::Main && !restart && pid != before {
                failures.push(HygieneFailure::PidChanged { role, before, after: pid });
            }
            if diff > threshold_i {
                failures.push(HygieneFailure::DescriptorLeak {
                    role,
                    pid,
                    baseline: base as usize,
                    observed: count.value(),
                    threshold,
                });
            }
        }
        self.skip = RoleSet::NONE;
        failures
    }

    /// Waits for the tree under the main pid to shrink to at most three
    /// processes, then checks its shape with [`check_process_tree`].
    pub fn check_processes(
        &self,
        census: &ProcessCensus,
        settle: Duration,
        interval: Duration,
        restart: bool,
    ) -> Option<HygieneFailure> {
        let deadline = Instant::now() + settle;
        let tree = loop {
            let tree = census.rooted_at(self.main_pid);
            if tree.len() <= 3 || Instant::now() >= deadline {
                break tree;
            }
            std::thread::sleep(interval);
        };
        check_process_tree(
            &tree,
            self.main_pid,
            self.get(Role::Router).pid,
            self.get(Role::Controller).pid,
            restart,
        )
    }
}

/// Shape check of `tree` (the main process and its direct children).
///
/// A stopped instance must leave nothing behind. A running one must be
/// exactly main, router, and controller, with the two children at the
/// pids recorded in the baselines. The first unmet expectation is reported.
pub fn check_process_tree(
    tree: &[ProcEntry],
    main_pid: u32,
    router: Option<u32>,
    controller: Option<u32>,
    stopped: bool,
) -> Option<HygieneFailure> {
    let fail = |expectation: &'static str| {
        Some(HygieneFailure::ProcessCount {
            expectation,
            observed: tree.iter().map(ToString::to_string).collect(),
        })
    };

    if stopped {
        return if tree.is_empty() { None } else { fail("all terminated") };
    }
    if tree.len() != 3 {
        return fail("main, router, and controller expected");
    }

    let rest: Vec<&ProcEntry> = tree
        .iter()
        .filter(|e| !(e.pid == main_pid && e.matches(Role::Main.title())))
        .collect();
    if rest.len() != 2 {
        return fail("one main");
    }

    let is_child = |e: &ProcEntry, pid: Option<u32>, role: Role| {
        Some(e.pid) == pid && e.ppid == Some(main_pid) && e.matches(role.title())
    };
    let rest: Vec<&ProcEntry> = rest
        .into_iter()
        .filter(|e| !is_child(e, router, Role::Router))
        .collect();
    if rest.len() != 1 {
        return fail("one router");
    }
    if rest.iter().any(|e| !is_child(e, controller, Role::Controller)) {
        return fail("one controller");
    }
    None
}

/// Dead or unknown pids hold no descriptors.
fn count_or_zero(census: &ProcessCensus, pid: Option<u32>) -> DescriptorCount {
    match pid {
        Some(pid) if matches!(pid_alive(pid), Ok(true)) => census.count_descriptors(pid),
        _ => DescriptorCount::Counted {
            count: 0,
            source: "exited",
        },
    }
}

impl fmt::Display for BaselineSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for b in &self.roles {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            match b.pid {
                Some(pid) => write!(f, "{} pid {pid} fds {}", b.role, b.fds)?,
                None => write!(f, "{} unobserved", b.role)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serial_test::serial;

    use super::*;
    use crate::process::fds::{DescriptorCounter, FdCounter};

    /// Counter reading a shared, test-controlled value.
    #[derive(Debug)]
    struct Scripted(Arc<std::sync::atomic::AtomicUsize>);

    impl FdCounter for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn count(&self, _pid: u32) -> Option<usize> {
            Some(self.0.load(std::sync::atomic::Ordering::SeqCst))
        }
    }

    fn scripted_census(start: usize) -> (ProcessCensus, Arc<std::sync::atomic::AtomicUsize>) {
        let value = Arc::new(std::sync::atomic::AtomicUsize::new(start));
        let census = ProcessCensus::new(DescriptorCounter::with_chain(vec![Box::new(Scripted(
            value.clone(),
        ))]));
        (census, value)
    }

    fn entry(pid: u32, ppid: u32, command: &str) -> ProcEntry {
        ProcEntry {
            pid,
            ppid: Some(ppid),
            name: "unitd".into(),
            command: command.into(),
            zombie: false,
        }
    }

    fn healthy_tree() -> Vec<ProcEntry> {
        vec![
            entry(100, 1, "unit: main v1.34.0 [/build/sbin/unitd --no-daemon]"),
            entry(101, 100, "unit: controller"),
            entry(102, 100, "unit: router"),
        ]
    }

    #[test]
    fn healthy_tree_passes() {
        assert_eq!(
            check_process_tree(&healthy_tree(), 100, Some(102), Some(101), false),
            None
        );
        assert_eq!(check_process_tree(&[], 100, None, None, true), None);
    }

    #[test]
    fn tree_expectations_in_order() {
        let expectation = |f: Option<HygieneFailure>| match f {
            Some(HygieneFailure::ProcessCount { expectation, .. }) => expectation,
            other => panic!("unexpected {other:?}"),
        };

        let mut extra = healthy_tree();
        extra.push(entry(103, 100, "unit: \"python\" application"));
        assert_eq!(
            expectation(check_process_tree(&extra, 100, Some(102), Some(101), false)),
            "main, router, and controller expected"
        );

        let mut no_main = healthy_tree();
        no_main[0].command = "sh".into();
        assert_eq!(
            expectation(check_process_tree(&no_main, 100, Some(102), Some(101), false)),
            "one main"
        );

        assert_eq!(
            expectation(check_process_tree(&healthy_tree(), 100, Some(999), Some(101), false)),
            "one router"
        );
        assert_eq!(
            expectation(check_process_tree(&healthy_tree(), 100, Some(102), Some(999), false)),
            "one controller"
        );
        assert_eq!(
            expectation(check_process_tree(&healthy_tree(), 100, None, None, true)),
            "all terminated"
        );
    }

    const FAST: Duration = Duration::from_millis(300);
    const TICK: Duration = Duration::from_millis(20);

    #[test]
    #[serial]
    fn settled_counts_pass_and_absorb_delta() {
        let (census, value) = scripted_census(10);
        let me = std::process::id();
        let mut set = BaselineSet::capture(&census, me);
        assert_eq!(set.get(Role::Main).fds, 10);
        assert_eq!(set.get(Role::Router).pid, None);

        value.store(11, std::sync::atomic::Ordering::SeqCst);
        let failures = set.check_leaks(&census, 1, FAST, TICK, false);
        assert!(failures.is_empty(), "{failures:?}");
        assert_eq!(set.get(Role::Main).fds, 11);
    }

    #[test]
    #[serial]
    fn leak_names_the_role() {
        let (census, value) = scripted_census(10);
        let mut set = BaselineSet::capture(&census, std::process::id());
        value.store(13, std::sync::atomic::Ordering::SeqCst);

        let failures = set.check_leaks(&census, 0, FAST, TICK, false);
        assert_eq!(
            failures,
            vec![HygieneFailure::DescriptorLeak {
                role: Role::Main,
                pid: Some(std::process::id()),
                baseline: 10,
                observed: 13,
                threshold: 0,
            }]
        );
    }

    #[test]
    #[serial]
    fn leak_that_drains_within_window_passes() {
        let (census, value) = scripted_census(10);
        let mut set = BaselineSet::capture(&census, std::process::id());
        value.store(15, std::sync::atomic::Ordering::SeqCst);

        let drain = {
            let value = value.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                value.store(10, std::sync::atomic::Ordering::SeqCst);
            })
        };
        let failures = set.check_leaks(&census, 0, Duration::from_secs(5), TICK, false);
        drain.join().unwrap();
        assert!(failures.is_empty());
    }

    #[test]
    #[serial]
    fn skipped_role_refreshes_and_skip_resets() {
        let (census, value) = scripted_census(10);
        let mut set = BaselineSet::capture(&census, std::process::id());
        set.skip(RoleSet {
            main: true,
            ..RoleSet::NONE
        });
        value.store(40, std::sync::atomic::Ordering::SeqCst);

        assert!(set.check_leaks(&census, 0, FAST, TICK, false).is_empty());
        assert_eq!(set.get(Role::Main).fds, 40);
        assert_eq!(set.skipped(), RoleSet::NONE);
    }

    /// A titled router child of the test process, visible in the table.
    fn spawn_router(census: &ProcessCensus) -> std::process::Child {
        let child = std::process::Command::new("sh")
            .args(["-c", "sleep 30; : 'unit: router'"])
            .spawn()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while census.find_pid_by_name(std::process::id(), Role::Router.title()) != Some(child.id())
        {
            assert!(Instant::now() < deadline, "router {} never showed up", child.id());
            std::thread::sleep(TICK);
        }
        child
    }

    fn end(mut child: std::process::Child) {
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    #[serial]
    fn replaced_router_is_reported_outside_restart_mode() {
        let (census, _value) = scripted_census(10);
        let first = spawn_router(&census);
        let mut set = BaselineSet::capture(&census, std::process::id());
        assert_eq!(set.get(Role::Router).pid, Some(first.id()));

        let before = first.id();
        end(first);
        let second = spawn_router(&census);
        let failures = set.check_leaks(&census, 0, FAST, TICK, false);
        assert_eq!(
            failures,
            vec![HygieneFailure::PidChanged {
                role: Role::Router,
                before: Some(before),
                after: Some(second.id()),
            }]
        );
        assert_eq!(set.get(Role::Router).pid, Some(second.id()));

        // a fresh instance per test is expected to bring new children
        let before = second.id();
        end(second);
        let third = spawn_router(&census);
        assert!(set.check_leaks(&census, 0, FAST, TICK, true).is_empty());
        assert_ne!(set.get(Role::Router).pid, Some(before));
        end(third);
    }

    #[test]
    #[serial]
    fn child_roles_found_by_title() {
        let me = std::process::id();
        let mut router = std::process::Command::new("sh")
            .args(["-c", "sleep 30; : 'unit: router'"])
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let census = ProcessCensus::default();
        let set = BaselineSet::capture(&census, me);
        router.kill().unwrap();
        router.wait().unwrap();

        assert_eq!(set.get(Role::Router).pid, Some(router.id()));
        assert_eq!(set.get(Role::Controller).pid, None);
        assert!(set.to_string().contains("controller unobserved"));
    }
}

//! Unit Harness CLI: binary crate entry-point
//! =========================================
//!
//! Command-line front end for the `unit_harness` session layer. Point it at a
//! build directory and it runs the built-in cases against a supervised
//! `unitd`, with the full setup/teardown protocol around each one.
//!
//! ## Typical usage
//! ```text
//! # Every built-in case, one instance reused across cases
//! $ unit-harness-cli --builddir ./build run
//!
//! # Fresh instance per case, keep the log
//! $ unit-harness-cli --builddir ./build --restart --save-log run return_200
//!
//! # Helpers
//! $ unit-harness-cli list           # names of the built-in cases
//! $ unit-harness-cli census 4242    # descriptors, children, zombies of a pid
//! $ unit-harness-cli probe          # start and stop one instance
//! ```
//!
//! `UNIT_HARNESS_BUILDDIR` stands in for `--builddir`. `RUST_LOG` overrides
//! the log filter.

use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use unit_harness::*;

#[derive(Debug, Parser)]
#[command(name = "unit-harness-cli", version)]
struct Cli {
    #[command(flatten)]
    harness: HarnessFlags,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Args)]
struct HarnessFlags {
    /// Build directory holding sbin/unitd
    #[arg(long, env = BUILDDIR_ENV, value_name = "DIR", global = true)]
    builddir: Option<PathBuf>,

    /// Fresh instance for every case
    #[arg(long, global = true)]
    restart: bool,

    /// Keep the temp directory and its unit.log
    #[arg(long, global = true)]
    save_log: bool,

    /// Print unit.log after every case
    #[arg(long, global = true)]
    print_log: bool,

    /// Debug-level harness logging
    #[arg(long, global = true)]
    detailed: bool,

    /// Run cases that change host state
    #[arg(long = "unsafe", global = true)]
    unsafe_tests: bool,

    /// Tolerated descriptor growth per role
    #[arg(long, default_value_t = 0, global = true)]
    fds_threshold: usize,

    /// User for the application processes (unitd --user)
    #[arg(long, global = true)]
    user: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run built-in cases (all when no name is given)
    Run { names: Vec<String> },

    /// List built-in cases
    List,

    /// Descriptor count, direct children and zombie children of a pid
    Census { pid: u32 },

    /// Start one instance and stop it again
    Probe,
}

impl HarnessFlags {
    fn options(&self) -> HarnessResult<HarnessOptions> {
        let Some(builddir) = &self.builddir else {
            return Err(HarnessError::InvalidConfig {
                field: "builddir",
                reason: format!("pass --builddir or set {BUILDDIR_ENV}"),
            });
        };
        let options = HarnessOptions::builder()
            .builddir(builddir.clone())
            .restart(self.restart)
            .save_log(self.save_log)
            .print_log(self.print_log)
            .detailed(self.detailed)
            .unsafe_tests(self.unsafe_tests)
            .fds_threshold(self.fds_threshold)
            .maybe_user(self.user.clone())
            .build();
        options.validate()?;
        Ok(options)
    }
}

fn init_tracing(detailed: bool) {
    let default = if detailed { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_cases(options: HarnessOptions, names: &[String]) -> HarnessResult<ExitCode> {
    let cases = scenarios::all();
    let selected: Vec<&dyn HarnessCase> = if names.is_empty() {
        cases.iter().map(|c| c as &dyn HarnessCase).collect()
    } else {
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let Some(case) = cases.iter().find(|c| c.name() == name) else {
                return Err(HarnessError::InvalidConfig {
                    field: "case",
                    reason: format!("no built-in case named `{name}`"),
                });
            };
            selected.push(case as &dyn HarnessCase);
        }
        selected
    };

    let mut driver = SuiteDriver::new(SessionOrchestrator::new(options)?);
    let interrupt = driver.interrupt_flag();
    ctrlc::set_handler(move || {
        interrupt.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .map_err(|e| HarnessError::InvalidConfig {
        field: "ctrl-c handler",
        reason: e.to_string(),
    })?;

    let summary = driver.run(&selected)?;
    println!("{summary}");
    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn census(pid: u32) -> ExitCode {
    let census = ProcessCensus::default();
    println!("descriptors: {}", census.count_descriptors(pid));

    let tree = census.rooted_at(pid);
    if tree.is_empty() {
        println!("no process {pid}");
    }
    for entry in &tree {
        println!("{entry}");
    }
    let zombie_parent = census.list_zombies().contains(&pid);
    println!(
        "zombie children: {}",
        if zombie_parent { "yes" } else { "none" }
    );
    if zombie_parent {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main() -> HarnessResult<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.harness.detailed);

    match cli.cmd {
        Cmd::List => {
            for case in scenarios::all() {
                println!("{}", case.name());
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Census { pid } => Ok(census(pid)),
        Cmd::Run { names } => run_cases(cli.harness.options()?, &names),
        Cmd::Probe => {
            let case = TestCase::new("spawn_and_stop", scenarios::spawn_and_stop);
            let mut driver = SuiteDriver::new(SessionOrchestrator::new(cli.harness.options()?)?);
            let summary = driver.run(&[&case])?;
            println!("{summary}");
            Ok(if summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

//! unit_harness – supervisor harness for a multi-process server under test
//! =======================================================================
//!
//! ## What it does
//! - **Instance lifecycle** – Launches `unitd` in a private temp directory,
//!   waits for its control socket, and stops it with a graceful signal that
//!   escalates to a process-group kill.
//! - **Clean state between tests** – Resets the JSON configuration to the empty
//!   baseline, purges certificates / script modules, and trims the temp
//!   directory back to its canonical residual set.
//! - **Hygiene checks** – Descriptor-leak detection per process role, zombie
//!   detection, process-count validation, and alert scanning of the log.
//!
//! ## Building blocks
//! | Component              | Type                       | Role                                     |
//! |------------------------|----------------------------|------------------------------------------|
//! | Log tailer             | [`UnitLog`]                | offset checkpoints, pattern waits        |
//! | Control client         | [`ControlClient`]          | JSON config API over TCP / UDS / abstract |
//! | Raw HTTP client        | [`HttpClient`]             | test traffic, malformed requests         |
//! | Process census         | [`ProcessCensus`]          | descriptor counts, ppid scans, zombies   |
//! | Instance supervisor    | [`InstanceSupervisor`]     | launch → ready → stop state machine      |
//! | Session orchestrator   | [`SessionOrchestrator`]    | per-test setup / teardown protocol       |
//!
//! ```rust,no_run
//! use unit_harness::*;
//!
//! fn main() -> HarnessResult<()> {
//!     let options = HarnessOptions::builder().builddir("/opt/unit/build").build();
//!     let mut driver = SuiteDriver::new(SessionOrchestrator::new(options)?);
//!
//!     let summary = driver.run(&[&TestCase::new("return_200", |ctx| {
//!         ctx.control().conf(
//!             &serde_json::json!({
//!                 "listeners": {"*:7080": {"pass": "routes"}},
//!                 "routes": [{"action": {"return": 200}}],
//!             }),
//!             "",
//!         )?;
//!         Ok(())
//!     })])?;
//!
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```
//!
//! ---
//!
//! ## How It Works
//!
//! ```text
//! SuiteDriver
//!       │
//!       └─→ SessionOrchestrator   (before_suite / before_test / after_test / after_suite)
//!                 │
//!                 ├─→ InstanceSupervisor  (spawn, wait for socket, baselines, stop)
//!                 │         └─→ UnitProcessGuard (process group, SIGQUIT → SIGKILL)
//!                 ├─→ ProcessCensus       (/proc → procstat → lsof, sysinfo table)
//!                 ├─→ ControlClient       (PUT /config, DELETE /certificates/…)
//!                 └─→ UnitLog             (cursor + pattern waits)
//! ```

#[cfg(not(unix))]
compile_error!("unit_harness supervises a Unix server and only builds on Unix targets");

#[allow(unused_imports)]
use tracing::{Level, debug, error, info, span, trace, warn};

pub mod error;
pub mod instance;
pub mod ipc;
pub mod log;
pub mod process;
pub mod scenarios;
pub mod session;

pub use error::{HarnessError, HarnessResult};
pub use instance::{args::*, guard::*, layout::*, supervisor::*};
pub use ipc::{ControlAddr, control::*, http::*};
pub use log::{alerts::*, records::*, tailer::*};
pub use process::{background::*, census::*, fds::*};
pub use session::{
    baseline::*, diagnostic::*, driver::*, options::*, orchestrator::*, report::*,
};

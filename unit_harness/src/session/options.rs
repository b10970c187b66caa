//! Harness options
//! ===============
//!
//! Every knob of a harness run in one serialisable struct. Build it in code
//! with [`HarnessOptions::builder`] or map CLI flags onto it.
//!
//! | Field            | Default  | Meaning                                         |
//! |------------------|----------|-------------------------------------------------|
//! | `builddir`       | –        | build tree holding `sbin/unitd`                 |
//! | `restart`        | `false`  | fresh instance per test                         |
//! | `fds_threshold`  | `0`      | tolerated descriptor growth per role            |
//! | `save_log`       | `false`  | keep the temp dir and its log after the run     |
//! | `print_log`      | `false`  | dump the log after every test                   |
//! | `startup_budget` | 5 s      | wait for the control socket                     |
//! | `stop_budget`    | 15 s     | graceful stop wait                              |
//! | `settle_budget`  | 60 s     | descriptor / process-count settle window        |
//! | `poll_interval`  | 100 ms   | every bounded polling loop                      |
//! | `join_budget`    | 15 s     | background process join                         |

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

/// Environment variable naming the build directory.
pub const BUILDDIR_ENV: &str = "UNIT_HARNESS_BUILDDIR";

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(derive(Debug, Clone))]
pub struct HarnessOptions {
    #[builder(into)]
    pub builddir: PathBuf,

    /// Verbose harness logging.
    #[serde(default)]
    #[builder(default)]
    pub detailed: bool,

    #[serde(default)]
    #[builder(default)]
    pub print_log: bool,

    #[serde(default)]
    #[builder(default)]
    pub save_log: bool,

    /// Allow cases that change host state.
    #[serde(default)]
    #[builder(default)]
    pub unsafe_tests: bool,

    /// Passed to `unitd --user`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub user: Option<String>,

    #[serde(default)]
    #[builder(default)]
    pub fds_threshold: usize,

    #[serde(default)]
    #[builder(default)]
    pub restart: bool,

    /// Parent of the per-instance temp dirs; the system temp dir if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub tmp_root: Option<PathBuf>,

    #[builder(default = Duration::from_secs(5))]
    pub startup_budget: Duration,

    #[builder(default = Duration::from_secs(15))]
    pub stop_budget: Duration,

    #[builder(default = Duration::from_secs(60))]
    pub settle_budget: Duration,

    #[builder(default = Duration::from_millis(100))]
    pub poll_interval: Duration,

    #[builder(default = Duration::from_secs(15))]
    pub join_budget: Duration,
}

impl HarnessOptions {
    /// Options for the build named by [`BUILDDIR_ENV`], if set.
    pub fn from_env() -> Option<Self> {
        let dir = std::env::var_os(BUILDDIR_ENV)?;
        Some(HarnessOptions::builder().builddir(dir).build())
    }

    pub fn validate(&self) -> HarnessResult<()> {
        let nonzero = [
            ("startup_budget", self.startup_budget),
            ("stop_budget", self.stop_budget),
            ("settle_budget", self.settle_budget),
            ("poll_interval", self.poll_interval),
            ("join_budget", self.join_budget),
        ];
        for (field, value) in nonzero {
            if value.is_zero() {
                return Err(HarnessError::InvalidConfig {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.poll_interval > self.settle_budget {
            return Err(HarnessError::InvalidConfig {
                field: "poll_interval",
                reason: format!("{:?} exceeds settle_budget", self.poll_interval),
            });
        }
        if self.builddir.as_os_str().is_empty() {
            return Err(HarnessError::InvalidConfig {
                field: "builddir",
                reason: "empty path".into(),
            });
        }
        Ok(())
    }

    pub fn paths(&self) -> UnitPaths {
        UnitPaths::new(&self.builddir)
    }

    /// Number of polls that fit in `budget`, at least one.
    pub fn attempts(&self, budget: Duration) -> u32 {
        let n = budget.as_millis() / self.poll_interval.as_millis().max(1);
        u32::try_from(n).unwrap_or(u32::MAX).max(1)
    }
}

/// Locations inside the build tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitPaths {
    pub builddir: PathBuf,
    pub unitd: PathBuf,
    pub modulesdir: PathBuf,
}

impl UnitPaths {
    pub fn new(builddir: &Path) -> Self {
        Self {
            builddir: builddir.to_path_buf(),
            unitd: builddir.join("sbin").join("unitd"),
            modulesdir: builddir.join("lib").join("unit").join("modules"),
        }
    }
}

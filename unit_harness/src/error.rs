// top-level error for the public API

use crate::session::report::TeardownReport;

#[derive(serde::Serialize, Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Process(#[from] crate::process::error::ProcessError),

    #[error(transparent)]
    Client(#[from] crate::ipc::error::ClientError),

    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// The server binary is missing from the build directory.
    #[error("could not find unitd at '{path}'")]
    UnitNotFound { path: std::path::PathBuf },

    /// The control socket never appeared; the run cannot continue.
    #[error("could not start unit: '{control}' did not appear within {budget:?}")]
    StartupTimeout {
        control: String,
        budget: std::time::Duration,
    },

    #[error("version probe of '{path}' failed: {reason}")]
    VersionProbe {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("unit is writing log too long: no '{pattern}' record")]
    LogTimeout { pattern: String },

    #[error("instance is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Control API answered without a `"success"` key.
    #[error("{operation} failed: {response}")]
    ControlRejected {
        operation: String,
        response: String,
    },

    #[error("invalid pattern: {0}")]
    Pattern(String),

    /// A test body's own check did not hold.
    #[error("{0}")]
    Assertion(String),

    /// Aggregated harness-level hygiene failures of one teardown.
    #[error("harness hygiene check failed:\n{0}")]
    Hygiene(TeardownReport),

    #[error("{operation} failed for '{path}'")]
    FileSystem {
        operation: &'static str,
        path: std::path::PathBuf,
        #[source]
        #[serde(serialize_with = "std_io_error_to_string")]
        source: std::io::Error,
    },
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    pub fn file_system(
        operation: &'static str,
        path: impl Into<std::path::PathBuf>,
        err: impl Into<std::io::Error>,
    ) -> Self {
        Self::FileSystem {
            operation,
            path: path.into(),
            source: err.into(),
        }
    }

    /// Errors that abort the whole run rather than the current test.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnitNotFound { .. }
                | Self::StartupTimeout { .. }
                | Self::VersionProbe { .. }
                | Self::LogTimeout { .. }
        )
    }
}

impl From<regex::Error> for HarnessError {
    fn from(e: regex::Error) -> Self {
        Self::Pattern(e.to_string())
    }
}

pub(crate) fn std_io_error_to_string<S>(e: &impl std::fmt::Display, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&e.to_string())
}

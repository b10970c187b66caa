#[derive(serde::Serialize, Debug, thiserror::Error)]
pub enum ProcessError {
    /// OS rejected a spawn, kill, wait or similar operation.
    #[error("failed to {action} process: {source}")]
    CommandFailed {
        action: &'static str,
        #[source]
        #[serde(serialize_with = "crate::error::std_io_error_to_string")]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// We tried an operation the current user is not allowed to perform.
    #[error("insufficient privilege to {action}: {source}")]
    PermissionDenied {
        action: &'static str,
        #[source]
        #[serde(serialize_with = "crate::error::std_io_error_to_string")]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("no process found for {query}")]
    NoSuchProcess { query: String },

    /// Graceful termination window expired; these PIDs remain alive.
    #[error("{operation} exceeded {elapsed:?}; PIDs still running: {leftovers:?}")]
    TerminationTimeout {
        operation: &'static str,
        elapsed: std::time::Duration,
        leftovers: Vec<u32>,
    },

    /// The process exited, but not cleanly.
    #[error("process {pid} exited with {status}")]
    UnexpectedExit { pid: u32, status: String },
}

pub type Result<T> = std::result::Result<T, ProcessError>;

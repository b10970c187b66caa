pub mod alerts;
pub mod records;
pub mod tailer;

/// File name the server writes its diagnostic stream to.
pub const LOG_FILE: &str = "unit.log";

const POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_WAIT_ATTEMPTS: u32 = 150;

//! Session layer: harness options, per-role descriptor baselines, the
//! teardown report, and the orchestrator that drives setup and teardown
//! around every test case.

pub mod baseline;
pub mod diagnostic;
pub mod driver;
pub mod options;
pub mod orchestrator;
pub mod report;

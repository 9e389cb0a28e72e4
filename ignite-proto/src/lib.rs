//! Failure-report protocol between a launching child and its supervisor.
//!
//! Between `fork` and `exec` the child cannot log, so any bootstrap failure
//! is written as one fixed-size [`LaunchFailure`] record to a close-on-exec
//! pipe. A successful `exec` closes the pipe, so the parent sees
//! end-of-stream with no data.

mod record;
mod stage;

pub use record::{DecodeError, LaunchFailure, RECORD_LEN, StatusReport, read_status};
pub use stage::LaunchStage;

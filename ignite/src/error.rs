//! Error types for parent-side launch operations and configuration.

use std::ffi::NulError;

use nix::errno::Errno;

/// Alias for `Result<T, ignite::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by ignite operations outside the child bootstrap.
///
/// The bootstrap itself never produces these: it reports through the
/// status pipe as a [`LaunchFailure`](ignite_proto::LaunchFailure).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A system call made by the supervisor failed.
    #[error("{op}: {errno}")]
    Sys {
        /// The operation that failed.
        op: &'static str,
        /// The error code it failed with.
        errno: Errno,
    },

    /// The launch request is inconsistent.
    #[error("invalid launch request: {0}")]
    InvalidRequest(String),

    /// A string argument contained an interior NUL byte.
    #[error("interior NUL byte in string argument")]
    Nul(#[from] NulError),

    /// A service description has a bad or missing setting.
    #[error("invalid service description: {0}")]
    Config(String),

    /// A service description is not valid JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An I/O error while reading a service description.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Returned in a forked child whose boundary only simulated `exec`.
    ///
    /// Never observed with the real OS, where the child either becomes the
    /// new image or exits after reporting.
    #[error("launch returned inside the forked child")]
    InChild,
}

impl Error {
    /// Builds a closure that wraps an errno from `op`.
    pub(crate) fn sys(op: &'static str) -> impl Fn(Errno) -> Self {
        move |errno| Self::Sys { op, errno }
    }
}

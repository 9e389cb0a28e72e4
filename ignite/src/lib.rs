//! Race-free child bootstrap for service supervisors.
//!
//! `ignite` turns a [`LaunchRequest`] into a running process: after `fork`
//! the child arranges descriptors, exports readiness, activation and
//! control-socket conventions, sets up stdio or the console, applies
//! resource limits, drops privileges and `exec`s. A failure at any step is
//! reported to the parent as one fixed-size record on a close-on-exec
//! status pipe, so the parent always learns either "started" or exactly
//! which stage failed and why.
//!
//! Every OS call goes through the [`Sys`] trait. [`Os`] is the real thing;
//! `FakeSys` (under `cfg(test)` or the `fake-sys` feature) is a
//! deterministic substitute.
//!
//! # Quick start
//!
//! ```no_run
//! use ignite::{LaunchRequest, Os, StatusReport};
//!
//! let mut os = Os::new();
//! let builder = LaunchRequest::builder(["/usr/sbin/sshd", "-D"])
//!     .log_target("/var/log/sshd.log");
//! let mut handle = ignite::spawn(&mut os, builder)?;
//! match handle.wait_outcome(&mut os)? {
//!     StatusReport::Started => println!("started pid {}", handle.pid()),
//!     other => eprintln!("launch failed: {other:?}"),
//! }
//! # Ok::<(), ignite::Error>(())
//! ```

mod config;
mod env;
mod error;
#[cfg(any(test, feature = "fake-sys"))]
mod fake;
mod fdops;
mod launch;
mod limits;
mod report;
mod request;
mod spawn;
mod sys;

pub use config::{ReadyNotification, RunAs, ServiceConfig};
pub use env::{ACTIVATION_FD, CONTROL_SOCKET_VAR, EnvAssignment, LISTEN_FDS, LISTEN_PID_VAR, load_env_file};
pub use error::{Error, Result};
#[cfg(any(test, feature = "fake-sys"))]
pub use fake::{Call, FakeSys, Op};
pub use fdops::{move_descriptor, relocate_reserved};
pub use ignite_proto::{DecodeError, LaunchFailure, LaunchStage, RECORD_LEN, StatusReport};
pub use launch::run_child;
pub use limits::{LimitParseError, ResourceLimit, Rlimit, UNLIMITED, apply as apply_limits, resource_by_name};
pub use report::{StatusReader, send_failure};
pub use request::{Argv, DEFAULT_LOG_TARGET, LaunchRequest, LaunchRequestBuilder};
pub use spawn::{LaunchHandle, spawn};
pub use sys::{Os, Sys};

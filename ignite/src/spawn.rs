//! Forking a launch and collecting its outcome in the parent.

use std::os::fd::RawFd;

use ignite_proto::StatusReport;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::launch;
use crate::report::StatusReader;
use crate::request::LaunchRequestBuilder;
use crate::sys::Sys;

/// Creates the status pipe, forks, and bootstraps the child.
///
/// The builder's status pipe is set to the new pipe's write end. In the
/// parent, returns a handle for collecting the outcome. With a real OS the
/// child never returns from here; a substitute boundary that simulates the
/// child side gets [`Error::InChild`].
pub fn spawn<S: Sys + ?Sized>(sys: &mut S, builder: LaunchRequestBuilder) -> Result<LaunchHandle> {
    let (read_fd, write_fd) = sys.pipe().map_err(Error::sys("pipe"))?;

    let req = match builder.status_pipe(write_fd).build() {
        Ok(req) => req,
        Err(e) => {
            let _ = sys.close(read_fd);
            let _ = sys.close(write_fd);
            return Err(e);
        }
    };
    let program = req.argv().program().to_string_lossy().into_owned();

    match sys.fork() {
        Ok(ForkResult::Child) => {
            let _ = sys.close(read_fd);
            let _ = launch::run_child(sys, req);
            Err(Error::InChild)
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = sys.close(write_fd);
            info!(pid = child.as_raw(), %program, "launched service process");
            Ok(LaunchHandle {
                pid: child,
                status_fd: Some(read_fd),
                reader: StatusReader::new(),
                outcome: None,
            })
        }
        Err(errno) => {
            let _ = sys.close(read_fd);
            let _ = sys.close(write_fd);
            Err(Error::Sys { op: "fork", errno })
        }
    }
}

/// A launched process whose bootstrap outcome may still be pending.
///
/// The status pipe's read end is closed once the outcome is known.
#[derive(Debug)]
pub struct LaunchHandle {
    pid: Pid,
    status_fd: Option<RawFd>,
    reader: StatusReader,
    outcome: Option<StatusReport>,
}

impl LaunchHandle {
    /// Pid of the launched process.
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Read end of the status pipe, while the outcome is still pending.
    pub const fn status_fd(&self) -> Option<RawFd> {
        self.status_fd
    }

    /// Collects whatever the status pipe has to offer without waiting.
    ///
    /// Returns `Ok(None)` if the pipe would block before end-of-stream.
    pub fn poll_outcome<S: Sys + ?Sized>(&mut self, sys: &mut S) -> Result<Option<StatusReport>> {
        let Some(fd) = self.status_fd else {
            return Ok(self.outcome);
        };
        let Some(report) = self.reader.poll(sys, fd).map_err(Error::sys("read status pipe"))?
        else {
            return Ok(None);
        };

        let _ = sys.close(fd);
        self.status_fd = None;
        self.outcome = Some(report);

        match report {
            StatusReport::Started => debug!(pid = self.pid.as_raw(), "process image replaced"),
            StatusReport::Failed(failure) => {
                warn!(pid = self.pid.as_raw(), stage = ?failure.stage, "{failure}");
            }
            StatusReport::Garbled { len } => {
                warn!(pid = self.pid.as_raw(), len, "malformed launch status; treating as failed");
            }
            _ => warn!(pid = self.pid.as_raw(), ?report, "unrecognised launch status"),
        }
        Ok(Some(report))
    }

    /// Reads the status pipe until the outcome is known.
    ///
    /// The pipe must be in blocking mode; `EAGAIN` is returned as an error.
    pub fn wait_outcome<S: Sys + ?Sized>(&mut self, sys: &mut S) -> Result<StatusReport> {
        self.poll_outcome(sys)?.ok_or(Error::Sys {
            op: "read status pipe",
            errno: Errno::EAGAIN,
        })
    }

    /// Sends `signal` to the launched process.
    pub fn signal<S: Sys + ?Sized>(&self, sys: &mut S, signal: Signal) -> Result<()> {
        debug!(pid = self.pid.as_raw(), %signal, "signalling service process");
        sys.kill(self.pid, signal).map_err(Error::sys("kill"))
    }
}

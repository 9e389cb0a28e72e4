//! Launch requests and their builder.

use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::os::raw::c_char;

use nix::unistd::{Gid, Uid};

use crate::env::{ACTIVATION_FD, CONTROL_SOCKET_VAR, EnvAssignment, LISTEN_PID_VAR};
use crate::error::{Error, Result};
use crate::limits::ResourceLimit;

/// Default destination for stdout/stderr of a detached process.
pub const DEFAULT_LOG_TARGET: &str = "/dev/null";

/// A NULL-terminated argument vector ready for `execvp`.
#[derive(Debug)]
pub struct Argv {
    owned: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl Argv {
    /// Converts `args`. Fails if empty or if any argument contains NUL.
    pub fn new<I, A>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        let owned: Vec<CString> = args
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<_, _>>()?;
        if owned.is_empty() {
            return Err(Error::InvalidRequest("empty argument vector".into()));
        }
        let mut ptrs: Vec<*const c_char> = owned.iter().map(|c| c.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Ok(Self { owned, ptrs })
    }

    /// The program name or path (`argv[0]`).
    pub fn program(&self) -> &CStr {
        &self.owned[0]
    }

    /// Pointer to the NULL-terminated pointer array.
    pub const fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }

    /// Iterates over the arguments.
    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.owned.iter().map(CString::as_c_str)
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.owned.len()
    }

    /// Always `false`: construction rejects empty vectors.
    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }
}

/// Everything the child needs to bootstrap one process.
///
/// Built with [`LaunchRequest::builder`]. All buffers the child writes into
/// are allocated by [`LaunchRequestBuilder::build`], before fork.
#[derive(Debug)]
pub struct LaunchRequest {
    pub(crate) argv: Argv,
    pub(crate) working_dir: Option<CString>,
    pub(crate) log_target: CString,
    pub(crate) on_console: bool,
    pub(crate) in_foreground: bool,
    pub(crate) status_pipe_fd: RawFd,
    pub(crate) control_socket_fd: Option<RawFd>,
    pub(crate) notify_fd: Option<RawFd>,
    pub(crate) notify_var: Option<EnvAssignment>,
    pub(crate) pinned_notify_fd: Option<RawFd>,
    pub(crate) activation_socket_fd: Option<RawFd>,
    pub(crate) env_file: Option<CString>,
    pub(crate) uid: Option<Uid>,
    pub(crate) gid: Option<Gid>,
    pub(crate) rlimits: Vec<ResourceLimit>,
    pub(crate) listen_pid_var: Option<EnvAssignment>,
    pub(crate) control_var: Option<EnvAssignment>,
}

impl LaunchRequest {
    /// Starts a request for `argv` (`argv[0]` is the program).
    pub fn builder<I, A>(argv: I) -> LaunchRequestBuilder
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        LaunchRequestBuilder {
            argv: argv.into_iter().map(Into::into).collect(),
            ..LaunchRequestBuilder::default()
        }
    }

    /// The argument vector.
    pub const fn argv(&self) -> &Argv {
        &self.argv
    }

    /// Descriptor of the status pipe write end.
    pub const fn status_pipe_fd(&self) -> RawFd {
        self.status_pipe_fd
    }

    /// Whether the process runs attached to the console.
    pub const fn on_console(&self) -> bool {
        self.on_console
    }
}

/// Builder for [`LaunchRequest`].
///
/// Defaults: detached, output to `/dev/null`, identity and limits unchanged.
#[derive(Debug, Clone, Default)]
#[must_use = "a LaunchRequestBuilder does nothing until .build() is called"]
pub struct LaunchRequestBuilder {
    argv: Vec<String>,
    working_dir: Option<String>,
    log_target: Option<String>,
    on_console: bool,
    in_foreground: bool,
    status_pipe_fd: Option<RawFd>,
    control_socket_fd: Option<RawFd>,
    notify_fd: Option<RawFd>,
    notify_var: Option<String>,
    pinned_notify_fd: Option<RawFd>,
    activation_socket_fd: Option<RawFd>,
    env_file: Option<String>,
    uid: Option<Uid>,
    gid: Option<Gid>,
    rlimits: Vec<ResourceLimit>,
}

impl LaunchRequestBuilder {
    /// Directory to change into. Empty means inherit.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Path stdout/stderr are appended to when detached. Empty means `/dev/null`.
    pub fn log_target(mut self, path: impl Into<String>) -> Self {
        self.log_target = Some(path.into());
        self
    }

    /// Runs the process as a job on the controlling terminal.
    pub const fn on_console(mut self, on: bool) -> Self {
        self.on_console = on;
        self
    }

    /// Claims the terminal's foreground process group (console mode only).
    pub const fn in_foreground(mut self, on: bool) -> Self {
        self.in_foreground = on;
        self
    }

    /// Write end of the status pipe. Required.
    pub const fn status_pipe(mut self, fd: RawFd) -> Self {
        self.status_pipe_fd = Some(fd);
        self
    }

    /// Control-socket descriptor to pass to the process.
    pub const fn control_socket(mut self, fd: RawFd) -> Self {
        self.control_socket_fd = Some(fd);
        self
    }

    /// Descriptor the process writes its readiness notification to.
    pub const fn notify_fd(mut self, fd: RawFd) -> Self {
        self.notify_fd = Some(fd);
        self
    }

    /// Environment variable that receives the notification descriptor number.
    pub fn notify_var(mut self, name: impl Into<String>) -> Self {
        self.notify_var = Some(name.into());
        self
    }

    /// Places the notification descriptor on exactly this number.
    pub const fn pinned_notify_fd(mut self, fd: RawFd) -> Self {
        self.pinned_notify_fd = Some(fd);
        self
    }

    /// Listening socket to hand over on the activation slot.
    pub const fn activation_socket(mut self, fd: RawFd) -> Self {
        self.activation_socket_fd = Some(fd);
        self
    }

    /// File of `NAME=value` lines to load into the environment.
    pub fn env_file(mut self, path: impl Into<String>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Target user.
    pub const fn uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Target group.
    pub const fn gid(mut self, gid: Gid) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Adds a resource limit. Limits apply in the order added.
    pub fn rlimit(mut self, limit: ResourceLimit) -> Self {
        self.rlimits.push(limit);
        self
    }

    /// Validates the request and allocates every child-side buffer.
    pub fn build(self) -> Result<LaunchRequest> {
        let invalid = |msg: &str| Err(Error::InvalidRequest(msg.to_owned()));

        let Some(status_pipe_fd) = self.status_pipe_fd else {
            return invalid("no status pipe");
        };
        if self.pinned_notify_fd.is_some() && self.notify_fd.is_none() {
            return invalid("pinned notification slot without a notification descriptor");
        }
        if self.notify_var.is_some() && self.notify_fd.is_none() {
            return invalid("notification variable without a notification descriptor");
        }
        if self.activation_socket_fd.is_some() && self.pinned_notify_fd == Some(ACTIVATION_FD) {
            return invalid("pinned notification slot collides with the activation socket slot");
        }
        let fds = [
            Some(status_pipe_fd),
            self.control_socket_fd,
            self.notify_fd,
            self.pinned_notify_fd,
            self.activation_socket_fd,
        ];
        if fds.into_iter().flatten().any(|fd| fd < 0) {
            return invalid("negative descriptor number");
        }

        let working_dir = match self.working_dir {
            Some(dir) if !dir.is_empty() => Some(CString::new(dir)?),
            _ => None,
        };
        let log_target = match self.log_target {
            Some(path) if !path.is_empty() => CString::new(path)?,
            _ => CString::new(DEFAULT_LOG_TARGET)?,
        };
        let env_file = self.env_file.map(CString::new).transpose()?;
        let notify_var = match self.notify_var {
            Some(name) if !name.is_empty() => Some(EnvAssignment::reserve(&name)?),
            _ => None,
        };
        let listen_pid_var = self
            .activation_socket_fd
            .map(|_| EnvAssignment::reserve(LISTEN_PID_VAR))
            .transpose()?;
        let control_var = self
            .control_socket_fd
            .map(|_| EnvAssignment::reserve(CONTROL_SOCKET_VAR))
            .transpose()?;

        Ok(LaunchRequest {
            argv: Argv::new(self.argv)?,
            working_dir,
            log_target,
            on_console: self.on_console,
            in_foreground: self.in_foreground,
            status_pipe_fd,
            control_socket_fd: self.control_socket_fd,
            notify_fd: self.notify_fd,
            notify_var,
            pinned_notify_fd: self.pinned_notify_fd,
            activation_socket_fd: self.activation_socket_fd,
            env_file,
            uid: self.uid,
            gid: self.gid,
            rlimits: self.rlimits,
            listen_pid_var,
            control_var,
        })
    }
}

//! Service descriptions loaded from JSON.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::{fmt, fs};

use nix::unistd::{Gid, Uid, User};
use serde::{Deserialize, Serialize};

use crate::env::ACTIVATION_FD;
use crate::error::{Error, Result};
use crate::limits::{ResourceLimit, resource_by_name};
use crate::request::{LaunchRequest, LaunchRequestBuilder};

/// How a service signals readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadyNotification {
    /// Write to a pipe placed on exactly this descriptor number (`pipefd:N`).
    PipeFd(RawFd),
    /// Write to a pipe whose number is exported in this variable (`pipevar:NAME`).
    PipeVar(String),
}

impl ReadyNotification {
    /// Parses `pipefd:N` or `pipevar:NAME`.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(n) = s.strip_prefix("pipefd:") {
            return n
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .map(Self::PipeFd)
                .ok_or_else(|| Error::Config(format!("bad notification descriptor '{n}'")));
        }
        if let Some(name) = s.strip_prefix("pipevar:") {
            if name.is_empty() || name.contains(['=', '\0']) {
                return Err(Error::Config(format!("bad notification variable '{name}'")));
            }
            return Ok(Self::PipeVar(name.to_owned()));
        }
        Err(Error::Config(format!("unknown ready_notification '{s}'")))
    }
}

impl fmt::Display for ReadyNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PipeFd(fd) => write!(f, "pipefd:{fd}"),
            Self::PipeVar(name) => write!(f, "pipevar:{name}"),
        }
    }
}

/// Target identity resolved from `run_as`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct RunAs {
    /// User to switch to.
    pub uid: Uid,
    /// Group to switch to; `None` leaves the group unchanged.
    pub gid: Option<Gid>,
}

impl RunAs {
    /// Parses `uid`, `uid:gid`, or a user name.
    ///
    /// A name, or a bare uid with a password entry, also selects that
    /// user's primary group.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::Config(format!("bad run_as '{s}'"));
        if let Some((user, group)) = s.split_once(':') {
            return Ok(Self {
                uid: Uid::from_raw(user.parse().map_err(|_| bad())?),
                gid: Some(Gid::from_raw(group.parse().map_err(|_| bad())?)),
            });
        }
        if let Ok(raw) = s.parse() {
            let uid = Uid::from_raw(raw);
            let gid = User::from_uid(uid).ok().flatten().map(|u| u.gid);
            return Ok(Self { uid, gid });
        }
        match User::from_name(s) {
            Ok(Some(user)) => Ok(Self {
                uid: user.uid,
                gid: Some(user.gid),
            }),
            Ok(None) => Err(Error::Config(format!("no such user '{s}'"))),
            Err(errno) => Err(Error::Sys {
                op: "getpwnam",
                errno,
            }),
        }
    }
}

/// A service description.
///
/// ```json
/// {
///   "command": ["/usr/sbin/sshd", "-D"],
///   "logfile": "/var/log/sshd.log",
///   "ready_notification": "pipevar:READY_FD",
///   "rlimits": { "nofile": "1024:4096" }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct ServiceConfig {
    /// Program and arguments.
    pub command: Vec<String>,
    /// Directory to run in.
    pub working_dir: Option<String>,
    /// Destination for stdout/stderr when detached. Empty means `/dev/null`.
    pub logfile: Option<String>,
    /// File of `NAME=value` lines added to the environment.
    pub env_file: Option<String>,
    /// Run as a job on the console instead of detached.
    pub starts_on_console: bool,
    /// Take the terminal's foreground process group (console only).
    pub in_foreground: bool,
    /// Hand the service a control-socket connection.
    pub pass_control_socket: bool,
    /// Unix socket path to listen on and pass as the activation socket.
    pub socket_listen: Option<PathBuf>,
    /// Readiness convention: `pipefd:N` or `pipevar:NAME`.
    pub ready_notification: Option<String>,
    /// `uid`, `uid:gid`, or a user name.
    pub run_as: Option<String>,
    /// Resource name to limit string, e.g. `"nofile": "1024:4096"`.
    pub rlimits: BTreeMap<String, String>,
}

impl ServiceConfig {
    /// Reads and validates a description from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Parses and validates a description.
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every setting that can be checked without launching.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::Config("empty command".into()));
        }
        if self.in_foreground && !self.starts_on_console {
            return Err(Error::Config(
                "in_foreground requires starts_on_console".into(),
            ));
        }
        let notification = self.notification()?;
        if self.socket_listen.is_some()
            && notification == Some(ReadyNotification::PipeFd(ACTIVATION_FD))
        {
            return Err(Error::Config(format!(
                "pipefd:{ACTIVATION_FD} is reserved for the activation socket"
            )));
        }
        self.resource_limits()?;
        Ok(())
    }

    /// The readiness convention, if any.
    pub fn notification(&self) -> Result<Option<ReadyNotification>> {
        self.ready_notification
            .as_deref()
            .map(ReadyNotification::parse)
            .transpose()
    }

    /// Configured limits, in resource-name order.
    pub fn resource_limits(&self) -> Result<Vec<ResourceLimit>> {
        self.rlimits
            .iter()
            .map(|(name, value)| {
                let resource = resource_by_name(name)
                    .ok_or_else(|| Error::Config(format!("unknown resource '{name}'")))?;
                ResourceLimit::parse(resource, value)
                    .map_err(|e| Error::Config(format!("rlimits.{name}: {e}")))
            })
            .collect()
    }

    /// Resolves `run_as`.
    pub fn identity(&self) -> Result<Option<RunAs>> {
        self.run_as.as_deref().map(RunAs::parse).transpose()
    }

    /// A builder with every setting that does not need a live descriptor.
    ///
    /// The caller supplies the notification pipe, activation socket and
    /// control socket, which only exist at launch time.
    pub fn to_builder(&self) -> Result<LaunchRequestBuilder> {
        let mut builder = LaunchRequest::builder(self.command.iter().cloned())
            .on_console(self.starts_on_console)
            .in_foreground(self.in_foreground);
        if let Some(dir) = &self.working_dir {
            builder = builder.working_dir(dir.as_str());
        }
        if let Some(log) = &self.logfile {
            builder = builder.log_target(log.as_str());
        }
        if let Some(path) = &self.env_file {
            builder = builder.env_file(path.as_str());
        }
        match self.notification()? {
            Some(ReadyNotification::PipeFd(fd)) => builder = builder.pinned_notify_fd(fd),
            Some(ReadyNotification::PipeVar(name)) => builder = builder.notify_var(name),
            None => {}
        }
        if let Some(run_as) = self.identity()? {
            builder = builder.uid(run_as.uid);
            if let Some(gid) = run_as.gid {
                builder = builder.gid(gid);
            }
        }
        for limit in self.resource_limits()? {
            builder = builder.rlimit(limit);
        }
        Ok(builder)
    }
}

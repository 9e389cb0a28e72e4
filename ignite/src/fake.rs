//! Deterministic in-memory [`Sys`] for tests.
//!
//! Models a descriptor table with lowest-free-slot allocation, per-descriptor
//! queued read results, captured writes, a path table for `open`, injected
//! failures per operation, and the process state the launch core touches
//! (environment, cwd, limits, identity, session, signal mask). Every call is
//! appended to an ordered log.
//!
//! Closing a descriptor that is not open panics: a double close is always a
//! programming error.

#![allow(clippy::panic, clippy::missing_panics_doc)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ffi::CStr;
use std::io::IoSlice;
use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::resource::Resource;
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{ForkResult, Gid, Pid, Uid};

use crate::limits::{Rlimit, UNLIMITED};
use crate::request::Argv;
use crate::sys::Sys;

/// Operations that can be made to fail with [`FakeSys::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Op {
    /// [`Sys::dup2`].
    Dup2,
    /// [`Sys::dup_min`].
    DupMin,
    /// [`Sys::open`].
    Open,
    /// [`Sys::pipe`].
    Pipe,
    /// [`Sys::fork`].
    Fork,
    /// [`Sys::kill`].
    Kill,
    /// [`Sys::chdir`].
    Chdir,
    /// [`Sys::putenv`].
    Putenv,
    /// [`Sys::setsid`].
    Setsid,
    /// [`Sys::getrlimit`].
    Getrlimit,
    /// [`Sys::setrlimit`].
    Setrlimit,
    /// [`Sys::setregid`].
    Setregid,
    /// [`Sys::setreuid`].
    Setreuid,
    /// [`Sys::execvp`].
    Execvp,
}

/// One recorded boundary call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Call {
    /// `dup2(fd, dest)`.
    Dup2(RawFd, RawFd),
    /// `fcntl(F_DUPFD*)` returning the new descriptor.
    DupMin {
        /// Source descriptor.
        fd: RawFd,
        /// Lowest acceptable slot.
        min: RawFd,
        /// Whether close-on-exec was requested.
        cloexec: bool,
        /// Slot chosen.
        new_fd: RawFd,
    },
    /// `close(fd)`.
    Close(RawFd),
    /// `open(path)` returning a descriptor.
    Open(String, RawFd),
    /// `chdir(path)`.
    Chdir(String),
    /// `putenv(entry)`.
    Putenv(String),
    /// `setsid()`.
    Setsid,
    /// `setpgid(pid, pgid)`.
    Setpgid(Pid, Pid),
    /// `ioctl(fd, TIOCSCTTY)`.
    SetControllingTerminal(RawFd),
    /// `tcsetpgrp(fd, pgrp)`.
    Tcsetpgrp(RawFd, Pid),
    /// `signal(sig, SIG_IGN)`.
    IgnoreSignal(Signal),
    /// `sigprocmask(SIG_SETMASK, ..)`.
    SetSigmask,
    /// `getrlimit(resource)`.
    Getrlimit(Resource),
    /// `setrlimit(resource, limit)`.
    Setrlimit(Resource, Rlimit),
    /// `setregid(gid, gid)`.
    Setregid(Gid),
    /// `setreuid(uid, uid)`.
    Setreuid(Uid),
    /// `execvp(argv)`.
    Execvp(Vec<String>),
    /// `_exit(status)`.
    Exit(i32),
    /// `fork()`.
    Fork,
    /// `kill(pid, sig)`.
    Kill(Pid, Signal),
}

/// A queued result for one `read` call.
#[derive(Debug)]
enum ReadResult {
    /// Deliver (up to the requested length of) these bytes.
    Data(Vec<u8>),
    /// Fail with this errno.
    Error(Errno),
}

/// Read results queued for one descriptor number.
#[derive(Debug, Default)]
struct ReadQueue {
    results: VecDeque<ReadResult>,
    /// When empty, report `EAGAIN` instead of end-of-stream.
    blocking: bool,
}

/// Flags of an open descriptor.
#[derive(Debug, Clone, Copy)]
struct OpenFd {
    cloexec: bool,
}

/// Deterministic substitute for the OS.
#[derive(Debug)]
pub struct FakeSys {
    fds: BTreeMap<RawFd, OpenFd>,
    reads: HashMap<RawFd, ReadQueue>,
    written: HashMap<RawFd, Vec<u8>>,
    write_limits: HashMap<RawFd, usize>,
    files: HashMap<String, Vec<u8>>,
    failures: HashMap<Op, VecDeque<Errno>>,
    calls: Vec<Call>,
    env: BTreeMap<String, String>,
    cwd: Option<String>,
    limits: HashMap<Resource, Rlimit>,
    uid: Uid,
    gid: Gid,
    pid: Pid,
    pgrp: Pid,
    sid: Pid,
    terminal_session: Option<Pid>,
    foreground: Option<Pid>,
    sigmask: SigSet,
    last_forked_pid: i32,
    fork_as_child: bool,
    exec: Option<Vec<String>>,
    exit_status: Option<i32>,
}

impl Default for FakeSys {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSys {
    /// A process with stdin/stdout/stderr open, running as root in session 50.
    pub fn new() -> Self {
        let mut files = HashMap::new();
        files.insert("/dev/null".to_owned(), Vec::new());
        let mut limits = HashMap::new();
        limits.insert(
            Resource::RLIMIT_NOFILE,
            Rlimit {
                soft: 1024,
                hard: 4096,
            },
        );
        Self {
            fds: (0..3).map(|fd| (fd, OpenFd { cloexec: false })).collect(),
            reads: HashMap::new(),
            written: HashMap::new(),
            write_limits: HashMap::new(),
            files,
            failures: HashMap::new(),
            calls: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            limits,
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            pid: Pid::from_raw(100),
            pgrp: Pid::from_raw(50),
            sid: Pid::from_raw(50),
            terminal_session: Some(Pid::from_raw(50)),
            foreground: None,
            sigmask: SigSet::empty(),
            last_forked_pid: 1,
            fork_as_child: false,
            exec: None,
            exit_status: None,
        }
    }

    // --- Setup helpers -------------------------------------------------

    /// Opens the lowest free descriptor (inheritable) and returns it.
    pub fn alloc_fd(&mut self) -> RawFd {
        self.alloc_from(0, false)
    }

    /// Opens exactly `fd`, which must be free.
    pub fn open_at(&mut self, fd: RawFd) {
        assert!(!self.is_open(fd), "fd {fd} already open");
        self.fds.insert(fd, OpenFd { cloexec: false });
    }

    /// Queues `data` to be returned by reads of `fd`.
    pub fn supply_read_data(&mut self, fd: RawFd, data: impl Into<Vec<u8>>) {
        self.reads
            .entry(fd)
            .or_default()
            .results
            .push_back(ReadResult::Data(data.into()));
    }

    /// Queues a failing read on `fd`.
    pub fn supply_read_error(&mut self, fd: RawFd, errno: Errno) {
        self.reads
            .entry(fd)
            .or_default()
            .results
            .push_back(ReadResult::Error(errno));
    }

    /// Makes reads of `fd` with nothing queued fail with `EAGAIN`.
    pub fn set_blocking(&mut self, fd: RawFd) {
        self.reads.entry(fd).or_default().blocking = true;
    }

    /// Caps the number of bytes each write to `fd` accepts.
    pub fn limit_writes(&mut self, fd: RawFd, max: usize) {
        self.write_limits.insert(fd, max);
    }

    /// Registers a readable file for `open`.
    pub fn add_file(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.to_owned(), contents.into());
    }

    /// Makes the next call of `op` fail with `errno`.
    pub fn fail_next(&mut self, op: Op, errno: Errno) {
        self.failures.entry(op).or_default().push_back(errno);
    }

    /// Sets the current soft/hard pair for `resource`.
    pub fn set_rlimit(&mut self, resource: Resource, limit: Rlimit) {
        self.limits.insert(resource, limit);
    }

    /// Sets the session owning the terminal on fd 0 (`None`: no session).
    pub fn set_terminal_session(&mut self, sid: Option<Pid>) {
        self.terminal_session = sid;
    }

    /// Makes the next `fork` return the child side.
    pub fn fork_into_child(&mut self) {
        self.fork_as_child = true;
    }

    // --- Inspection ----------------------------------------------------

    /// Returns `true` if `fd` is open.
    pub fn is_open(&self, fd: RawFd) -> bool {
        self.fds.contains_key(&fd)
    }

    /// Returns `true` if `fd` is open with close-on-exec set.
    pub fn is_cloexec(&self, fd: RawFd) -> bool {
        self.fds.get(&fd).is_some_and(|f| f.cloexec)
    }

    /// All open descriptors, ascending.
    pub fn open_fds(&self) -> Vec<RawFd> {
        self.fds.keys().copied().collect()
    }

    /// Everything ever written to descriptor number `fd`.
    pub fn written(&self, fd: RawFd) -> &[u8] {
        self.written.get(&fd).map_or(&[], Vec::as_slice)
    }

    /// Removes and returns everything written to `fd`.
    pub fn take_written(&mut self, fd: RawFd) -> Vec<u8> {
        self.written.remove(&fd).unwrap_or_default()
    }

    /// The ordered call log.
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Position of the first logged call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.iter().position(pred)
    }

    /// Value of an environment variable set through `putenv`.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// Directory entered through `chdir`, if any.
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Current limits for `resource`.
    pub fn rlimit(&self, resource: Resource) -> Rlimit {
        self.limits.get(&resource).copied().unwrap_or(Rlimit {
            soft: UNLIMITED,
            hard: UNLIMITED,
        })
    }

    /// Current user and group.
    pub const fn identity(&self) -> (Uid, Gid) {
        (self.uid, self.gid)
    }

    /// Current session and process group.
    pub const fn session(&self) -> (Pid, Pid) {
        (self.sid, self.pgrp)
    }

    /// Foreground process group set through `tcsetpgrp`.
    pub const fn foreground(&self) -> Option<Pid> {
        self.foreground
    }

    /// Current signal mask.
    pub const fn sigmask(&self) -> &SigSet {
        &self.sigmask
    }

    /// Argument vector of a simulated successful exec.
    pub fn exec_argv(&self) -> Option<&[String]> {
        self.exec.as_deref()
    }

    /// Status passed to `exit_immediately`.
    pub const fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Pid returned by the most recent parent-side `fork`.
    pub const fn last_forked_pid(&self) -> i32 {
        self.last_forked_pid
    }

    // --- Internals -----------------------------------------------------

    fn injected(&mut self, op: Op) -> nix::Result<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn alloc_from(&mut self, min: RawFd, cloexec: bool) -> RawFd {
        let fd = (min..)
            .find(|fd| !self.fds.contains_key(fd))
            .unwrap_or_else(|| panic!("descriptor table exhausted"));
        self.fds.insert(fd, OpenFd { cloexec });
        fd
    }

    fn check_open(&self, fd: RawFd) -> nix::Result<()> {
        if self.is_open(fd) {
            Ok(())
        } else {
            Err(Errno::EBADF)
        }
    }
}

impl Sys for FakeSys {
    fn dup2(&mut self, fd: RawFd, dest: RawFd) -> nix::Result<RawFd> {
        self.injected(Op::Dup2)?;
        self.check_open(fd)?;
        self.calls.push(Call::Dup2(fd, dest));
        if fd != dest {
            self.fds.insert(dest, OpenFd { cloexec: false });
        }
        Ok(dest)
    }

    fn dup_min(&mut self, fd: RawFd, min: RawFd, cloexec: bool) -> nix::Result<RawFd> {
        self.injected(Op::DupMin)?;
        self.check_open(fd)?;
        let new_fd = self.alloc_from(min, cloexec);
        self.calls.push(Call::DupMin {
            fd,
            min,
            cloexec,
            new_fd,
        });
        Ok(new_fd)
    }

    fn close(&mut self, fd: RawFd) -> nix::Result<()> {
        if self.fds.remove(&fd).is_none() {
            panic!("close of descriptor {fd}, which is not open");
        }
        self.calls.push(Call::Close(fd));
        Ok(())
    }

    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
        self.check_open(fd)?;
        let queue = self.reads.entry(fd).or_default();
        let Some(front) = queue.results.front_mut() else {
            return if queue.blocking {
                Err(Errno::EAGAIN)
            } else {
                Ok(0)
            };
        };
        match front {
            ReadResult::Error(errno) => {
                let err = *errno;
                queue.results.pop_front();
                Err(err)
            }
            ReadResult::Data(data) if data.len() <= buf.len() => {
                let n = data.len();
                buf[..n].copy_from_slice(data);
                queue.results.pop_front();
                Ok(n)
            }
            ReadResult::Data(data) => {
                let n = buf.len();
                buf.copy_from_slice(&data[..n]);
                data.drain(..n);
                Ok(n)
            }
        }
    }

    fn write(&mut self, fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
        self.check_open(fd)?;
        let n = self
            .write_limits
            .get(&fd)
            .map_or(buf.len(), |&max| buf.len().min(max));
        self.written.entry(fd).or_default().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn writev(&mut self, fd: RawFd, bufs: &[IoSlice<'_>]) -> nix::Result<usize> {
        self.check_open(fd)?;
        // The write limit caps the whole call, as a short writev would.
        let mut budget = self.write_limits.get(&fd).copied().unwrap_or(usize::MAX);
        let out = self.written.entry(fd).or_default();
        let mut total = 0;
        for buf in bufs {
            let n = buf.len().min(budget);
            out.extend_from_slice(&buf[..n]);
            total += n;
            budget -= n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    fn open(&mut self, path: &CStr, flags: OFlag, _mode: Mode) -> nix::Result<RawFd> {
        self.injected(Op::Open)?;
        let name = path.to_string_lossy().into_owned();
        let writing = flags.intersects(OFlag::O_WRONLY | OFlag::O_RDWR | OFlag::O_CREAT);
        let contents = match self.files.get(&name) {
            Some(contents) => Some(contents.clone()),
            None if writing => None,
            None => return Err(Errno::ENOENT),
        };
        let fd = self.alloc_from(0, flags.contains(OFlag::O_CLOEXEC));
        if let Some(contents) = contents.filter(|c| !c.is_empty()) {
            self.supply_read_data(fd, contents);
        }
        self.calls.push(Call::Open(name, fd));
        Ok(fd)
    }

    fn pipe(&mut self) -> nix::Result<(RawFd, RawFd)> {
        self.injected(Op::Pipe)?;
        let read_fd = self.alloc_from(0, true);
        let write_fd = self.alloc_from(0, true);
        Ok((read_fd, write_fd))
    }

    fn fork(&mut self) -> nix::Result<ForkResult> {
        self.injected(Op::Fork)?;
        self.calls.push(Call::Fork);
        if std::mem::take(&mut self.fork_as_child) {
            return Ok(ForkResult::Child);
        }
        self.last_forked_pid += 1;
        Ok(ForkResult::Parent {
            child: Pid::from_raw(self.last_forked_pid),
        })
    }

    fn kill(&mut self, pid: Pid, signal: Signal) -> nix::Result<()> {
        self.injected(Op::Kill)?;
        self.calls.push(Call::Kill(pid, signal));
        Ok(())
    }

    fn getpid(&mut self) -> Pid {
        self.pid
    }

    fn getpgrp(&mut self) -> Pid {
        self.pgrp
    }

    fn chdir(&mut self, path: &CStr) -> nix::Result<()> {
        let dir = path.to_string_lossy().into_owned();
        self.calls.push(Call::Chdir(dir.clone()));
        self.injected(Op::Chdir)?;
        self.cwd = Some(dir);
        Ok(())
    }

    fn putenv(&mut self, entry: &'static CStr) -> nix::Result<()> {
        self.injected(Op::Putenv)?;
        let text = entry.to_string_lossy().into_owned();
        let Some((name, value)) = text.split_once('=') else {
            return Err(Errno::EINVAL);
        };
        self.env.insert(name.to_owned(), value.to_owned());
        self.calls.push(Call::Putenv(text));
        Ok(())
    }

    fn setsid(&mut self) -> nix::Result<Pid> {
        self.injected(Op::Setsid)?;
        if self.pgrp == self.pid {
            return Err(Errno::EPERM);
        }
        self.calls.push(Call::Setsid);
        self.sid = self.pid;
        self.pgrp = self.pid;
        Ok(self.pid)
    }

    fn setpgid(&mut self, pid: Pid, pgid: Pid) -> nix::Result<()> {
        self.calls.push(Call::Setpgid(pid, pgid));
        self.pgrp = if pgid.as_raw() == 0 { self.pid } else { pgid };
        Ok(())
    }

    fn tcgetsid(&mut self, fd: RawFd) -> nix::Result<Pid> {
        self.check_open(fd)?;
        self.terminal_session.ok_or(Errno::ENOTTY)
    }

    fn tcsetpgrp(&mut self, fd: RawFd, pgrp: Pid) -> nix::Result<()> {
        self.check_open(fd)?;
        self.calls.push(Call::Tcsetpgrp(fd, pgrp));
        self.foreground = Some(pgrp);
        Ok(())
    }

    fn set_controlling_terminal(&mut self, fd: RawFd) -> nix::Result<()> {
        self.check_open(fd)?;
        self.calls.push(Call::SetControllingTerminal(fd));
        self.terminal_session = Some(self.sid);
        Ok(())
    }

    fn ignore_signal(&mut self, signal: Signal) -> nix::Result<()> {
        self.calls.push(Call::IgnoreSignal(signal));
        Ok(())
    }

    fn sigprocmask(&mut self, how: SigmaskHow, set: &SigSet) -> nix::Result<SigSet> {
        let old = self.sigmask;
        match how {
            SigmaskHow::SIG_BLOCK => {
                for sig in Signal::iterator().filter(|s| set.contains(*s)) {
                    self.sigmask.add(sig);
                }
            }
            SigmaskHow::SIG_UNBLOCK => {
                for sig in Signal::iterator().filter(|s| set.contains(*s)) {
                    self.sigmask.remove(sig);
                }
            }
            _ => {
                self.sigmask = *set;
                self.calls.push(Call::SetSigmask);
            }
        }
        Ok(old)
    }

    fn getrlimit(&mut self, resource: Resource) -> nix::Result<Rlimit> {
        self.injected(Op::Getrlimit)?;
        self.calls.push(Call::Getrlimit(resource));
        Ok(self.rlimit(resource))
    }

    fn setrlimit(&mut self, resource: Resource, limit: Rlimit) -> nix::Result<()> {
        self.injected(Op::Setrlimit)?;
        if limit.soft > limit.hard {
            return Err(Errno::EINVAL);
        }
        self.calls.push(Call::Setrlimit(resource, limit));
        self.limits.insert(resource, limit);
        Ok(())
    }

    fn setregid(&mut self, gid: Gid) -> nix::Result<()> {
        self.injected(Op::Setregid)?;
        self.calls.push(Call::Setregid(gid));
        self.gid = gid;
        Ok(())
    }

    fn setreuid(&mut self, uid: Uid) -> nix::Result<()> {
        self.injected(Op::Setreuid)?;
        self.calls.push(Call::Setreuid(uid));
        self.uid = uid;
        Ok(())
    }

    fn execvp(&mut self, argv: &Argv) -> nix::Result<()> {
        self.injected(Op::Execvp)?;
        let args: Vec<String> = argv
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        self.calls.push(Call::Execvp(args.clone()));
        self.fds.retain(|_, f| !f.cloexec);
        self.exec = Some(args);
        Ok(())
    }

    fn exit_immediately(&mut self, status: i32) {
        self.calls.push(Call::Exit(status));
        self.exit_status = Some(status);
    }
}

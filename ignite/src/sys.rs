//! The syscall boundary.
//!
//! Every OS interaction made by the launch core goes through [`Sys`], so a
//! substitute (such as `FakeSys`) can observe and steer every
//! side effect. [`Os`] is the production implementation; all `unsafe` code
//! in the crate is confined to this module.
//!
//! Methods mirror the underlying primitive: the OS sentinel-plus-errno
//! convention becomes `nix::Result`, and nothing panics or allocates.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::io::IoSlice;
use std::os::fd::{IntoRawFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::resource::Resource;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult, Gid, Pid, Uid};

use crate::limits::Rlimit;
use crate::request::Argv;

/// OS primitives used by the launch core.
pub trait Sys {
    /// `dup2(fd, dest)`: duplicate `fd` onto exactly `dest`.
    fn dup2(&mut self, fd: RawFd, dest: RawFd) -> nix::Result<RawFd>;

    /// `fcntl(F_DUPFD[_CLOEXEC])`: duplicate onto the lowest free slot `>= min`.
    fn dup_min(&mut self, fd: RawFd, min: RawFd, cloexec: bool) -> nix::Result<RawFd>;

    /// `close(fd)`.
    fn close(&mut self, fd: RawFd) -> nix::Result<()>;

    /// `read(fd, buf)`.
    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> nix::Result<usize>;

    /// `write(fd, buf)`. May write fewer bytes than requested.
    fn write(&mut self, fd: RawFd, buf: &[u8]) -> nix::Result<usize>;

    /// `writev(fd, bufs)`. May write fewer bytes than requested.
    fn writev(&mut self, fd: RawFd, bufs: &[IoSlice<'_>]) -> nix::Result<usize>;

    /// `open(path, flags, mode)`.
    fn open(&mut self, path: &CStr, flags: OFlag, mode: Mode) -> nix::Result<RawFd>;

    /// Creates a pipe with both ends close-on-exec. Returns `(read, write)`.
    fn pipe(&mut self) -> nix::Result<(RawFd, RawFd)>;

    /// `fork()`.
    ///
    /// In a multi-threaded process the child may only use async-signal-safe
    /// operations until it execs.
    fn fork(&mut self) -> nix::Result<ForkResult>;

    /// `kill(pid, signal)`.
    fn kill(&mut self, pid: Pid, signal: Signal) -> nix::Result<()>;

    /// `getpid()`.
    fn getpid(&mut self) -> Pid;

    /// `getpgrp()`.
    fn getpgrp(&mut self) -> Pid;

    /// `chdir(path)`.
    fn chdir(&mut self, path: &CStr) -> nix::Result<()>;

    /// `putenv(entry)`. The environment keeps referring to `entry`.
    fn putenv(&mut self, entry: &'static CStr) -> nix::Result<()>;

    /// `setsid()`.
    fn setsid(&mut self) -> nix::Result<Pid>;

    /// `setpgid(pid, pgid)`.
    fn setpgid(&mut self, pid: Pid, pgid: Pid) -> nix::Result<()>;

    /// `tcgetsid(fd)`: session of the terminal open on `fd`.
    fn tcgetsid(&mut self, fd: RawFd) -> nix::Result<Pid>;

    /// `tcsetpgrp(fd, pgrp)`.
    fn tcsetpgrp(&mut self, fd: RawFd, pgrp: Pid) -> nix::Result<()>;

    /// `ioctl(fd, TIOCSCTTY, 0)`: claim the terminal on `fd` for this session.
    fn set_controlling_terminal(&mut self, fd: RawFd) -> nix::Result<()>;

    /// `signal(signal, SIG_IGN)`.
    fn ignore_signal(&mut self, signal: Signal) -> nix::Result<()>;

    /// `sigprocmask(how, set)`. Returns the previous mask.
    fn sigprocmask(&mut self, how: SigmaskHow, set: &SigSet) -> nix::Result<SigSet>;

    /// `getrlimit(resource)`.
    fn getrlimit(&mut self, resource: Resource) -> nix::Result<Rlimit>;

    /// `setrlimit(resource, limit)`.
    fn setrlimit(&mut self, resource: Resource, limit: Rlimit) -> nix::Result<()>;

    /// `setregid(gid, gid)`.
    fn setregid(&mut self, gid: Gid) -> nix::Result<()>;

    /// `setreuid(uid, uid)`.
    fn setreuid(&mut self, uid: Uid) -> nix::Result<()>;

    /// `execvp(argv[0], argv)`.
    ///
    /// The real call only returns on failure. `Ok(())` means a substitute
    /// simulated a successful image replacement.
    fn execvp(&mut self, argv: &Argv) -> nix::Result<()>;

    /// `_exit(status)`: terminate without running library exit handlers.
    ///
    /// [`Os`] never returns from this; substitutes record the status.
    fn exit_immediately(&mut self, status: i32);
}

/// The real operating system.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct Os;

impl Os {
    /// Creates the production boundary.
    pub const fn new() -> Self {
        Self
    }
}

/// Converts a `ssize_t` return into a byte count.
fn check_len(ret: isize) -> nix::Result<usize> {
    #[allow(clippy::cast_sign_loss)]
    Errno::result(ret).map(|n| n as usize)
}

impl Sys for Os {
    fn dup2(&mut self, fd: RawFd, dest: RawFd) -> nix::Result<RawFd> {
        // SAFETY: dup2 only manipulates the descriptor table.
        Errno::result(unsafe { libc::dup2(fd, dest) })
    }

    fn dup_min(&mut self, fd: RawFd, min: RawFd, cloexec: bool) -> nix::Result<RawFd> {
        let cmd = if cloexec {
            libc::F_DUPFD_CLOEXEC
        } else {
            libc::F_DUPFD
        };
        // SAFETY: F_DUPFD[_CLOEXEC] only manipulates the descriptor table.
        Errno::result(unsafe { libc::fcntl(fd, cmd, min) })
    }

    fn close(&mut self, fd: RawFd) -> nix::Result<()> {
        // SAFETY: the caller owns `fd`; nothing else refers to it afterwards.
        Errno::result(unsafe { libc::close(fd) }).map(drop)
    }

    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        check_len(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    }

    fn write(&mut self, fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        check_len(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    }

    fn writev(&mut self, fd: RawFd, bufs: &[IoSlice<'_>]) -> nix::Result<usize> {
        let count = libc::c_int::try_from(bufs.len()).map_err(|_| Errno::EINVAL)?;
        // SAFETY: IoSlice is ABI-compatible with iovec on Unix.
        check_len(unsafe { libc::writev(fd, bufs.as_ptr().cast::<libc::iovec>(), count) })
    }

    fn open(&mut self, path: &CStr, flags: OFlag, mode: Mode) -> nix::Result<RawFd> {
        // SAFETY: path is NUL-terminated and outlives the call.
        Errno::result(unsafe {
            libc::open(path.as_ptr(), flags.bits(), libc::c_uint::from(mode.bits()))
        })
    }

    fn pipe(&mut self) -> nix::Result<(RawFd, RawFd)> {
        // Close-on-exec atomically; a concurrent fork must not inherit either end.
        let (read_fd, write_fd) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        Ok((read_fd.into_raw_fd(), write_fd.into_raw_fd()))
    }

    fn fork(&mut self) -> nix::Result<ForkResult> {
        // SAFETY: the child side only runs the launch sequencer, which sticks to
        // descriptor, environment and identity calls before exec or _exit.
        unsafe { unistd::fork() }
    }

    fn kill(&mut self, pid: Pid, sig: Signal) -> nix::Result<()> {
        signal::kill(pid, sig)
    }

    fn getpid(&mut self) -> Pid {
        unistd::getpid()
    }

    fn getpgrp(&mut self) -> Pid {
        unistd::getpgrp()
    }

    fn chdir(&mut self, path: &CStr) -> nix::Result<()> {
        unistd::chdir(path)
    }

    fn putenv(&mut self, entry: &'static CStr) -> nix::Result<()> {
        // SAFETY: entry lives for the rest of the process and is never mutated.
        let ret = unsafe { libc::putenv(entry.as_ptr().cast_mut()) };
        if ret == 0 { Ok(()) } else { Err(Errno::last()) }
    }

    fn setsid(&mut self) -> nix::Result<Pid> {
        unistd::setsid()
    }

    fn setpgid(&mut self, pid: Pid, pgid: Pid) -> nix::Result<()> {
        unistd::setpgid(pid, pgid)
    }

    fn tcgetsid(&mut self, fd: RawFd) -> nix::Result<Pid> {
        // SAFETY: tcgetsid only queries the terminal open on fd.
        Errno::result(unsafe { libc::tcgetsid(fd) }).map(Pid::from_raw)
    }

    fn tcsetpgrp(&mut self, fd: RawFd, pgrp: Pid) -> nix::Result<()> {
        // SAFETY: tcsetpgrp only updates terminal state.
        Errno::result(unsafe { libc::tcsetpgrp(fd, pgrp.as_raw()) }).map(drop)
    }

    fn set_controlling_terminal(&mut self, fd: RawFd) -> nix::Result<()> {
        // SAFETY: TIOCSCTTY takes an integer argument, no memory is passed.
        Errno::result(unsafe { libc::ioctl(fd, libc::TIOCSCTTY, 0) }).map(drop)
    }

    fn ignore_signal(&mut self, sig: Signal) -> nix::Result<()> {
        // SAFETY: SIG_IGN installs no handler code.
        unsafe { signal::signal(sig, SigHandler::SigIgn) }.map(drop)
    }

    fn sigprocmask(&mut self, how: SigmaskHow, set: &SigSet) -> nix::Result<SigSet> {
        let mut old = SigSet::empty();
        signal::sigprocmask(how, Some(set), Some(&mut old))?;
        Ok(old)
    }

    fn getrlimit(&mut self, resource: Resource) -> nix::Result<Rlimit> {
        let (soft, hard) = nix::sys::resource::getrlimit(resource)?;
        Ok(Rlimit { soft, hard })
    }

    fn setrlimit(&mut self, resource: Resource, limit: Rlimit) -> nix::Result<()> {
        nix::sys::resource::setrlimit(resource, limit.soft, limit.hard)
    }

    fn setregid(&mut self, gid: Gid) -> nix::Result<()> {
        // SAFETY: plain credential syscall.
        Errno::result(unsafe { libc::setregid(gid.as_raw(), gid.as_raw()) }).map(drop)
    }

    fn setreuid(&mut self, uid: Uid) -> nix::Result<()> {
        // SAFETY: plain credential syscall.
        Errno::result(unsafe { libc::setreuid(uid.as_raw(), uid.as_raw()) }).map(drop)
    }

    fn execvp(&mut self, argv: &Argv) -> nix::Result<()> {
        // SAFETY: argv is a NULL-terminated array of NUL-terminated strings
        // that outlives the call.
        unsafe { libc::execvp(argv.program().as_ptr(), argv.as_ptr()) };
        Err(Errno::last())
    }

    fn exit_immediately(&mut self, status: i32) {
        // SAFETY: _exit is async-signal-safe and does not return.
        unsafe { libc::_exit(status) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pipe_ends_are_close_on_exec() {
        let mut os = Os::new();
        let (read_fd, write_fd) = os.pipe().unwrap();
        for fd in [read_fd, write_fd] {
            // SAFETY: fd was just created by this test.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
        assert_eq!(os.write(write_fd, b"x"), Ok(1));
        os.close(write_fd).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(os.read(read_fd, &mut buf), Ok(1));
        assert_eq!(os.read(read_fd, &mut buf), Ok(0));
        os.close(read_fd).unwrap();
    }
}

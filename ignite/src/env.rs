//! Environment exports for the child.
//!
//! Numeric assignments (`NAME=<number>`) are reserved before fork with an
//! exactly-sized buffer and filled in the child without reallocating.
//! Environment files are the one place the child allocates; allocation
//! failure there surfaces as `ENOMEM`.

use std::ffi::CStr;
use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::sys::Sys;

/// Descriptor number an activation socket is placed on.
pub const ACTIVATION_FD: RawFd = 3;

/// Socket-count assignment exported alongside an activation socket.
pub const LISTEN_FDS: &CStr = c"LISTEN_FDS=1";

/// Variable carrying the pid that owns the activation socket.
pub const LISTEN_PID_VAR: &str = "LISTEN_PID";

/// Variable carrying the control-socket descriptor number.
pub const CONTROL_SOCKET_VAR: &str = "IGNITE_CS_FD";

/// Upper bound on decimal digits for a `u32`.
const MAX_DIGITS: usize = (u32::BITS as usize + 2) / 3;

/// A `NAME=<number>` environment entry with its storage reserved up front.
#[derive(Debug, PartialEq, Eq)]
pub struct EnvAssignment {
    /// `NAME=`, with capacity for the digits and terminator.
    buf: Vec<u8>,
}

impl Clone for EnvAssignment {
    /// Keeps the reserved capacity.
    fn clone(&self) -> Self {
        let mut buf = Vec::with_capacity(self.buf.capacity());
        buf.extend_from_slice(&self.buf);
        Self { buf }
    }
}

impl EnvAssignment {
    /// Reserves an assignment for `name`.
    ///
    /// Rejects empty names and names containing `=` or NUL.
    pub fn reserve(name: &str) -> crate::Result<Self> {
        if name.is_empty() || name.contains(['=', '\0']) {
            return Err(crate::Error::InvalidRequest(format!(
                "bad environment variable name '{name}'"
            )));
        }
        let mut buf = Vec::with_capacity(name.len() + 1 + MAX_DIGITS + 1);
        buf.extend_from_slice(name.as_bytes());
        buf.push(b'=');
        Ok(Self { buf })
    }

    /// The variable name.
    pub fn name(&self) -> &str {
        // Built from a `&str` plus a trailing ASCII byte.
        std::str::from_utf8(&self.buf[..self.buf.len() - 1]).unwrap_or_default()
    }

    /// Bytes reserved for the finished entry.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Appends `value` and the terminator, then hands the entry over for the
    /// remaining life of the process.
    ///
    /// Writes only into the reserved capacity.
    pub fn fill(mut self, value: u32) -> nix::Result<&'static CStr> {
        let mut digits = [0u8; MAX_DIGITS];
        let mut start = digits.len();
        let mut rest = value;
        loop {
            start -= 1;
            digits[start] = b'0' + u8::try_from(rest % 10).unwrap_or(0);
            rest /= 10;
            if rest == 0 {
                break;
            }
        }
        if self.buf.capacity() - self.buf.len() < digits.len() - start + 1 {
            return Err(Errno::ENOMEM);
        }
        self.buf.extend_from_slice(&digits[start..]);
        self.buf.push(0);
        let entry: &'static [u8] = self.buf.leak();
        CStr::from_bytes_with_nul(entry).map_err(|_| Errno::EINVAL)
    }
}

/// Chunk size used when reading an environment file.
const READ_CHUNK: usize = 1024;

/// Reads `path` and adds each assignment to the environment.
///
/// One assignment per line: leading whitespace is skipped, blank lines and
/// lines starting with `#` are ignored, the name runs to `=` or whitespace,
/// and the value is the rest of the line after `=`. A line without `=`, or
/// one that starts with `=`, fails with `EINVAL`.
pub fn load_env_file<S: Sys + ?Sized>(sys: &mut S, path: &CStr) -> nix::Result<()> {
    let fd = sys.open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    let read = read_all(sys, fd);
    let _ = sys.close(fd);
    let contents = read?;

    for line in contents.split(|&b| b == b'\n') {
        let Some((name, value)) = parse_line(line)? else {
            continue;
        };
        sys.putenv(leak_entry(name, value)?)?;
    }
    Ok(())
}

fn read_all<S: Sys + ?Sized>(sys: &mut S, fd: RawFd) -> nix::Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        grow(&mut buf, READ_CHUNK)?;
        let start = buf.len();
        buf.resize(start + READ_CHUNK, 0);
        match sys.read(fd, &mut buf[start..]) {
            Ok(0) => {
                buf.truncate(start);
                return Ok(buf);
            }
            Ok(n) => buf.truncate(start + n),
            Err(Errno::EINTR) => buf.truncate(start),
            Err(e) => return Err(e),
        }
    }
}

/// Reserves `additional` bytes without aborting on allocation failure.
fn grow(buf: &mut Vec<u8>, additional: usize) -> nix::Result<()> {
    buf.try_reserve(additional).map_err(|_| Errno::ENOMEM)
}

/// Splits one line into name and value. `Ok(None)` for blank and comment lines.
fn parse_line(line: &[u8]) -> nix::Result<Option<(&[u8], &[u8])>> {
    let line = line.trim_ascii_start();
    match line.first() {
        None | Some(b'#') => return Ok(None),
        Some(b'=') => return Err(Errno::EINVAL),
        Some(_) => {}
    }
    let name_end = line
        .iter()
        .position(|&b| b == b'=' || b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let (name, rest) = line.split_at(name_end);
    match rest.trim_ascii_start().split_first() {
        Some((b'=', value)) => Ok(Some((name, value))),
        _ => Err(Errno::EINVAL),
    }
}

/// Builds `name=value\0` in an exactly-sized buffer that is never freed.
fn leak_entry(name: &[u8], value: &[u8]) -> nix::Result<&'static CStr> {
    let mut entry = Vec::new();
    entry
        .try_reserve_exact(name.len() + value.len() + 2)
        .map_err(|_| Errno::ENOMEM)?;
    entry.extend_from_slice(name);
    entry.push(b'=');
    entry.extend_from_slice(value);
    entry.push(0);
    let entry: &'static [u8] = entry.leak();
    CStr::from_bytes_with_nul(entry).map_err(|_| Errno::EINVAL)
}

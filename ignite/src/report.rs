//! Both ends of the status pipe.
//!
//! The child writes one fixed-size [`LaunchFailure`] record and exits; a
//! successful exec closes the write end (it is close-on-exec) so the parent
//! sees end-of-stream with no data.

use std::os::fd::RawFd;

use ignite_proto::{LaunchFailure, RECORD_LEN, StatusReport};
use nix::errno::Errno;

use crate::sys::Sys;

/// Writes `failure` to `status_fd` and terminates the child.
///
/// A single write: a short or failed write is not retried. The exit
/// status is always 0; the record carries the outcome.
pub fn send_failure<S: Sys + ?Sized>(sys: &mut S, status_fd: RawFd, failure: LaunchFailure) {
    let record = failure.encode();
    let _ = sys.write(status_fd, &record);
    sys.exit_immediately(0);
}

/// Parent-side accumulator for the status pipe.
///
/// Holds at most one byte past a full record; anything longer is already
/// known to be garbled.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusReader {
    buf: [u8; RECORD_LEN + 1],
    len: usize,
}

impl StatusReader {
    /// Creates an empty reader.
    pub const fn new() -> Self {
        Self {
            buf: [0; RECORD_LEN + 1],
            len: 0,
        }
    }

    /// Bytes received so far.
    pub const fn received(&self) -> usize {
        self.len
    }

    /// Reads what is available from `fd`.
    ///
    /// Returns `Ok(None)` if the read would block (bytes so far are kept),
    /// or the classification once end-of-stream is seen or too many bytes
    /// have arrived. `EINTR` is retried.
    pub fn poll<S: Sys + ?Sized>(
        &mut self,
        sys: &mut S,
        fd: RawFd,
    ) -> nix::Result<Option<StatusReport>> {
        while self.len < self.buf.len() {
            match sys.read(fd, &mut self.buf[self.len..]) {
                Ok(0) => return Ok(Some(StatusReport::classify(&self.buf[..self.len]))),
                Ok(n) => self.len += n,
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Ok(Some(StatusReport::classify(&self.buf)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ignite_proto::LaunchStage;

    use super::*;
    use crate::fake::FakeSys;

    #[test]
    fn failure_record_then_exit() {
        let mut sys = FakeSys::new();
        let fd = sys.alloc_fd();
        let failure = LaunchFailure::new(LaunchStage::SetupStdio, 13);
        send_failure(&mut sys, fd, failure);
        assert_eq!(sys.written(fd), failure.encode());
        assert_eq!(sys.exit_status(), Some(0));
    }

    #[test]
    fn failed_write_still_exits() {
        let mut sys = FakeSys::new();
        send_failure(&mut sys, 42, LaunchFailure::new(LaunchStage::DoExec, 2));
        assert_eq!(sys.exit_status(), Some(0));
    }

    #[test]
    fn end_of_stream_without_data_is_started() {
        let mut sys = FakeSys::new();
        let fd = sys.alloc_fd();
        let mut reader = StatusReader::new();
        assert_eq!(reader.poll(&mut sys, fd), Ok(Some(StatusReport::Started)));
    }

    #[test]
    fn record_split_across_would_block() {
        let mut sys = FakeSys::new();
        let fd = sys.alloc_fd();
        sys.set_blocking(fd);
        let failure = LaunchFailure::new(LaunchStage::SetRlimits, 1);
        let record = failure.encode();
        sys.supply_read_data(fd, record[..3].to_vec());

        let mut reader = StatusReader::new();
        assert_eq!(reader.poll(&mut sys, fd), Ok(None));
        assert_eq!(reader.received(), 3);

        sys.supply_read_error(fd, Errno::EINTR);
        sys.supply_read_data(fd, record[3..].to_vec());
        sys.supply_read_data(fd, Vec::new());
        assert_eq!(
            reader.poll(&mut sys, fd),
            Ok(Some(StatusReport::Failed(failure)))
        );
    }

    #[test]
    fn overlong_stream_is_garbled() {
        let mut sys = FakeSys::new();
        let fd = sys.alloc_fd();
        sys.supply_read_data(fd, vec![0u8; 32]);
        let mut reader = StatusReader::new();
        assert_eq!(
            reader.poll(&mut sys, fd),
            Ok(Some(StatusReport::Garbled { len: RECORD_LEN + 1 }))
        );
    }

    #[test]
    fn read_errors_propagate() {
        let mut sys = FakeSys::new();
        let fd = sys.alloc_fd();
        sys.supply_read_error(fd, Errno::EIO);
        assert_eq!(StatusReader::new().poll(&mut sys, fd), Err(Errno::EIO));
    }
}

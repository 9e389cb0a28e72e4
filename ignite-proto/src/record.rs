//! Fixed-size failure record written down the status pipe.
//!
//! Layout: `[u32 stage ordinal][i32 errno]`, native byte order, no length
//! prefix. Both ends run on the same host, so the size is known to both.

use std::fmt;
use std::io::{self, Read};

use serde::{Deserialize, Serialize};

use crate::LaunchStage;

/// Size in bytes of one encoded failure record.
pub const RECORD_LEN: usize = 8;

/// A bootstrap stage that failed, with the OS error it failed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchFailure {
    /// The stage that was being attempted.
    pub stage: LaunchStage,
    /// The `errno` value captured at the failure point.
    pub os_error_code: i32,
}

impl LaunchFailure {
    /// Creates a failure record.
    pub const fn new(stage: LaunchStage, os_error_code: i32) -> Self {
        Self {
            stage,
            os_error_code,
        }
    }

    /// Encodes the record into its wire form.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[..4].copy_from_slice(&self.stage.ordinal().to_ne_bytes());
        buf[4..].copy_from_slice(&self.os_error_code.to_ne_bytes());
        buf
    }

    /// Decodes a record from exactly [`RECORD_LEN`] bytes.
    pub fn decode(buf: &[u8; RECORD_LEN]) -> Result<Self, DecodeError> {
        let [s0, s1, s2, s3, e0, e1, e2, e3] = *buf;
        let ordinal = u32::from_ne_bytes([s0, s1, s2, s3]);
        let stage = LaunchStage::from_ordinal(ordinal).ok_or(DecodeError::UnknownStage(ordinal))?;
        Ok(Self::new(stage, i32::from_ne_bytes([e0, e1, e2, e3])))
    }

    /// Decodes a record from a slice that must hold exactly one record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let buf: &[u8; RECORD_LEN] = bytes
            .try_into()
            .map_err(|_| DecodeError::Truncated(bytes.len()))?;
        Self::decode(buf)
    }

    /// Returns the OS error as an [`io::Error`].
    pub fn os_error(&self) -> io::Error {
        io::Error::from_raw_os_error(self.os_error_code)
    }
}

impl fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not {}: {}", self.stage, self.os_error())
    }
}

/// Reasons a byte sequence is not a valid failure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    /// The stage ordinal does not name a known stage.
    UnknownStage(u32),
    /// The pipe delivered a byte count other than zero or one record.
    Truncated(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownStage(n) => write!(f, "unknown launch stage {n}"),
            Self::Truncated(len) => {
                write!(f, "status pipe delivered {len} bytes, expected 0 or {RECORD_LEN}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// What the parent learned from draining the status pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum StatusReport {
    /// End-of-stream with no data: the image was replaced.
    Started,
    /// A complete record arrived.
    Failed(LaunchFailure),
    /// Partial or malformed data; the launch failed for an unknown reason.
    Garbled {
        /// Number of bytes received.
        len: usize,
    },
}

impl StatusReport {
    /// Classifies everything read from the status pipe up to end-of-stream.
    pub fn classify(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::Started;
        }
        LaunchFailure::from_bytes(bytes).map_or(
            Self::Garbled { len: bytes.len() },
            Self::Failed,
        )
    }

    /// Returns `true` if the child reached the new image.
    pub const fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }
}

/// Drains `r` to end-of-stream and classifies the result.
///
/// At most one byte past a full record is read; a longer stream is garbled
/// regardless of what follows.
pub fn read_status(r: &mut impl Read) -> io::Result<StatusReport> {
    let mut buf = [0u8; RECORD_LEN + 1];
    let mut len = 0;
    while len < buf.len() {
        match r.read(&mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(StatusReport::classify(&buf[..len]))
}

//! Descriptor placement helpers used between fork and exec.
//!
//! Neither helper allocates. Both leave cleanup of a failed step to the
//! caller, which in the child means nothing: the process is about to exit.

use std::os::fd::RawFd;

use crate::sys::Sys;

/// Moves `src` onto exactly `dest`, closing `src` afterwards.
///
/// Returns `Ok(None)` without touching anything when `src` is unset, and
/// `Ok(Some(dest))` otherwise. If the duplicate fails `src` stays open.
pub fn move_descriptor<S: Sys + ?Sized>(
    sys: &mut S,
    src: Option<RawFd>,
    dest: RawFd,
) -> nix::Result<Option<RawFd>> {
    let Some(src) = src else {
        return Ok(None);
    };
    if src != dest {
        sys.dup2(src, dest)?;
        let _ = sys.close(src);
    }
    Ok(Some(dest))
}

/// Evacuates `*fd` to the lowest free slot `>= min_slot` so its current
/// number can be claimed by a fixed-number convention.
///
/// The original is closed and `*fd` is overwritten with the new number,
/// which is also returned. `cloexec` selects whether the copy survives exec.
pub fn relocate_reserved<S: Sys + ?Sized>(
    sys: &mut S,
    fd: &mut RawFd,
    min_slot: RawFd,
    cloexec: bool,
) -> nix::Result<RawFd> {
    let new_fd = sys.dup_min(*fd, min_slot, cloexec)?;
    let _ = sys.close(*fd);
    *fd = new_fd;
    Ok(new_fd)
}

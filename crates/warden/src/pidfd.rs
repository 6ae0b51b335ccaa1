//! pidfd helpers: stable task handles safe against pid reuse.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::error::{Result, WardenError};
use crate::probes::RuntimeFeatures;

/// `pidfd_open` flag selecting a specific thread rather than a thread group.
pub const PIDFD_THREAD: libc::c_uint = 0o200;

const KCMP_FILES: libc::c_int = 2;

/// Open a pidfd for `pid`.
pub fn open(pid: i32, flags: libc::c_uint) -> Result<OwnedFd> {
    // SAFETY: pidfd_open takes a pid and flags and returns a new fd.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, flags) };
    if fd < 0 {
        return Err(WardenError::last_os("pidfd_open"));
    }

    // SAFETY: fd is a valid, newly-created descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Prepare the pidfd handed to the bridge child, inherited at fd slot 3.
///
/// Returns `(-1, None)` when the host has no pidfd support; the bridge
/// then falls back to plain pid addressing.
pub fn make_for_bridge(pid: i32, features: &RuntimeFeatures) -> (i32, Option<OwnedFd>) {
    if !features.pidfds {
        return (-1, None);
    }

    match open(pid, 0) {
        Ok(fd) => (3, Some(fd)),
        Err(_) => (-1, None),
    }
}

/// Send a signal through a pidfd. Signal 0 probes that the task is alive
/// and we are allowed to signal it.
pub fn send_signal(pidfd: RawFd, signal: libc::c_int) -> Result<()> {
    // SAFETY: pidfd_send_signal with a null siginfo behaves like kill().
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd,
            signal,
            std::ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    if ret < 0 {
        return Err(WardenError::last_os("pidfd_send_signal"));
    }

    Ok(())
}

/// Duplicate a file descriptor out of the task behind `pidfd`.
pub fn getfd(pidfd: RawFd, target_fd: u32) -> Result<OwnedFd> {
    // SAFETY: pidfd_getfd returns a new descriptor in our table.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd, target_fd, 0) };
    if fd < 0 {
        return Err(WardenError::last_os("pidfd_getfd"));
    }

    // SAFETY: fd is a valid, newly-created descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Whether two tasks share one file descriptor table.
///
/// Needed before acting on fd numbers taken from a thread that is not the
/// thread-group leader: the numbers only mean the same thing if the table
/// is shared.
pub fn filetable_shared(tgid: i32, pid: i32) -> bool {
    // SAFETY: kcmp compares kernel resources of the two tasks; it reads
    // nothing from our address space.
    let ret = unsafe { libc::syscall(libc::SYS_kcmp, tgid, pid, KCMP_FILES, 0, 0) };
    ret == 0
}

/// Whether the task behind `pidfd` is still alive.
pub fn still_alive(pidfd: RawFd) -> bool {
    send_signal(pidfd, 0).is_ok()
}

//! Bounded reads and writes of the target's address space.
//!
//! Every pointer argument in a notification is untrusted: it lives in
//! another process whose threads keep running while we look. All accesses
//! go through `pread`/`pwrite` on the received `/proc/<pid>/mem` fd with a
//! caller-supplied bound, and callers must re-validate the notification id
//! with [`notif_id_valid`] after reading and before acting, so a target
//! that died (and whose pid may have been recycled) is never operated on.

use std::os::fd::RawFd;

use crate::error::{Result, WardenError};

/// ioctl request codes for seccomp notifications.
const SECCOMP_IOCTL_NOTIF_ID_VALID: libc::c_ulong = 0x4008_2102;
pub(crate) const SECCOMP_IOCTL_NOTIF_ADDFD: libc::c_ulong = 0x4018_2103;

/// Read up to `buf.len()` bytes at `addr` in the target's address space.
///
/// Returns the number of bytes actually read, which may be short when the
/// range crosses the end of a mapping.
pub fn read_at(mem_fd: RawFd, buf: &mut [u8], addr: u64) -> Result<usize> {
    // SAFETY: buf is a valid writable slice for its full length.
    let n = unsafe {
        libc::pread(
            mem_fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            addr as libc::off_t,
        )
    };
    if n < 0 {
        return Err(WardenError::last_os("pread"));
    }

    Ok(n as usize)
}

/// Read exactly `buf.len()` bytes at `addr`, failing on a short read.
pub fn read_exact_at(mem_fd: RawFd, buf: &mut [u8], addr: u64) -> Result<()> {
    let n = read_at(mem_fd, buf, addr)?;
    if n != buf.len() {
        return Err(WardenError::Sys {
            call: "pread",
            source: std::io::Error::from_raw_os_error(libc::EIO),
        });
    }

    Ok(())
}

/// Read a fixed-layout value from the target's address space.
pub fn read_struct<T: Copy + Default>(mem_fd: RawFd, addr: u64) -> Result<T> {
    let mut value = T::default();
    // SAFETY: value is a plain repr(C) mirror; viewing it as bytes for the
    // duration of the read is sound.
    let buf = unsafe {
        std::slice::from_raw_parts_mut(
            &mut value as *mut T as *mut u8,
            std::mem::size_of::<T>(),
        )
    };
    read_exact_at(mem_fd, buf, addr)?;
    Ok(value)
}

/// Read a NUL-terminated path argument, bounded by `PATH_MAX`.
///
/// Non-UTF-8 bytes are replaced; the emulators only compare these strings
/// against configuration and forward them to the bridge.
pub fn read_path(mem_fd: RawFd, addr: u64) -> Result<String> {
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let n = read_at(mem_fd, &mut buf, addr)?;

    let end = buf[..n].iter().position(|&b| b == 0).ok_or_else(|| {
        WardenError::Sys {
            call: "pread",
            source: std::io::Error::from_raw_os_error(libc::ENAMETOOLONG),
        }
    })?;

    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Write `buf` at `addr` in the target's address space.
pub fn write_at(mem_fd: RawFd, buf: &[u8], addr: u64) -> Result<()> {
    // SAFETY: buf is a valid readable slice for its full length.
    let n = unsafe {
        libc::pwrite(
            mem_fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            addr as libc::off_t,
        )
    };
    if n < 0 {
        return Err(WardenError::last_os("pwrite"));
    }

    if n as usize != buf.len() {
        return Err(WardenError::Sys {
            call: "pwrite",
            source: std::io::Error::from_raw_os_error(libc::EIO),
        });
    }

    Ok(())
}

/// Verify the notification is still pending, i.e. the target thread has
/// neither exited nor been recycled since we started looking at it.
///
/// # Errors
///
/// Returns the ioctl's errno; callers turn it into a negative response.
pub fn notif_id_valid(notify_fd: RawFd, id: u64) -> std::io::Result<()> {
    // SAFETY: the id is passed by pointer and only read by the kernel.
    let ret = unsafe { libc::ioctl(notify_fd, SECCOMP_IOCTL_NOTIF_ID_VALID, &id as *const u64) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}

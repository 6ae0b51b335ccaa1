//! Capability probes, queried once at supervisor start.
//!
//! Two sources feed these: the kernel (`SECCOMP_GET_NOTIF_SIZES`, which
//! doubles as the layout sanity check for our repr(C) mirrors) and the
//! container runtime (notify, continue, addfd, allow/deny spelling, pidfd
//! support). The runtime-side flags are detected by the lifecycle layer
//! and handed in; the supervisor treats both as immutable after start.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

const SECCOMP_GET_NOTIF_SIZES: libc::c_uint = 3;

/// Kernel-reported sizes of the three notification structures.
///
/// Mirrors `struct seccomp_notif_sizes` from `<linux/seccomp.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifSizes {
    pub seccomp_notif: u16,
    pub seccomp_notif_resp: u16,
    pub seccomp_data: u16,
}

impl NotifSizes {
    /// Ask the kernel for its notification structure sizes and verify they
    /// match the layouts this crate was compiled with.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel predates seccomp user notification
    /// or was built with extended structures we do not know about.
    pub fn query() -> Result<Self> {
        let mut sizes = NotifSizes::default();

        // SAFETY: the kernel writes a seccomp_notif_sizes struct into the
        // provided pointer; NotifSizes is a correctly sized repr(C) mirror.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_GET_NOTIF_SIZES,
                0,
                &mut sizes as *mut NotifSizes,
            )
        };
        if ret != 0 {
            return Err(WardenError::NotifSizes);
        }

        if usize::from(sizes.seccomp_notif) != std::mem::size_of::<crate::frame::SeccompNotif>()
            || usize::from(sizes.seccomp_notif_resp)
                != std::mem::size_of::<crate::frame::SeccompNotifResp>()
            || usize::from(sizes.seccomp_data) != std::mem::size_of::<crate::frame::SeccompData>()
        {
            return Err(WardenError::NotifSizeMismatch);
        }

        Ok(sizes)
    }
}

/// Runtime and kernel feature flags relevant to interception.
///
/// Populated at supervisor start, immutable afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeFeatures {
    /// The runtime can forward seccomp user notifications at all.
    pub seccomp_listener: bool,
    /// `SECCOMP_USER_NOTIF_FLAG_CONTINUE` is usable. This is also the
    /// supervisor-wide permissive-mode switch: with it, emulation failures
    /// fall back to letting the kernel run the original syscall.
    pub seccomp_listener_continue: bool,
    /// `SECCOMP_IOCTL_NOTIF_ADDFD` is usable.
    pub seccomp_listener_addfd: bool,
    /// The runtime understands `allowlist`/`denylist` rather than the
    /// legacy spellings.
    pub allow_deny_syntax: bool,
    /// pidfd_open/pidfd_send_signal are available.
    pub pidfds: bool,
    /// `PIDFD_THREAD` is available, so pidfds can target single threads.
    pub pidfds_thread: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notif_sizes_layout() {
        assert_eq!(std::mem::size_of::<NotifSizes>(), 6);
    }

    #[test]
    fn test_query_matches_compiled_layout() {
        // Skipped on kernels without seccomp user notification.
        if let Ok(sizes) = NotifSizes::query() {
            assert_eq!(usize::from(sizes.seccomp_notif), 80);
            assert_eq!(usize::from(sizes.seccomp_notif_resp), 24);
            assert_eq!(usize::from(sizes.seccomp_data), 64);
        }
    }
}

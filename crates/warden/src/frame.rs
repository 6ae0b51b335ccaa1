//! The notification frame exchanged with the container runtime.
//!
//! Each message on the supervisor socket is a fixed 4-iovec bundle:
//!
//! 1. proxy header (who is asking, structure-size negotiation, cookie length)
//! 2. kernel `seccomp_notif` (the intercepted syscall)
//! 3. kernel `seccomp_notif_resp` (pre-zeroed by the sender)
//! 4. optional opaque cookie (up to 64 bytes, never echoed back)
//!
//! plus up to three ancillary fds: `/proc/<pid>`, `/proc/<pid>/mem` and the
//! seccomp notify fd. Replies reuse the first three iovecs on the same
//! socket. An invalid frame gets an empty reply: the runtime notices the
//! short read and applies its default action without waiting out the
//! kernel's notification timeout.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Result, WardenError};
use crate::probes::NotifSizes;

/// Response flag: let the target thread run the original syscall.
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 0x0000_0001;

/// Maximum cookie payload carried after the fixed structures.
pub const SECCOMP_COOKIE_SIZE: usize = 64;

/// Proxy header prepended by the runtime to every notification.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyHeader {
    /// Must be zero.
    pub reserved: u64,
    /// Pid of the container monitor process (instance lookup key).
    pub monitor_pid: i32,
    /// Pid of the container's init process.
    pub init_pid: i32,
    /// The sender's idea of the kernel structure sizes.
    pub sizes: NotifSizes,
    /// Length of the trailing cookie.
    pub cookie_len: u64,
}

/// Syscall data from a seccomp notification.
///
/// Mirrors `struct seccomp_data` from `<linux/seccomp.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompData {
    pub nr: i32,
    /// CPU architecture (AUDIT_ARCH_*).
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// A seccomp user notification.
///
/// Mirrors `struct seccomp_notif` from `<linux/seccomp.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotif {
    pub id: u64,
    /// Pid of the thread that triggered the notification.
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

/// Response to a seccomp notification.
///
/// Mirrors `struct seccomp_notif_resp` from `<linux/seccomp.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    /// Negated errno, or 0.
    pub error: i32,
    pub flags: u32,
}

pub const PROXY_MSG_SIZE: usize = std::mem::size_of::<ProxyHeader>();
pub const NOTIF_SIZE: usize = std::mem::size_of::<SeccompNotif>();
pub const RESP_SIZE: usize = std::mem::size_of::<SeccompNotifResp>();
/// Minimum valid frame: header + notif + resp, no cookie.
pub const MSG_SIZE_MIN: usize = PROXY_MSG_SIZE + NOTIF_SIZE + RESP_SIZE;
pub const MSG_SIZE_MAX: usize = MSG_SIZE_MIN + SECCOMP_COOKIE_SIZE;

/// One received notification and everything needed to act on it.
///
/// Owns the three out-of-band fds; they are closed when the bundle drops,
/// which happens exactly once per frame after the reply is sent (or the
/// worker bails out).
pub struct NotifyBundle {
    pub ucred: libc::ucred,
    pub header: ProxyHeader,
    pub req: SeccompNotif,
    pub resp: SeccompNotifResp,
    pub cookie: [u8; SECCOMP_COOKIE_SIZE],
    proc_fd: Option<OwnedFd>,
    mem_fd: Option<OwnedFd>,
    notify_fd: Option<OwnedFd>,
}

impl NotifyBundle {
    /// Open handle to `/proc/<monitor_pid>`, or -1 if the sender omitted it.
    pub fn proc_fd(&self) -> RawFd {
        self.proc_fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// Open handle to `/proc/<target_pid>/mem`, or -1.
    pub fn mem_fd(&self) -> RawFd {
        self.mem_fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// The seccomp listener fd the notification arrived on, or -1.
    pub fn notify_fd(&self) -> RawFd {
        self.notify_fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// Mark the response as "continue": the kernel runs the original
    /// syscall as though it had never been intercepted.
    pub fn set_continue(&mut self) {
        self.resp.flags |= SECCOMP_USER_NOTIF_FLAG_CONTINUE;
    }

    /// Check the frame against the sizes cached at supervisor start.
    pub fn is_valid(&self, received: usize, expected: &NotifSizes) -> bool {
        if received < MSG_SIZE_MIN {
            tracing::warn!(
                pid = self.ucred.pid,
                received,
                "Incomplete seccomp proxy message"
            );
            return false;
        }

        if self.header.reserved != 0 {
            tracing::warn!(
                pid = self.ucred.pid,
                "Non-zero reserved field in seccomp proxy message"
            );
            return false;
        }

        if self.header.sizes != *expected {
            tracing::warn!(
                pid = self.ucred.pid,
                got = ?self.header.sizes,
                want = ?expected,
                "Seccomp client uses different notification structure sizes"
            );
            return false;
        }

        true
    }
}

#[cfg(test)]
impl NotifyBundle {
    pub(crate) fn for_tests(
        req: SeccompNotif,
        mem_fd: Option<OwnedFd>,
        notify_fd: Option<OwnedFd>,
    ) -> Self {
        NotifyBundle {
            ucred: libc::ucred {
                pid: 1,
                uid: 0,
                gid: 0,
            },
            header: ProxyHeader::default(),
            req,
            resp: SeccompNotifResp::default(),
            cookie: [0u8; SECCOMP_COOKIE_SIZE],
            proc_fd: None,
            mem_fd,
            notify_fd,
        }
    }
}

/// Receive one frame plus its ancillary fds in a single `recvmsg`.
///
/// Returns `Ok(None)` on an orderly EOF. The byte count returned alongside
/// the bundle is the raw payload size, fed into [`NotifyBundle::is_valid`].
pub fn recv_bundle(fd: RawFd, ucred: libc::ucred) -> Result<Option<(NotifyBundle, usize)>> {
    let mut bundle = NotifyBundle {
        ucred,
        header: ProxyHeader::default(),
        req: SeccompNotif::default(),
        resp: SeccompNotifResp::default(),
        cookie: [0u8; SECCOMP_COOKIE_SIZE],
        proc_fd: None,
        mem_fd: None,
        notify_fd: None,
    };

    let mut iov = [
        libc::iovec {
            iov_base: &mut bundle.header as *mut ProxyHeader as *mut libc::c_void,
            iov_len: PROXY_MSG_SIZE,
        },
        libc::iovec {
            iov_base: &mut bundle.req as *mut SeccompNotif as *mut libc::c_void,
            iov_len: NOTIF_SIZE,
        },
        libc::iovec {
            iov_base: &mut bundle.resp as *mut SeccompNotifResp as *mut libc::c_void,
            iov_len: RESP_SIZE,
        },
        libc::iovec {
            iov_base: bundle.cookie.as_mut_ptr() as *mut libc::c_void,
            iov_len: SECCOMP_COOKIE_SIZE,
        },
    ];

    // Room for three SCM_RIGHTS fds.
    let mut cmsg_buf = [0u8; 64];

    // SAFETY: plain zero-initialisation of a C struct.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let bytes = loop {
        // SAFETY: msg points at valid iovecs and control buffer owned by
        // this frame; the kernel fills them in.
        let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }

            return Err(WardenError::Sys {
                call: "recvmsg",
                source: err,
            });
        }

        break n as usize;
    };

    if bytes == 0 {
        return Ok(None);
    }

    let mut fds: Vec<OwnedFd> = Vec::with_capacity(3);

    // SAFETY: CMSG_* walk the control buffer the kernel just filled in;
    // lengths are validated before the data is read.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len =
                    (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / std::mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    if raw >= 0 {
                        fds.push(OwnedFd::from_raw_fd(raw));
                    }
                }
            }

            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    // In-order: proc fd, mem fd, notify fd. Fewer than three is tolerated;
    // emulators then fail their memory accesses and the frame is denied.
    let mut fds = fds.into_iter();
    bundle.proc_fd = fds.next();
    bundle.mem_fd = fds.next();
    bundle.notify_fd = fds.next();

    tracing::debug!(
        proc_fd = bundle.proc_fd(),
        mem_fd = bundle.mem_fd(),
        notify_fd = bundle.notify_fd(),
        "Received seccomp notification fds"
    );

    Ok(Some((bundle, bytes)))
}

/// Send the reply for one frame: header, notification and response iovecs,
/// never the cookie.
pub fn send_reply(fd: RawFd, bundle: &mut NotifyBundle, neg_errno: i32, flags: u32) -> Result<()> {
    bundle.resp.id = bundle.req.id;
    bundle.resp.error = neg_errno;
    bundle.resp.flags |= flags;

    let mut iov = [
        libc::iovec {
            iov_base: &mut bundle.header as *mut ProxyHeader as *mut libc::c_void,
            iov_len: PROXY_MSG_SIZE,
        },
        libc::iovec {
            iov_base: &mut bundle.req as *mut SeccompNotif as *mut libc::c_void,
            iov_len: NOTIF_SIZE,
        },
        libc::iovec {
            iov_base: &mut bundle.resp as *mut SeccompNotifResp as *mut libc::c_void,
            iov_len: RESP_SIZE,
        },
    ];

    // SAFETY: plain zero-initialisation of a C struct.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;

    let bytes = loop {
        // SAFETY: msg points at the three iovecs above, all owned by the
        // bundle for the duration of the call.
        let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                tracing::debug!("Caught EINTR, retrying send");
                continue;
            }

            tracing::debug!(pid = bundle.ucred.pid, err = %err, "Failed reply write");
            return Err(WardenError::SendFailed {
                pid: bundle.ucred.pid,
            });
        }

        break n as usize;
    };

    if bytes != MSG_SIZE_MIN {
        tracing::debug!(pid = bundle.ucred.pid, bytes, "Short reply write");
        return Err(WardenError::SendFailed {
            pid: bundle.ucred.pid,
        });
    }

    tracing::debug!(id = bundle.resp.id, "Sent seccomp notification response");
    Ok(())
}

/// Send a zero-length reply so the runtime's short-read handling applies
/// its default action immediately.
pub fn send_empty(fd: RawFd) {
    // SAFETY: plain zero-initialisation of a C struct.
    let msg: libc::msghdr = unsafe { std::mem::zeroed() };
    // SAFETY: an empty msghdr is a valid zero-iovec message.
    unsafe {
        libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_struct_sizes() {
        // These must match what SECCOMP_GET_NOTIF_SIZES reports.
        assert_eq!(std::mem::size_of::<SeccompData>(), 64);
        assert_eq!(std::mem::size_of::<SeccompNotif>(), 80);
        assert_eq!(std::mem::size_of::<SeccompNotifResp>(), 24);
    }

    #[test]
    fn test_proxy_header_layout() {
        // u64 + 2 x i32 + 3 x u16 + padding + u64 under repr(C).
        assert_eq!(std::mem::size_of::<ProxyHeader>(), 32);
        assert_eq!(MSG_SIZE_MIN, 136);
        assert_eq!(MSG_SIZE_MAX, 200);
    }

    fn test_bundle(received_sizes: NotifSizes, reserved: u64) -> NotifyBundle {
        NotifyBundle {
            ucred: libc::ucred {
                pid: 1,
                uid: 0,
                gid: 0,
            },
            header: ProxyHeader {
                reserved,
                monitor_pid: 100,
                init_pid: 101,
                sizes: received_sizes,
                cookie_len: 0,
            },
            req: SeccompNotif::default(),
            resp: SeccompNotifResp::default(),
            cookie: [0u8; SECCOMP_COOKIE_SIZE],
            proc_fd: None,
            mem_fd: None,
            notify_fd: None,
        }
    }

    fn compiled_sizes() -> NotifSizes {
        NotifSizes {
            seccomp_notif: NOTIF_SIZE as u16,
            seccomp_notif_resp: RESP_SIZE as u16,
            seccomp_data: std::mem::size_of::<SeccompData>() as u16,
        }
    }

    #[test]
    fn test_valid_frame() {
        let bundle = test_bundle(compiled_sizes(), 0);
        assert!(bundle.is_valid(MSG_SIZE_MIN, &compiled_sizes()));
        assert!(bundle.is_valid(MSG_SIZE_MAX, &compiled_sizes()));
    }

    #[test]
    fn test_short_frame_rejected() {
        let bundle = test_bundle(compiled_sizes(), 0);
        assert!(!bundle.is_valid(MSG_SIZE_MIN - 1, &compiled_sizes()));
    }

    #[test]
    fn test_reserved_field_rejected() {
        let bundle = test_bundle(compiled_sizes(), 1);
        assert!(!bundle.is_valid(MSG_SIZE_MIN, &compiled_sizes()));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut sizes = compiled_sizes();
        sizes.seccomp_notif += 8;
        let bundle = test_bundle(sizes, 0);
        assert!(!bundle.is_valid(MSG_SIZE_MIN, &compiled_sizes()));
    }

    #[test]
    fn test_set_continue() {
        let mut bundle = test_bundle(compiled_sizes(), 0);
        bundle.set_continue();
        assert_eq!(bundle.resp.flags, SECCOMP_USER_NOTIF_FLAG_CONTINUE);
    }
}

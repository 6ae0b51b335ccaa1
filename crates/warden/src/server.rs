//! The supervisor socket server.
//!
//! An `AF_UNIX` `SOCK_SEQPACKET` listener accepts one connection per
//! container monitor. Connections are authenticated with `SO_PEERCRED`;
//! each frame is received whole (payload iovecs plus ancillary fds) by a
//! per-connection receiver thread and handed to a dedicated worker thread
//! for emulation, so slow emulations never hold up delivery of further
//! notifications. Responses go back on the same socket; the kernel pairs
//! them to notifications by id, so response order does not matter.
//!
//! Failure policy: a malformed frame gets an empty reply (the runtime's
//! short-read handling then applies its default action) and the
//! connection is closed. A frame for an unknown monitor pid is answered
//! with EPERM, or continued in permissive mode. Per-frame errors never
//! take the supervisor down.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, WardenError};
use crate::frame::{self, NotifyBundle};
use crate::instance::Instance;
use crate::probes::{NotifSizes, RuntimeFeatures};
use crate::syscall;

/// Resolves the instance a notification belongs to from the monitor pid
/// of its proxy header.
pub type FindInstance = dyn Fn(i32) -> Result<Arc<dyn Instance>> + Send + Sync;

/// Immutable per-server state shared with every worker.
struct ServerState {
    features: RuntimeFeatures,
    sizes: NotifSizes,
    exec_path: PathBuf,
    find_instance: Box<FindInstance>,
}

/// The seccomp supervisor server.
pub struct Server {
    state: Arc<ServerState>,
    listener: OwnedFd,
    path: PathBuf,
}

fn bind_seqpacket(path: &Path) -> Result<OwnedFd> {
    // Clean up stale sockets from a previous run.
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    // SAFETY: plain socket creation.
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(WardenError::Bind {
            path: path.display().to_string(),
            source: std::io::Error::last_os_error(),
        });
    }

    // SAFETY: fd was just created and is owned from here on.
    let listener = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: plain zero-initialisation of a C struct.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(WardenError::Bind {
            path: path.display().to_string(),
            source: std::io::Error::from_raw_os_error(libc::ENAMETOOLONG),
        });
    }

    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;

    // SAFETY: addr is fully initialised and len covers the used portion.
    let ret = unsafe {
        libc::bind(
            listener.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(WardenError::Bind {
            path: path.display().to_string(),
            source: std::io::Error::last_os_error(),
        });
    }

    // Restrict access before anyone can connect.
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;

    // SAFETY: listener is a bound socket.
    let ret = unsafe { libc::listen(listener.as_raw_fd(), 128) };
    if ret < 0 {
        return Err(WardenError::Bind {
            path: path.display().to_string(),
            source: std::io::Error::last_os_error(),
        });
    }

    Ok(listener)
}

fn peer_ucred(fd: RawFd) -> Result<libc::ucred> {
    // SAFETY: plain zero-initialisation of a C struct.
    let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    // SAFETY: the kernel writes a ucred struct of exactly `len` bytes.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(WardenError::last_os("getsockopt"));
    }

    Ok(ucred)
}

impl Server {
    /// Query the kernel's notification sizes and bind the supervisor
    /// socket at `path` (mode 0700).
    pub fn bind(
        path: &Path,
        features: RuntimeFeatures,
        exec_path: PathBuf,
        find_instance: Box<FindInstance>,
    ) -> Result<Self> {
        let sizes = NotifSizes::query()?;
        let listener = bind_seqpacket(path)?;

        tracing::info!(path = %path.display(), "Seccomp supervisor listening");

        Ok(Self {
            state: Arc::new(ServerState {
                features,
                sizes,
                exec_path,
                find_instance,
            }),
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept connections until the listener fails (normally at shutdown,
    /// when the socket is closed from another thread or process exit).
    pub fn run(&self) -> Result<()> {
        loop {
            // SAFETY: accept4 on our owned listener; the new fd is checked
            // before being wrapped.
            let fd = unsafe {
                libc::accept4(
                    self.listener.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }

                return Err(WardenError::Sys {
                    call: "accept4",
                    source: err,
                });
            }

            // SAFETY: fd was just accepted and is owned from here on.
            let conn = unsafe { OwnedFd::from_raw_fd(fd) };
            let state = Arc::clone(&self.state);
            std::thread::spawn(move || serve_connection(state, conn));
        }
    }

    /// The socket path this server is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Per-connection receive loop: read frames, spawn a worker per frame.
fn serve_connection(state: Arc<ServerState>, conn: OwnedFd) {
    let ucred = match peer_ucred(conn.as_raw_fd()) {
        Ok(ucred) => ucred,
        Err(err) => {
            tracing::error!(err = %err, "Unable to get ucred from seccomp socket client");
            return;
        }
    };

    tracing::debug!(pid = ucred.pid, uid = ucred.uid, "Connected to seccomp socket");

    let conn = Arc::new(conn);
    loop {
        let received = match frame::recv_bundle(conn.as_raw_fd(), ucred) {
            Ok(Some(received)) => received,
            Ok(None) => {
                tracing::debug!(pid = ucred.pid, "Seccomp socket client disconnected");
                return;
            }
            Err(err) => {
                tracing::debug!(pid = ucred.pid, err = %err, "Disconnected from seccomp socket after failed receive");
                return;
            }
        };

        let (bundle, bytes) = received;
        if !bundle.is_valid(bytes, &state.sizes) {
            // The runtime notices the short write and applies its default
            // action, avoiding the kernel-side notification timeout.
            frame::send_empty(conn.as_raw_fd());
            tracing::warn!(pid = ucred.pid, "Closing connection after invalid frame");
            return;
        }

        let state = Arc::clone(&state);
        let conn = Arc::clone(&conn);
        // One OS thread per notification: emulators block on the bridge
        // and the bpf path must stay on a single kernel task.
        std::thread::spawn(move || handle_frame(state, conn, bundle));
    }
}

/// Worker: resolve the instance, emulate, reply exactly once.
fn handle_frame(state: Arc<ServerState>, conn: Arc<OwnedFd>, mut bundle: NotifyBundle) {
    let monitor_pid = bundle.header.monitor_pid;

    let instance = match (state.find_instance)(monitor_pid) {
        Ok(instance) => instance,
        Err(err) => {
            tracing::error!(monitor_pid, err = %err, "Failed to find container for monitor");
            let neg_errno = if state.features.seccomp_listener_continue {
                bundle.set_continue();
                0
            } else {
                -libc::EPERM
            };

            let _ = frame::send_reply(conn.as_raw_fd(), &mut bundle, neg_errno, 0);
            return;
        }
    };

    let mut ctx = syscall::SyscallCtx {
        features: &state.features,
        exec_path: &state.exec_path,
        instance: instance.as_ref(),
        bundle: &mut bundle,
    };

    let neg_errno = syscall::handle(&mut ctx);

    if let Err(err) = frame::send_reply(conn.as_raw_fd(), &mut bundle, neg_errno, 0) {
        tracing::debug!(err = %err, "Failed to send seccomp response");
    }
}

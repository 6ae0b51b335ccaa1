//! Error types for the warden crate.

use thiserror::Error;

/// Errors that can occur in the syscall supervisor.
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Supervisor bind failed on {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to query kernel for seccomp notifier sizes")]
    NotifSizes,

    #[error("Kernel seccomp_notif sizes do not match compiled layout")]
    NotifSizeMismatch,

    #[error("Syscall interception not available: {reason}")]
    InterceptUnsupported { reason: String },

    #[error("Unknown syscall (arch {arch:#x}, nr {nr})")]
    UnknownSyscall { arch: u32, nr: i32 },

    #[error("No instance found for monitor pid {monitor_pid}")]
    InstanceNotFound { monitor_pid: i32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{call} failed: {source}")]
    Sys {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send response to seccomp client {pid}")]
    SendFailed { pid: i32 },

    #[error("Device insertion rejected: {0}")]
    DeviceInsert(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Wrap the current `errno` under the name of the syscall that set it.
    pub(crate) fn last_os(call: &'static str) -> Self {
        WardenError::Sys {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, WardenError>;

//! warden - seccomp syscall supervision for unprivileged containers
//!
//! The kernel refuses to let unprivileged containers perform a handful of
//! syscalls (`mknod`, `setxattr`, `mount`, `sched_setscheduler`,
//! `sysinfo`, parts of `bpf`) that legitimate workloads occasionally
//! need. This crate emulates them from a privileged supervisor using the
//! seccomp user-notification protocol:
//!
//! ```text
//! container --[seccomp filter]--> kernel --[notify fd]--> runtime
//!     runtime --[AF_UNIX SOCK_SEQPACKET + SCM_RIGHTS]--> supervisor
//!         supervisor --[forksyscall bridge]--> container namespaces
//! ```
//!
//! # Components
//!
//! - **Policy** ([`policy`]): compiles instance configuration into the
//!   seccomp program text the runtime loads, including the notify rules
//!   and the anti-escape denials.
//! - **Server** ([`server`]): the supervisor socket; receives framed
//!   notifications with their out-of-band fds and fans each one out to a
//!   worker thread.
//! - **Classification** ([`arch`]): maps `(audit_arch, nr)` pairs onto
//!   logical syscalls across all supported ABIs.
//! - **Emulators** (internal): one per syscall, reading arguments out of
//!   the target's memory with bounded `pread`, re-validating the
//!   notification id before acting, and delegating privileged work to the
//!   forksyscall helper ([`bridge`]).
//!
//! # Security
//!
//! - Every target-memory pointer is untrusted: reads are bounded, writes
//!   re-checked against `SECCOMP_IOCTL_NOTIF_ID_VALID`.
//! - The supervisor never enters container namespaces; only the bridge
//!   child does.
//! - Frames failing size negotiation get an empty reply and the
//!   connection is dropped.

pub mod arch;
pub mod bridge;
pub mod cgroup;
pub mod config;
pub mod error;
pub mod frame;
pub mod idmap;
pub mod instance;
pub mod mem;
pub mod pidfd;
pub mod policy;
pub mod probes;
pub mod server;
mod syscall;

pub use arch::LogicalSyscall;
pub use config::{InstanceConfig, InterceptClass};
pub use error::{Result, WardenError};
pub use idmap::{IdmapEntry, IdmapSet};
pub use instance::{Architecture, IdmapStorageType, Instance, UnixDevice};
pub use probes::{NotifSizes, RuntimeFeatures};
pub use server::{FindInstance, Server};

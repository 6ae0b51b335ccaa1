//! Per-syscall emulators and their dispatcher.
//!
//! Every emulator follows the same contract: it receives the notification
//! bundle and the resolved instance, copies whatever pointer arguments it
//! needs out of the target's memory, validates against the instance's
//! policy, performs the privileged action (usually through the forksyscall
//! bridge) and returns a negative errno or 0. Emulators may additionally
//! set the continue flag on the response, in which case the kernel runs
//! the original syscall in the target.
//!
//! Permissive mode is supervisor-wide: when the runtime supports
//! continuing syscalls, emulation failures turn into "continue" so the
//! target gets the kernel's own verdict instead of a blanket EPERM.

pub(crate) mod bpf;
pub(crate) mod mknod;
pub(crate) mod mount;
pub(crate) mod sched;
pub(crate) mod setxattr;
pub(crate) mod sysinfo;

use std::path::Path;

use crate::arch::{self, LogicalSyscall};
use crate::frame::NotifyBundle;
use crate::instance::Instance;
use crate::mem;
use crate::probes::RuntimeFeatures;

/// Everything an emulator gets to work with.
pub(crate) struct SyscallCtx<'a> {
    pub features: &'a RuntimeFeatures,
    /// The supervisor binary, re-executed for bridge calls.
    pub exec_path: &'a Path,
    pub instance: &'a dyn Instance,
    pub bundle: &'a mut NotifyBundle,
}

impl SyscallCtx<'_> {
    /// Supervisor-wide permissive mode switch.
    pub(crate) fn permissive(&self) -> bool {
        self.features.seccomp_listener_continue
    }
}

/// Classify the frame and run the matching emulator.
pub(crate) fn handle(ctx: &mut SyscallCtx) -> i32 {
    let data = ctx.bundle.req.data;

    let span = tracing::debug_span!(
        "emulate",
        container = ctx.instance.name(),
        project = ctx.instance.project(),
        syscall_number = data.nr,
        audit_architecture = data.arch,
        seccomp_notify_id = ctx.bundle.req.id,
        seccomp_notify_pid = ctx.bundle.req.pid,
        seccomp_notify_fd = ctx.bundle.notify_fd(),
        seccomp_notify_mem_fd = ctx.bundle.mem_fd(),
    );
    let _guard = span.enter();

    match arch::classify(data.arch, data.nr) {
        Ok(LogicalSyscall::Mknod) => mknod::handle_mknod(ctx),
        Ok(LogicalSyscall::Mknodat) => mknod::handle_mknodat(ctx),
        Ok(LogicalSyscall::Setxattr) => setxattr::handle(ctx),
        Ok(LogicalSyscall::Mount) => mount::handle(ctx),
        Ok(LogicalSyscall::Bpf) => bpf::handle(ctx),
        Ok(LogicalSyscall::SchedSetscheduler) => sched::handle(ctx),
        Ok(LogicalSyscall::Sysinfo) => sysinfo::handle(ctx),
        Err(err) => {
            tracing::warn!(err = %err, "Unclassifiable syscall notification");
            -libc::EINVAL
        }
    }
}

/// Fail an emulation: continue in permissive mode, errno otherwise.
pub(crate) fn deny_or_continue(bundle: &mut NotifyBundle, permissive: bool, neg_errno: i32) -> i32 {
    if permissive {
        tracing::debug!("Continuing syscall after failed emulation");
        bundle.set_continue();
        return 0;
    }

    neg_errno
}

/// Re-check that the target thread still sits in this notification.
///
/// Must run after reading the target's memory and before any privileged
/// action or success reply; a dead or recycled target yields the ioctl's
/// errno as the response.
pub(crate) fn revalidate(bundle: &NotifyBundle) -> Result<(), i32> {
    mem::notif_id_valid(bundle.notify_fd(), bundle.req.id).map_err(|err| {
        tracing::debug!(err = %err, "Notification id no longer valid");
        -err.raw_os_error().unwrap_or(libc::EPERM)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::frame::{SeccompData, SeccompNotif, SECCOMP_USER_NOTIF_FLAG_CONTINUE};

    struct TestInstance {
        config: InstanceConfig,
    }

    impl Instance for TestInstance {
        fn name(&self) -> &str {
            "c1"
        }

        fn project(&self) -> &str {
            "default"
        }

        fn expanded_config(&self) -> &InstanceConfig {
            &self.config
        }

        fn is_privileged(&self) -> bool {
            false
        }

        fn architecture(&self) -> crate::instance::Architecture {
            crate::instance::Architecture::X86_64
        }

        fn current_idmap(&self) -> crate::error::Result<crate::idmap::IdmapSet> {
            Ok(crate::idmap::IdmapSet::default())
        }

        fn disk_idmap(&self) -> crate::error::Result<Option<crate::idmap::IdmapSet>> {
            Ok(None)
        }

        fn idmapped_storage(
            &self,
            _path: &str,
            _fstype: &str,
        ) -> crate::instance::IdmapStorageType {
            crate::instance::IdmapStorageType::None
        }

        fn insert_unix_device(
            &self,
            _prefix: &str,
            _device: &crate::instance::UnixDevice,
            _pid: i32,
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn bundle_for(arch: u32, nr: i32, args: [u64; 6]) -> NotifyBundle {
        NotifyBundle::for_tests(
            SeccompNotif {
                id: 7,
                pid: std::process::id(),
                flags: 0,
                data: SeccompData {
                    nr,
                    arch,
                    instruction_pointer: 0,
                    args,
                },
            },
            None,
            None,
        )
    }

    #[test]
    fn test_unknown_syscall_is_einval() {
        let features = RuntimeFeatures::default();
        let instance = TestInstance {
            config: InstanceConfig::default(),
        };
        let mut bundle = bundle_for(0xDEAD_BEEF, 42, [0; 6]);

        let mut ctx = SyscallCtx {
            features: &features,
            exec_path: Path::new("/nonexistent"),
            instance: &instance,
            bundle: &mut bundle,
        };
        assert_eq!(handle(&mut ctx), -libc::EINVAL);
        assert_eq!(bundle.resp.flags, 0);
    }

    #[test]
    fn test_disallowed_mknod_dispatches_and_denies() {
        // x86_64 mknod of /dev/sda: the emulator runs and rejects the
        // device without ever invoking the bridge.
        let features = RuntimeFeatures::default();
        let instance = TestInstance {
            config: InstanceConfig::default(),
        };
        // SAFETY: pure bit-shuffling macro wrapper.
        let dev = unsafe { libc::makedev(8, 0) };
        let mut bundle = bundle_for(
            crate::arch::AUDIT_ARCH_X86_64,
            133,
            [0, 0o060600, dev, 0, 0, 0],
        );

        let mut ctx = SyscallCtx {
            features: &features,
            exec_path: Path::new("/nonexistent"),
            instance: &instance,
            bundle: &mut bundle,
        };
        assert_eq!(handle(&mut ctx), -libc::EPERM);
        assert_eq!(bundle.resp.flags, 0);
    }

    #[test]
    fn test_permissive_mode_continues_instead() {
        let features = RuntimeFeatures {
            seccomp_listener_continue: true,
            ..Default::default()
        };
        let instance = TestInstance {
            config: InstanceConfig::default(),
        };
        // SAFETY: pure bit-shuffling macro wrapper.
        let dev = unsafe { libc::makedev(8, 0) };
        let mut bundle = bundle_for(
            crate::arch::AUDIT_ARCH_X86_64,
            133,
            [0, 0o060600, dev, 0, 0, 0],
        );

        let mut ctx = SyscallCtx {
            features: &features,
            exec_path: Path::new("/nonexistent"),
            instance: &instance,
            bundle: &mut bundle,
        };
        assert_eq!(handle(&mut ctx), 0);
        assert_eq!(bundle.resp.flags, SECCOMP_USER_NOTIF_FLAG_CONTINUE);
    }
}

//! mknod / mknodat emulation.
//!
//! Only a small allow-set of character devices may be created: overlayfs
//! whiteouts (0:0) and the standard `/dev` nodes every distribution
//! expects. Everything else is denied before any memory is read. Device
//! creation itself happens in the bridge; when the bridge reports
//! `ENOMEDIUM` the node cannot be created in place (for example on a
//! read-only layer) and the device is persisted into the instance's
//! runtime state instead.

use std::ffi::OsString;

use crate::bridge;
use crate::idmap::{self, TaskIds};
use crate::instance::UnixDevice;
use crate::mem;
use crate::pidfd;

use super::{deny_or_continue, revalidate, SyscallCtx};

/// Character devices the container may create.
const ALLOWED_CHAR_DEVICES: [(u32, u32); 8] = [
    (0, 0), // whiteout
    (1, 3), // /dev/null
    (1, 5), // /dev/zero
    (1, 7), // /dev/full
    (1, 8), // /dev/random
    (1, 9), // /dev/urandom
    (5, 0), // /dev/tty
    (5, 1), // /dev/console
];

fn device_allowed(dev: u64, mode: u32) -> bool {
    if mode & libc::S_IFMT != libc::S_IFCHR {
        return false;
    }

    // SAFETY: major/minor are pure bit-shuffling macro wrappers.
    let pair = unsafe { (libc::major(dev), libc::minor(dev)) };
    ALLOWED_CHAR_DEVICES.contains(&pair)
}

pub(crate) fn mknod_bridge_args(
    device: &UnixDevice,
    pid: i32,
    pidfd_slot: i32,
    ids: &TaskIds,
) -> Vec<OsString> {
    bridge::args_of([
        pid.to_string(),
        pidfd_slot.to_string(),
        device.path.clone(),
        device.mode.to_string(),
        device.dev.to_string(),
        ids.uid.to_string(),
        ids.gid.to_string(),
        ids.fsuid.to_string(),
        ids.fsgid.to_string(),
    ])
}

/// Create the device node through the bridge, falling back to persisting
/// it as an instance device when the bridge reports `ENOMEDIUM`.
fn emulate_device_node(ctx: &mut SyscallCtx, device: UnixDevice, pid: i32) -> i32 {
    let Ok(ids) = idmap::task_ids(pid) else {
        return -libc::EPERM;
    };

    let (slot, pidfd) = pidfd::make_for_bridge(pid, ctx.features);
    let args = mknod_bridge_args(&device, pid, slot, &ids);

    let errno = bridge::forksyscall(ctx.exec_path, pidfd.as_ref(), "mknod", &args);
    if errno != -libc::ENOMEDIUM {
        return errno;
    }

    match ctx
        .instance
        .insert_unix_device(&format!("forkmknod.unix.{pid}"), &device, pid)
    {
        Ok(()) => 0,
        Err(err) => {
            tracing::debug!(err = %err, path = %device.path, "Failed to insert unix device");
            -libc::EPERM
        }
    }
}

pub(crate) fn handle_mknod(ctx: &mut SyscallCtx) -> i32 {
    let req = ctx.bundle.req;
    let permissive = ctx.permissive();

    if !device_allowed(req.data.args[2], req.data.args[1] as u32) {
        tracing::debug!("Device not allowed");
        return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
    }

    let path = match mem::read_path(ctx.bundle.mem_fd(), req.data.args[0]) {
        Ok(path) => path,
        Err(err) => {
            tracing::debug!(err = %err, "Failed to read memory for mknod syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    };

    if let Err(neg_errno) = revalidate(ctx.bundle) {
        return neg_errno;
    }

    let device = UnixDevice {
        path,
        mode: req.data.args[1] as u32,
        dev: req.data.args[2],
    };

    tracing::debug!(path = %device.path, mode = device.mode, "Handling mknod syscall");
    emulate_device_node(ctx, device, req.pid as i32)
}

pub(crate) fn handle_mknodat(ctx: &mut SyscallCtx) -> i32 {
    let req = ctx.bundle.req;
    let permissive = ctx.permissive();

    // Truncate before comparing to cope with a 64-bit kernel running a
    // 32-bit container which sign-extends AT_FDCWD differently.
    if req.data.args[0] as i32 != libc::AT_FDCWD {
        tracing::debug!("Non AT_FDCWD mknodat calls are not allowed");
        return deny_or_continue(ctx.bundle, permissive, -libc::EINVAL);
    }

    if !device_allowed(req.data.args[3], req.data.args[2] as u32) {
        tracing::debug!("Device not allowed");
        return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
    }

    let path = match mem::read_path(ctx.bundle.mem_fd(), req.data.args[1]) {
        Ok(path) => path,
        Err(err) => {
            tracing::debug!(err = %err, "Failed to read memory for mknodat syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    };

    if let Err(neg_errno) = revalidate(ctx.bundle) {
        return neg_errno;
    }

    let device = UnixDevice {
        path,
        mode: req.data.args[2] as u32,
        dev: req.data.args[3],
    };

    tracing::debug!(path = %device.path, mode = device.mode, "Handling mknodat syscall");
    emulate_device_node(ctx, device, req.pid as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn makedev(major: u32, minor: u32) -> u64 {
        // SAFETY: pure bit-shuffling macro wrapper.
        unsafe { libc::makedev(major, minor) }
    }

    #[test]
    fn test_standard_devices_allowed() {
        for (major, minor) in [(0, 0), (1, 3), (1, 5), (1, 7), (1, 8), (1, 9), (5, 0), (5, 1)] {
            assert!(
                device_allowed(makedev(major, minor), 0o020666),
                "char device {major}:{minor} should be allowed"
            );
        }
    }

    #[test]
    fn test_block_devices_denied() {
        // /dev/sda is a block device; even a listed major:minor pair must
        // not pass with a block mode.
        assert!(!device_allowed(makedev(8, 0), 0o060600));
        assert!(!device_allowed(makedev(1, 3), libc::S_IFBLK | 0o666));
    }

    #[test]
    fn test_unlisted_char_devices_denied() {
        assert!(!device_allowed(makedev(1, 1), 0o020666)); // /dev/mem
        assert!(!device_allowed(makedev(10, 200), 0o020666)); // /dev/net/tun
        assert!(!device_allowed(makedev(4, 0), 0o020666)); // /dev/tty0
    }

    #[test]
    fn test_regular_file_mode_denied() {
        assert!(!device_allowed(makedev(1, 3), 0o100644));
        assert!(!device_allowed(makedev(0, 0), 0o010644)); // fifo
    }

    #[test]
    fn test_bridge_argv_layout() {
        let device = UnixDevice {
            path: "/dev/null".to_string(),
            mode: 0o020666,
            dev: makedev(1, 3),
        };
        let ids = TaskIds {
            uid: 1000000,
            gid: 1000000,
            fsuid: 1000000,
            fsgid: 1000000,
        };

        let args = mknod_bridge_args(&device, 4242, 3, &ids);
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "4242".to_string(),
                "3".to_string(),
                "/dev/null".to_string(),
                0o020666u32.to_string(),
                makedev(1, 3).to_string(),
                "1000000".to_string(),
                "1000000".to_string(),
                "1000000".to_string(),
                "1000000".to_string(),
            ]
        );
    }
}

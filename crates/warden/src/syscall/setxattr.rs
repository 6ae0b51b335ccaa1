//! setxattr emulation.
//!
//! The only attribute emulated today is `trusted.overlay.opaque` with
//! value `y`: an overlayfs whiteout marker, which unprivileged containers
//! legitimately need when deleting directories on overlay layers. Every
//! other attribute is left to the kernel (permissive mode) or denied.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

use crate::bridge;
use crate::idmap;
use crate::mem;
use crate::pidfd;

use super::{deny_or_continue, revalidate, SyscallCtx};

/// Upper bound on the attribute value read out of the target.
const XATTR_VALUE_MAX: usize = 64 * 1024;

/// The overlayfs opaque-directory marker, the one attribute worth
/// emulating with elevated privileges.
fn is_overlay_whiteout(name: &str, value: &[u8]) -> bool {
    name == "trusted.overlay.opaque" && value == b"y"
}

pub(crate) struct SetxattrArgs {
    pub nsuid: i64,
    pub nsgid: i64,
    pub nsfsuid: i64,
    pub nsfsgid: i64,
    pub pid: i32,
    pub path: String,
    pub name: String,
    pub value: Vec<u8>,
    pub flags: i32,
    pub whiteout: bool,
}

pub(crate) fn setxattr_bridge_args(args: &SetxattrArgs, pidfd_slot: i32) -> Vec<OsString> {
    let mut argv = bridge::args_of([
        args.pid.to_string(),
        pidfd_slot.to_string(),
        args.nsuid.to_string(),
        args.nsgid.to_string(),
        args.nsfsuid.to_string(),
        args.nsfsgid.to_string(),
        args.name.clone(),
        args.path.clone(),
        args.flags.to_string(),
        u32::from(args.whiteout).to_string(),
        args.value.len().to_string(),
    ]);
    argv.push(OsString::from_vec(args.value.clone()));
    argv
}

pub(crate) fn handle(ctx: &mut SyscallCtx) -> i32 {
    let req = ctx.bundle.req;
    let permissive = ctx.permissive();
    let pid = req.pid as i32;

    let Ok(ids) = idmap::task_ids(pid) else {
        return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
    };

    let Ok(idmap_set) = ctx.instance.current_idmap() else {
        return deny_or_continue(ctx.bundle, permissive, -libc::EINVAL);
    };

    let (nsuid, nsgid) = idmap_set.shift_from_host(ids.uid, ids.gid);
    let (nsfsuid, nsfsgid) = idmap_set.shift_from_host(ids.fsuid, ids.fsgid);

    let path = match mem::read_path(ctx.bundle.mem_fd(), req.data.args[0]) {
        Ok(path) => path,
        Err(err) => {
            tracing::debug!(err = %err, "Failed to read memory for setxattr syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    };

    let name = match mem::read_path(ctx.bundle.mem_fd(), req.data.args[1]) {
        Ok(name) => name,
        Err(err) => {
            tracing::debug!(err = %err, "Failed to read memory for setxattr syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    };

    let size = (req.data.args[3] as usize).min(XATTR_VALUE_MAX);
    let mut value = vec![0u8; size];
    if size > 0 {
        if let Err(err) = mem::read_exact_at(ctx.bundle.mem_fd(), &mut value, req.data.args[2]) {
            tracing::debug!(err = %err, "Failed to read memory for setxattr syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    }

    if let Err(neg_errno) = revalidate(ctx.bundle) {
        return neg_errno;
    }

    let whiteout = is_overlay_whiteout(&name, &value);
    if !whiteout {
        // Nothing else is emulated; hand the attribute to the kernel when
        // we can, deny otherwise.
        return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
    }

    let args = SetxattrArgs {
        nsuid,
        nsgid,
        nsfsuid,
        nsfsgid,
        pid,
        path,
        name,
        value,
        flags: req.data.args[4] as i32,
        whiteout,
    };

    tracing::debug!(path = %args.path, name = %args.name, "Handling setxattr syscall");

    let (slot, pidfd) = pidfd::make_for_bridge(pid, ctx.features);
    bridge::forksyscall(
        ctx.exec_path,
        pidfd.as_ref(),
        "setxattr",
        &setxattr_bridge_args(&args, slot),
    )
}

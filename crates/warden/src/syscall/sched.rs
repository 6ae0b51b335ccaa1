//! sched_setscheduler emulation.
//!
//! Restricted to namespace root: the caller's host credentials, shifted
//! into the container's namespace, must be uid/gid 0. The target pid in
//! the syscall arguments is relative to the container's pid namespace
//! except for the 0 shorthand ("myself"), which gets rewritten to the
//! caller's host pid with the namespace switch disabled.

use std::ffi::OsString;

use crate::bridge;
use crate::idmap;
use crate::mem;
use crate::pidfd;

use super::{deny_or_continue, revalidate, SyscallCtx};

/// Mirrors `struct sched_param` from `<sched.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SchedParam {
    sched_priority: libc::c_int,
}

pub(crate) struct SchedSetschedulerArgs {
    pub pid_caller: i32,
    pub pid_target: i32,
    pub switch_pidns: bool,
    pub policy: i32,
    pub priority: i32,
}

/// Validate the raw syscall arguments and resolve the target pid.
///
/// `nsuid`/`nsgid` are the caller's credentials shifted into the
/// container namespace.
fn validate(
    args: &[u64; 6],
    pid_caller: i32,
    nsuid: i64,
    nsgid: i64,
) -> Result<(i32, bool, i32), i32> {
    // Only namespace root may change scheduling attributes.
    if nsuid != 0 || nsgid != 0 {
        return Err(-libc::EINVAL);
    }

    let pid_target = args[0] as i32;
    if pid_target < 0 {
        return Err(-libc::EINVAL);
    }

    let policy = args[1] as i32;
    if policy < 0 {
        return Err(-libc::EINVAL);
    }

    // Zero means the caller wants to change its own attributes; that pid
    // is relative to our namespace, so the bridge must not switch.
    if pid_target == 0 {
        Ok((pid_caller, false, policy))
    } else {
        Ok((pid_target, true, policy))
    }
}

pub(crate) fn sched_bridge_args(args: &SchedSetschedulerArgs, pidfd_slot: i32) -> Vec<OsString> {
    bridge::args_of([
        args.pid_caller.to_string(),
        pidfd_slot.to_string(),
        u32::from(args.switch_pidns).to_string(),
        args.pid_target.to_string(),
        args.policy.to_string(),
        args.priority.to_string(),
    ])
}

pub(crate) fn handle(ctx: &mut SyscallCtx) -> i32 {
    let req = ctx.bundle.req;
    let permissive = ctx.permissive();
    let pid_caller = req.pid as i32;

    let Ok(ids) = idmap::task_ids(pid_caller) else {
        return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
    };

    let Ok(idmap_set) = ctx.instance.current_idmap() else {
        return deny_or_continue(ctx.bundle, permissive, -libc::EINVAL);
    };

    let (nsuid, nsgid) = idmap_set.shift_from_host(ids.uid, ids.gid);

    let (pid_target, switch_pidns, policy) =
        match validate(&req.data.args, pid_caller, nsuid, nsgid) {
            Ok(resolved) => resolved,
            Err(neg_errno) => return deny_or_continue(ctx.bundle, permissive, neg_errno),
        };

    let param: SchedParam = match mem::read_struct(ctx.bundle.mem_fd(), req.data.args[2]) {
        Ok(param) => param,
        Err(err) => {
            tracing::debug!(err = %err, "Failed to read memory for sched_setscheduler syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    };

    if let Err(neg_errno) = revalidate(ctx.bundle) {
        return neg_errno;
    }

    let args = SchedSetschedulerArgs {
        pid_caller,
        pid_target,
        switch_pidns,
        policy,
        priority: param.sched_priority,
    };

    tracing::debug!(
        pid_target = args.pid_target,
        policy = args.policy,
        priority = args.priority,
        "Handling sched_setscheduler syscall"
    );

    let (slot, pidfd) = pidfd::make_for_bridge(pid_caller, ctx.features);
    bridge::forksyscall(
        ctx.exec_path,
        pidfd.as_ref(),
        "sched_setscheduler",
        &sched_bridge_args(&args, slot),
    )
}

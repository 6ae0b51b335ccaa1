//! mount emulation.
//!
//! The policy only notifies for flag combinations that would create a new
//! superblock; remounts, binds, moves and propagation changes never reach
//! us. What does arrive is checked against the instance's mount
//! sub-policy: filesystems may be mounted natively (allow-list) or through
//! a FUSE binary, in which case the kernel mount flags get translated into
//! their userspace option-string equivalents. hugetlbfs additionally gets
//! uid/gid options fixed up so the mount is usable from an unprivileged
//! container.

use std::ffi::OsString;

use crate::bridge;
use crate::config::InstanceConfig;
use crate::idmap::IdmapSet;
use crate::instance::{IdmapStorageType, Instance};
use crate::mem;
use crate::pidfd;

use super::{deny_or_continue, revalidate, SyscallCtx};

const MS_RDONLY: u64 = libc::MS_RDONLY as u64;
const MS_NOSUID: u64 = libc::MS_NOSUID as u64;
const MS_NODEV: u64 = libc::MS_NODEV as u64;
const MS_NOEXEC: u64 = libc::MS_NOEXEC as u64;
const MS_SYNCHRONOUS: u64 = libc::MS_SYNCHRONOUS as u64;
const MS_REMOUNT: u64 = libc::MS_REMOUNT as u64;
const MS_MANDLOCK: u64 = libc::MS_MANDLOCK as u64;
const MS_NOATIME: u64 = libc::MS_NOATIME as u64;
const MS_NODIRATIME: u64 = libc::MS_NODIRATIME as u64;
const MS_BIND: u64 = libc::MS_BIND as u64;
const MS_REC: u64 = libc::MS_REC as u64;
const MS_STRICTATIME: u64 = libc::MS_STRICTATIME as u64;
const MS_LAZYTIME: u64 = 1 << 25;
const MS_MGC_MSK: u64 = 0xffff_0000;
const MS_RBIND: u64 = MS_BIND | MS_REC;

const KNOWN_FLAGS: u64 = MS_BIND
    | MS_LAZYTIME
    | MS_MANDLOCK
    | MS_NOATIME
    | MS_NODEV
    | MS_NODIRATIME
    | MS_NOEXEC
    | MS_NOSUID
    | MS_REMOUNT
    | MS_RDONLY
    | MS_STRICTATIME
    | MS_SYNCHRONOUS;
const KNOWN_FLAGS_RECURSIVE: u64 = KNOWN_FLAGS | MS_REC;

fn flag_opt(flag: u64) -> Option<&'static str> {
    Some(match flag {
        MS_BIND => "bind",
        MS_RBIND => "rbind",
        MS_LAZYTIME => "lazytime",
        MS_MANDLOCK => "mand",
        MS_NOATIME => "noatime",
        MS_NODEV => "nodev",
        MS_NODIRATIME => "nodiratime",
        MS_NOEXEC => "noexec",
        MS_NOSUID => "nosuid",
        MS_REMOUNT => "remount",
        MS_RDONLY => "ro",
        MS_STRICTATIME => "strictatime",
        MS_SYNCHRONOUS => "sync",
        _ => return None,
    })
}

/// Translate kernel mount flags into a userspace mount option string.
///
/// A lone `MS_REC` (without `MS_BIND`) has no option equivalent and is
/// dropped; recursion without a bind does not create a superblock, so the
/// profile never notifies for it anyway.
pub(crate) fn mount_flags_to_opts(flags: u64) -> String {
    let ms_rec = flags & MS_REC;
    let flags = flags & !MS_REC;
    let mut opts: Vec<&str> = Vec::new();

    for bit in 0..31 {
        let mut flag = 1u64 << bit;
        if flags & flag == 0 {
            continue;
        }

        if flag == MS_BIND && ms_rec != 0 {
            flag |= MS_REC;
        }

        if let Some(opt) = flag_opt(flag) {
            opts.push(opt);
        }
    }

    opts.join(",")
}

pub(crate) struct MountArgs {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub flags: u64,
    pub data: String,
    pub pid: i32,
    pub idmap_type: IdmapStorageType,
    pub uid: i64,
    pub gid: i64,
    pub fsuid: i64,
    pub fsgid: i64,
    pub nsuid: i64,
    pub nsgid: i64,
    pub nsfsuid: i64,
    pub nsfsgid: i64,
}

/// Add user namespace root uid and gid to the hugetlbfs mount options so
/// the mount is usable in unprivileged containers. User-supplied numeric
/// ids are shifted out of the container namespace; garbage values leave
/// the options untouched so the kernel can produce its own verdict.
pub(crate) fn hugetlbfs_fixup(
    args: &mut MountArgs,
    idmap: &IdmapSet,
    host_uid: i64,
    host_gid: i64,
) {
    if args.fstype != "hugetlbfs" {
        return;
    }

    if args.data.is_empty() {
        args.data = format!("uid={host_uid},gid={host_gid}");
        return;
    }

    let mut uid_opt: i64 = -1;
    let mut gid_opt: i64 = -1;
    let mut parts: Vec<String> = args.data.split(',').map(str::to_string).collect();

    for part in parts.iter_mut() {
        if let Some(value) = part.strip_prefix("uid=") {
            let Ok(n) = value.parse::<i64>() else {
                return;
            };

            let shifted = idmap.shift_to_host(n, false);
            if shifted < 0 {
                return;
            }

            uid_opt = shifted;
            *part = format!("uid={shifted}");
        } else if let Some(value) = part.strip_prefix("gid=") {
            let Ok(n) = value.parse::<i64>() else {
                return;
            };

            let shifted = idmap.shift_to_host(n, true);
            if shifted < 0 {
                return;
            }

            gid_opt = shifted;
            *part = format!("gid={shifted}");
        }
    }

    if uid_opt == -1 {
        parts.push(format!("uid={host_uid}"));
    }

    if gid_opt == -1 {
        parts.push(format!("gid={host_gid}"));
    }

    args.data = parts.join(",");
    args.idmap_type = IdmapStorageType::None;
}

/// Whether this mount needs an idmapped source, as reported by the
/// instance's storage layer.
fn mount_shift(instance: &dyn Instance, path: &str, fstype: &str) -> IdmapStorageType {
    if !instance.expanded_config().mount_shift() {
        return IdmapStorageType::None;
    }

    match instance.disk_idmap() {
        // Only shift when no persistent on-disk idmap exists.
        Ok(None) => instance.idmapped_storage(path, fstype),
        _ => IdmapStorageType::None,
    }
}

/// Look up the fstype in the instance's mount filter.
///
/// `Some("")` means natively allowed, `Some(binary)` means FUSE-delegated,
/// `None` means not permitted.
fn mount_valid(config: &InstanceConfig, fstype: &str) -> Option<String> {
    config.mount_filter().ok()?.get(fstype).cloned()
}

pub(crate) fn native_bridge_args(args: &MountArgs, pidfd_slot: i32) -> Vec<OsString> {
    bridge::args_of([
        args.pid.to_string(),
        pidfd_slot.to_string(),
        "0".to_string(),
        args.source.clone(),
        args.target.clone(),
        args.fstype.clone(),
        args.flags.to_string(),
        args.idmap_type.as_arg().to_string(),
        args.uid.to_string(),
        args.gid.to_string(),
        args.fsuid.to_string(),
        args.fsgid.to_string(),
        args.nsuid.to_string(),
        args.nsgid.to_string(),
        args.nsfsuid.to_string(),
        args.nsfsgid.to_string(),
        args.data.clone(),
    ])
}

pub(crate) fn fuse_bridge_args(
    args: &MountArgs,
    pidfd_slot: i32,
    fuse_source: &str,
    fuse_opts: &str,
) -> Vec<OsString> {
    bridge::args_of([
        args.pid.to_string(),
        pidfd_slot.to_string(),
        "1".to_string(),
        args.uid.to_string(),
        args.gid.to_string(),
        args.fsuid.to_string(),
        args.fsgid.to_string(),
        fuse_source.to_string(),
        args.target.clone(),
        fuse_opts.to_string(),
    ])
}

/// Combine user-supplied mount data with the translated flag options.
pub(crate) fn fuse_opts(data: &str, add_opts: &str) -> String {
    match (data.is_empty(), add_opts.is_empty()) {
        (false, false) => format!("{data},{add_opts}"),
        (false, true) => data.to_string(),
        (true, false) => add_opts.to_string(),
        (true, true) => String::new(),
    }
}

fn read_optional_path(ctx: &SyscallCtx, addr: u64) -> crate::error::Result<String> {
    if addr == 0 {
        return Ok(String::new());
    }

    mem::read_path(ctx.bundle.mem_fd(), addr)
}

pub(crate) fn handle(ctx: &mut SyscallCtx) -> i32 {
    let req = ctx.bundle.req;
    let permissive = ctx.permissive();
    let pid = req.pid as i32;

    let (pidfd_slot, pidfd) = pidfd::make_for_bridge(pid, ctx.features);

    let source = match read_optional_path(ctx, req.data.args[0]) {
        Ok(s) => s,
        Err(err) => {
            tracing::debug!(err = %err, "Failed to read source path of mount syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    };

    let target = match read_optional_path(ctx, req.data.args[1]) {
        Ok(s) => s,
        Err(err) => {
            tracing::debug!(err = %err, "Failed to read target path of mount syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    };

    let fstype = match read_optional_path(ctx, req.data.args[2]) {
        Ok(s) => s,
        Err(err) => {
            tracing::debug!(err = %err, "Failed to read fstype of mount syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    };

    let data = match read_optional_path(ctx, req.data.args[4]) {
        Ok(s) => s,
        Err(err) => {
            tracing::debug!(err = %err, "Failed to read mount data of mount syscall");
            return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
        }
    };

    // Resolve the source through the target's own root so bind sources
    // inside the container are probed where they actually live.
    let full_source = format!("/proc/{pid}/root/{}", source.trim_start_matches('/'));
    let shift_probe_path = if std::path::Path::new(&full_source).exists() {
        full_source
    } else {
        source.clone()
    };

    let mut args = MountArgs {
        source,
        target,
        fstype,
        flags: req.data.args[3],
        data,
        pid,
        idmap_type: IdmapStorageType::None,
        uid: -1,
        gid: -1,
        fsuid: -1,
        fsgid: -1,
        nsuid: -1,
        nsgid: -1,
        nsfsuid: -1,
        nsfsgid: -1,
    };
    args.idmap_type = mount_shift(ctx.instance, &shift_probe_path, &args.fstype);

    tracing::debug!(
        source = %args.source,
        target = %args.target,
        fstype = %args.fstype,
        flags = args.flags,
        "Handling mount syscall"
    );

    // Prove the target still exists and we may signal it before doing
    // anything on its behalf.
    let alive = pidfd
        .as_ref()
        .is_some_and(|fd| pidfd::send_signal(std::os::fd::AsRawFd::as_raw_fd(fd), 0).is_ok());
    if !alive {
        tracing::debug!("Failed to signal mount target process");
        return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
    }

    let Some(fuse_binary) = mount_valid(ctx.instance.expanded_config(), &args.fstype) else {
        tracing::debug!(fstype = %args.fstype, "Filesystem not in mount allow-list");
        return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
    };

    let Ok(idmap_set) = ctx.instance.current_idmap() else {
        return deny_or_continue(ctx.bundle, permissive, -libc::EINVAL);
    };

    let Ok(ids) = crate::idmap::task_ids(pid) else {
        return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
    };

    args.uid = ids.uid;
    args.gid = ids.gid;
    args.fsuid = ids.fsuid;
    args.fsgid = ids.fsgid;
    (args.nsuid, args.nsgid) = idmap_set.shift_from_host(args.uid, args.gid);
    (args.nsfsuid, args.nsfsgid) = idmap_set.shift_from_host(args.fsuid, args.fsgid);

    let (uid, gid) = (args.uid, args.gid);
    hugetlbfs_fixup(&mut args, &idmap_set, uid, gid);

    if let Err(neg_errno) = revalidate(ctx.bundle) {
        return neg_errno;
    }

    let errno = if !fuse_binary.is_empty() {
        let ignored = args.flags & !(KNOWN_FLAGS_RECURSIVE | MS_MGC_MSK);
        if ignored != 0 {
            tracing::debug!(flags = %format!("{ignored:x}"), "Ignoring mount flags without FUSE equivalent");
        }

        let add_opts = mount_flags_to_opts(args.flags);
        let fuse_source = format!("{fuse_binary}#{}", args.source);
        let opts = fuse_opts(&args.data, &add_opts);

        tracing::debug!(fuse_source = %fuse_source, fuse_opts = %opts, "Delegating mount to FUSE binary");
        bridge::forksyscall(
            ctx.exec_path,
            pidfd.as_ref(),
            "mount",
            &fuse_bridge_args(&args, pidfd_slot, &fuse_source, &opts),
        )
    } else {
        bridge::forksyscall(
            ctx.exec_path,
            pidfd.as_ref(),
            "mount",
            &native_bridge_args(&args, pidfd_slot),
        )
    };

    if errno < 0 {
        return deny_or_continue(ctx.bundle, permissive, errno);
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::IdmapEntry;

    fn plain_args(fstype: &str, data: &str) -> MountArgs {
        MountArgs {
            source: "none".to_string(),
            target: "/mnt".to_string(),
            fstype: fstype.to_string(),
            flags: 0,
            data: data.to_string(),
            pid: 4242,
            idmap_type: IdmapStorageType::Idmapped,
            uid: 1000000,
            gid: 1000000,
            fsuid: 1000000,
            fsgid: 1000000,
            nsuid: 0,
            nsgid: 0,
            nsfsuid: 0,
            nsfsgid: 0,
        }
    }

    fn standard_map() -> IdmapSet {
        IdmapSet {
            entries: vec![
                IdmapEntry {
                    isuid: true,
                    isgid: false,
                    hostid: 1_000_000,
                    nsid: 0,
                    maprange: 65536,
                },
                IdmapEntry {
                    isuid: false,
                    isgid: true,
                    hostid: 1_000_000,
                    nsid: 0,
                    maprange: 65536,
                },
            ],
        }
    }

    #[test]
    fn test_flags_to_opts_single_bits() {
        assert_eq!(mount_flags_to_opts(MS_RDONLY), "ro");
        assert_eq!(mount_flags_to_opts(MS_NOSUID), "nosuid");
        assert_eq!(mount_flags_to_opts(MS_BIND), "bind");
        assert_eq!(mount_flags_to_opts(MS_LAZYTIME), "lazytime");
    }

    #[test]
    fn test_flags_to_opts_combination() {
        assert_eq!(
            mount_flags_to_opts(MS_RDONLY | MS_NOSUID | MS_NODEV | MS_NOEXEC),
            "ro,nosuid,nodev,noexec"
        );
    }

    #[test]
    fn test_recursive_bind_becomes_rbind() {
        assert_eq!(mount_flags_to_opts(MS_BIND | MS_REC), "rbind");
        assert_eq!(mount_flags_to_opts(MS_BIND | MS_REC | MS_RDONLY), "ro,rbind");
    }

    #[test]
    fn test_lone_rec_is_dropped() {
        assert_eq!(mount_flags_to_opts(MS_REC), "");
        assert_eq!(mount_flags_to_opts(MS_REC | MS_RDONLY), "ro");
    }

    #[test]
    fn test_unknown_flags_ignored() {
        // MS_MOVE and the magic bits have no option string.
        assert_eq!(mount_flags_to_opts(0xC0ED_0000 | MS_RDONLY), "ro");
    }

    #[test]
    fn test_fuse_opts_joining() {
        assert_eq!(fuse_opts("", ""), "");
        assert_eq!(fuse_opts("a=1", ""), "a=1");
        assert_eq!(fuse_opts("", "ro"), "ro");
        assert_eq!(fuse_opts("a=1", "ro"), "a=1,ro");
    }

    #[test]
    fn test_hugetlbfs_empty_data_gets_host_ids() {
        let mut args = plain_args("hugetlbfs", "");
        hugetlbfs_fixup(&mut args, &standard_map(), 1000000, 1000000);
        assert_eq!(args.data, "uid=1000000,gid=1000000");
        // Without user options the idmap tag stays as probed.
        assert_eq!(args.idmap_type, IdmapStorageType::Idmapped);
    }

    #[test]
    fn test_hugetlbfs_shifts_user_supplied_ids() {
        let mut args = plain_args("hugetlbfs", "uid=1000,gid=500,pagesize=2M");
        hugetlbfs_fixup(&mut args, &standard_map(), 1000000, 1000000);
        assert_eq!(args.data, "uid=1001000,gid=1000500,pagesize=2M");
        assert_eq!(args.idmap_type, IdmapStorageType::None);
    }

    #[test]
    fn test_hugetlbfs_appends_missing_gid() {
        let mut args = plain_args("hugetlbfs", "uid=0");
        hugetlbfs_fixup(&mut args, &standard_map(), 1000000, 1000000);
        assert_eq!(args.data, "uid=1000000,gid=1000000");
    }

    #[test]
    fn test_hugetlbfs_garbage_left_to_kernel() {
        let mut args = plain_args("hugetlbfs", "uid=banana");
        hugetlbfs_fixup(&mut args, &standard_map(), 1000000, 1000000);
        assert_eq!(args.data, "uid=banana");

        // Ids outside the map shift negative and are rejected the same way.
        let mut args = plain_args("hugetlbfs", "uid=90000");
        hugetlbfs_fixup(&mut args, &standard_map(), 1000000, 1000000);
        assert_eq!(args.data, "uid=90000");
    }

    #[test]
    fn test_non_hugetlbfs_untouched() {
        let mut args = plain_args("ext4", "noatime");
        hugetlbfs_fixup(&mut args, &standard_map(), 1000000, 1000000);
        assert_eq!(args.data, "noatime");
        assert_eq!(args.idmap_type, IdmapStorageType::Idmapped);
    }

    #[test]
    fn test_native_bridge_argv_layout() {
        let mut args = plain_args("ext4", "noatime");
        args.source = "/dev/sdb1".to_string();
        args.flags = MS_RDONLY;

        let argv: Vec<_> = native_bridge_args(&args, 3)
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            vec![
                "4242", "3", "0", "/dev/sdb1", "/mnt", "ext4", "1", "idmapped", "1000000",
                "1000000", "1000000", "1000000", "0", "0", "0", "0", "noatime",
            ]
        );
    }

    #[test]
    fn test_fuse_bridge_argv_layout() {
        let args = plain_args("cifs", "");
        let argv: Vec<_> = fuse_bridge_args(&args, 3, "mount.cifs#//host/share", "ro")
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            vec![
                "4242",
                "3",
                "1",
                "1000000",
                "1000000",
                "1000000",
                "1000000",
                "mount.cifs#//host/share",
                "/mnt",
                "ro",
            ]
        );
    }
}

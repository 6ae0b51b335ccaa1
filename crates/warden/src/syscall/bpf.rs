//! bpf emulation, restricted to cgroup-device programs.
//!
//! Handles `BPF_PROG_LOAD`, `BPF_PROG_ATTACH` and `BPF_PROG_DETACH`, and
//! only for `BPF_PROG_TYPE_CGROUP_DEVICE`/`BPF_CGROUP_DEVICE`; the
//! instance must opt in explicitly. Loads are replayed in the host with
//! the instruction array and license copied out of the target; the
//! resulting program fd is installed back into the target's fd table.
//! Attach and detach duplicate the target's fds into the supervisor with
//! `pidfd_getfd` before replaying the call.
//!
//! Everything here runs on the worker's dedicated OS thread: the sequence
//! pidfd open, liveness checks and the host `bpf()` must stay on one
//! kernel task so the supervisor's capabilities remain attached to it.

use std::os::fd::{AsRawFd, OwnedFd};

use crate::config::is_false_or_empty;
use crate::idmap;
use crate::mem;
use crate::pidfd::{self, PIDFD_THREAD};

use super::{deny_or_continue, revalidate, SyscallCtx};

const BPF_PROG_LOAD: u64 = 5;
const BPF_PROG_ATTACH: u64 = 8;
const BPF_PROG_DETACH: u64 = 9;

const BPF_PROG_TYPE_CGROUP_DEVICE: u32 = 15;
const BPF_CGROUP_DEVICE: u32 = 6;

/// Compile-time size of the `bpf_attr` union prefix we understand.
const BPF_ATTR_SIZE: usize = 128;

/// The kernel caps programs at one million instructions; never allocate
/// more than that on a container's say-so.
const BPF_MAX_INSNS: u32 = 1_000_000;

const BPF_INSN_SIZE: usize = 8;
const BPF_LOG_BUF_SIZE: usize = 4096;
const BPF_LICENSE_SIZE: usize = 128;

/// `BPF_PROG_LOAD` prefix of `union bpf_attr`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BpfProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; 16],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

/// `BPF_PROG_ATTACH`/`DETACH` prefix of `union bpf_attr`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BpfAttachAttr {
    target_fd: u32,
    attach_bpf_fd: u32,
    attach_type: u32,
    attach_flags: u32,
    replace_bpf_fd: u32,
}

fn read_prefix<T: Copy + Default>(raw: &[u8]) -> T {
    let mut value = T::default();
    let len = std::mem::size_of::<T>().min(raw.len());
    // SAFETY: both sides are plain repr(C) data and len is bounded by the
    // destination size.
    unsafe {
        std::ptr::copy_nonoverlapping(raw.as_ptr(), &mut value as *mut T as *mut u8, len);
    }
    value
}

fn write_prefix<T: Copy>(raw: &mut [u8], value: &T) {
    let len = std::mem::size_of::<T>().min(raw.len());
    // SAFETY: see read_prefix.
    unsafe {
        std::ptr::copy_nonoverlapping(value as *const T as *const u8, raw.as_mut_ptr(), len);
    }
}

fn sys_bpf(cmd: u64, attr: &[u8], size: usize) -> i64 {
    // SAFETY: attr points at a readable buffer of at least `size` bytes;
    // the kernel copies it in before validating.
    unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd as libc::c_int,
            attr.as_ptr() as *const libc::c_void,
            size,
        ) as i64
    }
}

/// Mirrors `struct seccomp_notif_addfd` from `<linux/seccomp.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SeccompNotifAddfd {
    id: u64,
    flags: u32,
    srcfd: u32,
    newfd: u32,
    newfd_flags: u32,
}

/// Install `fd` into the target's fd table, returning the injected fd
/// number.
fn install_fd(notify_fd: i32, id: u64, fd: &OwnedFd) -> std::io::Result<i32> {
    let addfd = SeccompNotifAddfd {
        id,
        flags: 0,
        srcfd: fd.as_raw_fd() as u32,
        newfd: 0,
        newfd_flags: 0,
    };

    // SAFETY: the addfd struct is fully initialised and only read by the
    // kernel.
    let ret = unsafe {
        libc::ioctl(
            notify_fd,
            mem::SECCOMP_IOCTL_NOTIF_ADDFD,
            &addfd as *const SeccompNotifAddfd,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(ret)
}

struct BpfCallInfo {
    cmd: i64,
    prog_type: i64,
    attach_type: i64,
}

fn open_target_pidfd(pid_target: i32, tgid: i32, use_thread_pidfd: bool) -> Option<OwnedFd> {
    if use_thread_pidfd {
        pidfd::open(pid_target, PIDFD_THREAD).ok()
    } else {
        pidfd::open(tgid, 0).ok()
    }
}

/// Replay the intercepted bpf call in the host. Returns a negative errno
/// on failure; on success resp.val already carries the injected fd for
/// `PROG_LOAD`.
///
/// The attribute is validated in full before any pidfd is opened or any
/// privileged call issued, so malformed or out-of-policy requests never
/// touch the target.
fn emulate(ctx: &mut SyscallCtx, tgid: i32, use_thread_pidfd: bool, info: &mut BpfCallInfo) -> i32 {
    let req = ctx.bundle.req;
    let mem_fd = ctx.bundle.mem_fd();
    let pid_target = req.pid as i32;

    let attr_len = req.data.args[2] as usize;
    if attr_len > BPF_ATTR_SIZE {
        return -libc::EFBIG;
    }

    info.cmd = req.data.args[0] as i64;
    if !matches!(
        req.data.args[0],
        BPF_PROG_LOAD | BPF_PROG_ATTACH | BPF_PROG_DETACH
    ) {
        return -libc::EINVAL;
    }

    let mut attr = [0u8; BPF_ATTR_SIZE];
    if let Err(err) = mem::read_exact_at(mem_fd, &mut attr[..attr_len], req.data.args[1]) {
        tracing::debug!(err = %err, "Failed to read bpf attribute");
        return -libc::EPERM;
    }

    match req.data.args[0] {
        BPF_PROG_LOAD => {
            let load: BpfProgLoadAttr = read_prefix(&attr);
            info.prog_type = i64::from(load.prog_type);

            if load.prog_type != BPF_PROG_TYPE_CGROUP_DEVICE {
                return -libc::EINVAL;
            }

            if load.insn_cnt > BPF_MAX_INSNS {
                return -libc::EINVAL;
            }

            let Some(_pidfd) = open_target_pidfd(pid_target, tgid, use_thread_pidfd) else {
                return -libc::ESRCH;
            };

            if let Err(neg_errno) = revalidate(ctx.bundle) {
                return neg_errno;
            }

            let insn_size = load.insn_cnt as usize * BPF_INSN_SIZE;
            let mut insns = vec![0u8; insn_size];
            if let Err(err) = mem::read_exact_at(mem_fd, &mut insns, load.insns) {
                tracing::debug!(err = %err, "Failed to read bpf instructions");
                return -libc::EIO;
            }

            let mut license = [0u8; BPF_LICENSE_SIZE];
            if load.license != 0 {
                if let Err(err) = mem::read_at(mem_fd, &mut license, load.license) {
                    tracing::debug!(err = %err, "Failed to read bpf license");
                    return -libc::EPERM;
                }
            }

            let mut log_buf = vec![0u8; BPF_LOG_BUF_SIZE];
            let mut new_load = load;
            new_load.log_size = load.log_size.min(BPF_LOG_BUF_SIZE as u32);
            if new_load.log_size > 0 {
                new_load.log_buf = log_buf.as_mut_ptr() as u64;
            }

            new_load.insns = insns.as_ptr() as u64;
            new_load.license = license.as_ptr() as u64;

            let mut new_attr = [0u8; BPF_ATTR_SIZE];
            write_prefix(&mut new_attr, &new_load);

            let prog_fd = sys_bpf(BPF_PROG_LOAD, &new_attr, BPF_ATTR_SIZE);
            if prog_fd < 0 {
                let saved_errno = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EPERM);

                // Hand the verifier log back so the container sees why its
                // program was rejected.
                if new_load.log_size > 0 {
                    let _ = mem::write_at(
                        mem_fd,
                        &log_buf[..new_load.log_size as usize],
                        load.log_buf,
                    );
                }

                return -saved_errno;
            }

            // SAFETY: prog_fd is a valid, newly-created descriptor we own.
            let prog_fd =
                unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(prog_fd as i32) };

            match install_fd(ctx.bundle.notify_fd(), req.id, &prog_fd) {
                Ok(injected) => {
                    ctx.bundle.resp.val = i64::from(injected);
                    0
                }
                Err(err) => -err.raw_os_error().unwrap_or(libc::EPERM),
            }
        }
        BPF_PROG_ATTACH | BPF_PROG_DETACH => {
            let mut attach: BpfAttachAttr = read_prefix(&attr);
            info.attach_type = i64::from(attach.attach_type);

            if attach.attach_type != BPF_CGROUP_DEVICE {
                return -libc::EINVAL;
            }

            let Some(pidfd) = open_target_pidfd(pid_target, tgid, use_thread_pidfd) else {
                return -libc::ESRCH;
            };

            if let Err(neg_errno) = revalidate(ctx.bundle) {
                return neg_errno;
            }

            let Ok(target_fd) = pidfd::getfd(pidfd.as_raw_fd(), attach.target_fd) else {
                return -libc::EBADF;
            };

            let Ok(attach_fd) = pidfd::getfd(pidfd.as_raw_fd(), attach.attach_bpf_fd) else {
                return -libc::EBADF;
            };

            if !use_thread_pidfd && tgid != pid_target {
                // The fd numbers were taken from a non-leader thread; they
                // only name the same files if the table is shared and the
                // leader has not been recycled under us.
                if !pidfd::filetable_shared(tgid, pid_target) {
                    return -libc::EINVAL;
                }

                if !pidfd::still_alive(pidfd.as_raw_fd()) {
                    return -libc::EINVAL;
                }
            }

            attach.target_fd = target_fd.as_raw_fd() as u32;
            attach.attach_bpf_fd = attach_fd.as_raw_fd() as u32;
            write_prefix(&mut attr, &attach);

            let ret = sys_bpf(req.data.args[0], &attr, attr_len);
            if ret < 0 {
                return -std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EPERM);
            }

            0
        }
        _ => -libc::EINVAL,
    }
}

pub(crate) fn handle(ctx: &mut SyscallCtx) -> i32 {
    let permissive = ctx.permissive();

    if is_false_or_empty(
        ctx.instance
            .expanded_config()
            .get("security.syscalls.intercept.bpf.devices"),
    ) {
        tracing::debug!("No bpf policy specified");
        return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
    }

    let use_thread_pidfd = ctx.features.pidfds_thread;
    let tgid = if use_thread_pidfd {
        -1
    } else {
        match idmap::find_tgid(ctx.bundle.proc_fd()) {
            Ok(tgid) => tgid,
            Err(err) => {
                tracing::debug!(err = %err, "Could not find thread group leader");
                return deny_or_continue(ctx.bundle, permissive, -libc::EPERM);
            }
        }
    };

    let mut info = BpfCallInfo {
        cmd: -libc::EINVAL as i64,
        prog_type: -libc::EINVAL as i64,
        attach_type: -libc::EINVAL as i64,
    };

    let ret = emulate(ctx, tgid, use_thread_pidfd, &mut info);

    tracing::debug!(
        bpf_cmd = info.cmd,
        bpf_prog_type = info.prog_type,
        bpf_attach_type = info.attach_type,
        "Handled bpf syscall"
    );

    if ret < 0 {
        tracing::debug!(
            err = %std::io::Error::from_raw_os_error(-ret),
            "Failed to emulate bpf syscall"
        );
        return deny_or_continue(ctx.bundle, permissive, ret);
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{NotifyBundle, SeccompData, SeccompNotif};
    use std::io::{Seek, Write};

    #[test]
    fn test_attr_prefix_layouts() {
        // Offsets within union bpf_attr for the commands we replay.
        assert_eq!(std::mem::size_of::<BpfProgLoadAttr>(), 72);
        assert_eq!(std::mem::size_of::<BpfAttachAttr>(), 20);
        assert!(std::mem::size_of::<BpfProgLoadAttr>() <= BPF_ATTR_SIZE);
    }

    #[test]
    fn test_read_prefix_round_trip() {
        let mut raw = [0u8; BPF_ATTR_SIZE];
        let attach = BpfAttachAttr {
            target_fd: 7,
            attach_bpf_fd: 8,
            attach_type: BPF_CGROUP_DEVICE,
            attach_flags: 0,
            replace_bpf_fd: 0,
        };
        write_prefix(&mut raw, &attach);

        let back: BpfAttachAttr = read_prefix(&raw);
        assert_eq!(back.target_fd, 7);
        assert_eq!(back.attach_bpf_fd, 8);
        assert_eq!(back.attach_type, BPF_CGROUP_DEVICE);
    }

    #[test]
    fn test_read_prefix_short_input() {
        let load: BpfProgLoadAttr = read_prefix(&[0u8; 4]);
        assert_eq!(load.prog_type, 0);
        assert_eq!(load.insn_cnt, 0);
    }

    fn request_with_attr(cmd: u64, raw: &[u8; BPF_ATTR_SIZE]) -> NotifyBundle {
        // A temp file stands in for /proc/<pid>/mem: the bpf_attr sits at
        // offset 0x100.
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.as_file_mut()
            .seek(std::io::SeekFrom::Start(0x100))
            .unwrap();
        file.as_file_mut().write_all(raw).unwrap();
        file.flush().unwrap();

        let mem_fd: std::os::fd::OwnedFd = file.reopen().unwrap().into();
        let req = SeccompNotif {
            id: 1,
            pid: std::process::id(),
            flags: 0,
            data: SeccompData {
                nr: 321,
                arch: crate::arch::AUDIT_ARCH_X86_64,
                instruction_pointer: 0,
                args: [cmd, 0x100, BPF_ATTR_SIZE as u64, 0, 0, 0],
            },
        };

        NotifyBundle::for_tests(req, Some(mem_fd), None)
    }

    fn load_request(prog_type: u32, insn_cnt: u32) -> NotifyBundle {
        let attr = BpfProgLoadAttr {
            prog_type,
            insn_cnt,
            ..Default::default()
        };
        let mut raw = [0u8; BPF_ATTR_SIZE];
        write_prefix(&mut raw, &attr);
        request_with_attr(BPF_PROG_LOAD, &raw)
    }

    fn run_emulate(bundle: &mut NotifyBundle) -> i32 {
        let features = crate::probes::RuntimeFeatures::default();
        let instance = test_instance();
        let mut ctx = SyscallCtx {
            features: &features,
            exec_path: std::path::Path::new("/nonexistent"),
            instance: &instance,
            bundle,
        };

        let mut info = BpfCallInfo {
            cmd: 0,
            prog_type: 0,
            attach_type: 0,
        };
        emulate(&mut ctx, -1, true, &mut info)
    }

    #[test]
    fn test_oversized_attr_rejected() {
        let mut bundle = load_request(BPF_PROG_TYPE_CGROUP_DEVICE, 1);
        bundle.req.data.args[2] = (BPF_ATTR_SIZE + 1) as u64;
        assert_eq!(run_emulate(&mut bundle), -libc::EFBIG);
    }

    #[test]
    fn test_unknown_cmd_rejected() {
        let mut bundle = load_request(BPF_PROG_TYPE_CGROUP_DEVICE, 1);
        bundle.req.data.args[0] = 1; // BPF_MAP_CREATE
        assert_eq!(run_emulate(&mut bundle), -libc::EINVAL);
    }

    #[test]
    fn test_non_cgroup_device_prog_rejected() {
        // BPF_PROG_TYPE_SOCKET_FILTER
        let mut bundle = load_request(1, 1);
        assert_eq!(run_emulate(&mut bundle), -libc::EINVAL);
    }

    #[test]
    fn test_instruction_cap_enforced() {
        // One over the kernel's million-instruction cap: rejected before
        // any pidfd or host bpf() activity.
        let mut bundle = load_request(BPF_PROG_TYPE_CGROUP_DEVICE, BPF_MAX_INSNS + 1);
        assert_eq!(run_emulate(&mut bundle), -libc::EINVAL);

        // At the cap the attribute passes validation; emulation then
        // proceeds past the policy checks (and fails later without a real
        // notify fd, with anything but EINVAL).
        let mut bundle = load_request(BPF_PROG_TYPE_CGROUP_DEVICE, BPF_MAX_INSNS);
        assert_ne!(run_emulate(&mut bundle), -libc::EINVAL);
    }

    #[test]
    fn test_non_cgroup_device_attach_rejected() {
        let attach = BpfAttachAttr {
            target_fd: 3,
            attach_bpf_fd: 4,
            attach_type: 1, // BPF_CGROUP_INET_EGRESS
            attach_flags: 0,
            replace_bpf_fd: 0,
        };
        let mut raw = [0u8; BPF_ATTR_SIZE];
        write_prefix(&mut raw, &attach);

        let mut bundle = request_with_attr(BPF_PROG_ATTACH, &raw);
        assert_eq!(run_emulate(&mut bundle), -libc::EINVAL);

        let mut bundle = request_with_attr(BPF_PROG_DETACH, &raw);
        assert_eq!(run_emulate(&mut bundle), -libc::EINVAL);
    }

    struct TestInstance {
        config: crate::config::InstanceConfig,
    }

    fn test_instance() -> TestInstance {
        TestInstance {
            config: crate::config::InstanceConfig::from([(
                "security.syscalls.intercept.bpf.devices",
                "true",
            )]),
        }
    }

    impl crate::instance::Instance for TestInstance {
        fn name(&self) -> &str {
            "c1"
        }

        fn project(&self) -> &str {
            "default"
        }

        fn expanded_config(&self) -> &crate::config::InstanceConfig {
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
}

//! Seccomp policy compilation.
//!
//! Renders an instance's declarative configuration into the line-oriented
//! seccomp program text the container runtime loads at start. Compilation
//! is pure except for the final profile write; compiling the same
//! configuration twice yields byte-identical output.

use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::config::{InstanceConfig, InterceptClass};
use crate::error::{Result, WardenError};
use crate::instance::Instance;
use crate::probes::RuntimeFeatures;

const POLICY_HEADER: &str = "2\n";

const DEFAULT_DENY_POLICY: &str = "\
reject_force_umount  # comment this to allow umount -f;  not recommended
[all]
kexec_load errno 38
open_by_handle_at errno 38
init_module errno 38
finit_module errno 38
delete_module errno 38
";

// 8 == SECCOMP_FILTER_FLAG_NEW_LISTENER
// 2146435072 == SECCOMP_RET_TRACE
//
// A container able to install its own notifying or tracing filter could
// take over supervision of the very syscalls we emulate, so both escape
// hatches get denied whenever interception is active.
const NOTIFY_DISALLOW: &str = "\
seccomp errno 22 [1,2146435072,SCMP_CMP_MASKED_EQ,2146435072]
seccomp errno 22 [1,8,SCMP_CMP_MASKED_EQ,8]
";

// The argument masks match only character (8192) and block (24576) device
// modes under S_IFMT (61440); regular files and fifos never notify.
const NOTIFY_MKNOD: &str = "\
mknod notify [1,8192,SCMP_CMP_MASKED_EQ,61440]
mknod notify [1,24576,SCMP_CMP_MASKED_EQ,61440]
mknodat notify [2,8192,SCMP_CMP_MASKED_EQ,61440]
mknodat notify [2,24576,SCMP_CMP_MASKED_EQ,61440]
";

const NOTIFY_SETXATTR: &str = "setxattr notify [3,1,SCMP_CMP_EQ]\n";

const NOTIFY_SCHED_SETSCHEDULER: &str = "sched_setscheduler notify\n";

const NOTIFY_SYSINFO: &str = "sysinfo notify\n";

// The new mount API keeps state across several syscalls, which this
// supervisor cannot emulate safely, so it is denied outright whenever
// mount interception is on.
const BLOCK_NEW_MOUNT_API: &str = "\
fsopen errno 38
fsconfig errno 38
fsinfo errno 38
fsmount errno 38
fspick errno 38
open_tree errno 38
move_mount errno 38
openat2 errno 38
";

// Only flag combinations that create a new superblock are worth
// intercepting. The mask is the inverse of:
//
//   MS_MGC_VAL | MS_RDONLY | MS_NOSUID | MS_NODEV | MS_NOEXEC |
//   MS_SYNCHRONOUS | MS_MANDLOCK | MS_DIRSYNC | MS_NOATIME |
//   MS_NODIRATIME | MS_REC | MS_VERBOSE | MS_SILENT | MS_POSIXACL |
//   MS_RELATIME | MS_STRICTATIME | MS_LAZYTIME
//
// so remounts, bind mounts, moves and propagation changes pass through
// untouched.
const NOTIFY_MOUNT: &str = "mount notify [3,0,SCMP_CMP_MASKED_EQ,18446744070422410016]\n";

// 5 == BPF_PROG_LOAD
// 8 == BPF_PROG_ATTACH
// 9 == BPF_PROG_DETACH
const NOTIFY_BPF: &str = "\
bpf notify [0,5,SCMP_CMP_EQ]
bpf notify [0,8,SCMP_CMP_EQ]
bpf notify [0,9,SCMP_CMP_EQ]
";

const COMPAT_BLOCKING_POLICY: &str = "\
[{arch}]
compat_sys_rt_sigaction errno 38
stub_x32_rt_sigreturn errno 38
compat_sys_ioctl errno 38
compat_sys_readv errno 38
compat_sys_writev errno 38
compat_sys_recvfrom errno 38
compat_sys_sendmsg errno 38
compat_sys_recvmsg errno 38
stub_x32_execve errno 38
compat_sys_ptrace errno 38
compat_sys_rt_sigpending errno 38
compat_sys_rt_sigtimedwait errno 38
compat_sys_rt_sigqueueinfo errno 38
compat_sys_sigaltstack errno 38
compat_sys_timer_create errno 38
compat_sys_mq_notify errno 38
compat_sys_kexec_load errno 38
compat_sys_waitid errno 38
compat_sys_set_robust_list errno 38
compat_sys_get_robust_list errno 38
compat_sys_vmsplice errno 38
compat_sys_move_pages errno 38
compat_sys_preadv64 errno 38
compat_sys_pwritev64 errno 38
compat_sys_rt_tgsigqueueinfo errno 38
compat_sys_recvmmsg errno 38
compat_sys_sendmmsg errno 38
compat_sys_process_vm_readv errno 38
compat_sys_process_vm_writev errno 38
compat_sys_setsockopt errno 38
compat_sys_getsockopt errno 38
compat_sys_io_setup errno 38
compat_sys_io_submit errno 38
stub_x32_execveat errno 38
";

/// Whether the instance needs any generated policy at all.
pub fn needs_policy(config: &InstanceConfig) -> bool {
    if config.raw_seccomp().is_some()
        || config.syscalls_allow().is_some()
        || config.syscalls_deny().is_some()
    {
        return true;
    }

    if config.deny_compat() || config.intercept_any() {
        return true;
    }

    // deny_default defaults to true, so only an explicit false opts out.
    !config.deny_default_is_set() || config.deny_default()
}

/// Whether the instance needs syscall interception, verifying that the
/// runtime actually supports what each enabled category requires.
///
/// # Errors
///
/// Returns a descriptive error when a category is enabled but a required
/// capability (notify, continue, addfd) is missing; profile compilation
/// refuses to proceed in that case.
pub fn needs_intercept(features: &RuntimeFeatures, instance: &dyn Instance) -> Result<bool> {
    if instance.is_privileged() {
        return Ok(false);
    }

    let config = instance.expanded_config();
    let mut needed = false;

    for class in InterceptClass::ALL {
        if !config.intercept(class) {
            continue;
        }

        if !features.seccomp_listener {
            return Err(WardenError::InterceptUnsupported {
                reason: format!(
                    "{} requires seccomp notify support in the container runtime",
                    class.config_key()
                ),
            });
        }

        if matches!(class, InterceptClass::Mount | InterceptClass::Bpf)
            && !features.seccomp_listener_continue
        {
            return Err(WardenError::InterceptUnsupported {
                reason: format!(
                    "{} requires support for continuing syscalls",
                    class.config_key()
                ),
            });
        }

        if class == InterceptClass::Bpf && !features.seccomp_listener_addfd {
            return Err(WardenError::InterceptUnsupported {
                reason: format!(
                    "{} requires support for adding file descriptors",
                    class.config_key()
                ),
            });
        }

        needed = true;
    }

    Ok(needed)
}

/// Render the seccomp program for one instance.
pub fn policy_content(features: &RuntimeFeatures, instance: &dyn Instance) -> Result<String> {
    let config = instance.expanded_config();

    // Full policy override.
    if let Some(raw) = config.raw_seccomp() {
        return Ok(raw.to_string());
    }

    let mut policy = String::from(POLICY_HEADER);
    let allowlist = config.syscalls_allow();

    if let Some(allowlist) = allowlist {
        if features.allow_deny_syntax {
            policy.push_str("allowlist\n[all]\n");
        } else {
            policy.push_str("whitelist\n[all]\n");
        }

        policy.push_str(allowlist);
    } else {
        if features.allow_deny_syntax {
            policy.push_str("denylist\n[all]\n");
        } else {
            policy.push_str("blacklist\n[all]\n");
        }

        if config.deny_default() {
            policy.push_str(DEFAULT_DENY_POLICY);
        }
    }

    // Syscall interception.
    if needs_intercept(features, instance)? {
        // Prevent the container from overriding our syscall supervision.
        policy.push_str(NOTIFY_DISALLOW);

        if config.intercept(InterceptClass::Mknod) {
            policy.push_str(NOTIFY_MKNOD);
        }

        if config.intercept(InterceptClass::SchedSetscheduler) {
            policy.push_str(NOTIFY_SCHED_SETSCHEDULER);
        }

        if config.intercept(InterceptClass::Setxattr) {
            policy.push_str(NOTIFY_SETXATTR);
        }

        if config.intercept(InterceptClass::Sysinfo) {
            policy.push_str(NOTIFY_SYSINFO);
        }

        if config.intercept(InterceptClass::Mount) {
            policy.push_str(NOTIFY_MOUNT);
            policy.push_str(BLOCK_NEW_MOUNT_API);
        }

        if config.intercept(InterceptClass::Bpf) {
            policy.push_str(NOTIFY_BPF);
        }
    }

    if allowlist.is_some() {
        return Ok(policy);
    }

    // Additional deny entries.
    if config.deny_compat() {
        policy.push_str(&COMPAT_BLOCKING_POLICY.replace("{arch}", instance.architecture().name()));
    }

    if let Some(denylist) = config.syscalls_deny() {
        policy.push_str(denylist);
    }

    Ok(policy)
}

/// Path of the profile file for one instance.
///
/// Instances in the default project keep their bare name; others are
/// prefixed with the project.
pub fn profile_path(state_dir: &Path, instance: &dyn Instance) -> PathBuf {
    let file = if instance.project() == "default" {
        instance.name().to_string()
    } else {
        format!("{}_{}", instance.project(), instance.name())
    };

    state_dir.join("security").join("seccomp").join(file)
}

/// Compile and write the profile file consumed by the container runtime.
///
/// Profiles are unloaded by the kernel when the task dies, so there is
/// nothing to cache or invalidate; the file is simply rewritten.
pub fn write_profile(
    state_dir: &Path,
    features: &RuntimeFeatures,
    instance: &dyn Instance,
) -> Result<()> {
    if !needs_policy(instance.expanded_config()) {
        return Ok(());
    }

    let profile = policy_content(features, instance)?;
    let path = profile_path(state_dir, instance);

    if let Some(dir) = path.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);

    use std::io::Write;
    let mut file = options.open(&path)?;
    file.write_all(profile.as_bytes())?;

    tracing::debug!(path = %path.display(), "Wrote seccomp profile");
    Ok(())
}

/// Remove the profile file. Never started instances have none; that is
/// not an error.
pub fn delete_profile(state_dir: &Path, instance: &dyn Instance) {
    let _ = std::fs::remove_file(profile_path(state_dir, instance));
}

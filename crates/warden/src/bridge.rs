//! Invocation of the forksyscall helper.
//!
//! The helper is the only component that enters the container's
//! namespaces; the supervisor itself never does. It is re-executed from
//! the supervisor's own binary with a fixed positional argv, inherits the
//! target's pidfd at fd slot 3, and reports failure as a bare numeric
//! errno on stderr. `ENOANO` and anything unparsable collapse to `EPERM`
//! so a confused helper can never grant more than a clean denial.

use std::ffi::OsString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::{Command, Stdio};

/// The fd slot the helper expects the target pidfd on.
const PIDFD_SLOT: i32 = 3;

/// Run `<exec> forksyscall <subcommand> <args...>`.
///
/// Returns 0 on success or a negative errno. All failure modes of the
/// invocation itself (spawn failure, signal death, garbage on stderr)
/// collapse to `-EPERM`.
pub fn forksyscall(
    exec: &Path,
    pidfd: Option<&OwnedFd>,
    subcommand: &str,
    args: &[OsString],
) -> i32 {
    let mut command = Command::new(exec);
    command
        .arg("forksyscall")
        .arg(subcommand)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    if let Some(pidfd) = pidfd {
        let raw = pidfd.as_raw_fd();
        // SAFETY: the pre_exec closure runs in the forked child before
        // exec; dup2 is async-signal-safe and clears O_CLOEXEC on the
        // duplicate, which is exactly what fd inheritance needs.
        unsafe {
            std::os::unix::process::CommandExt::pre_exec(&mut command, move || {
                if libc::dup2(raw, PIDFD_SLOT) < 0 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
    }

    let output = match command.output() {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(exec = %exec.display(), subcommand, err = %err, "Failed to spawn forksyscall helper");
            return -libc::EPERM;
        }
    };

    if output.status.success() {
        return 0;
    }

    parse_child_errno(&output.stderr)
}

/// Turn the helper's stderr into a negative errno.
fn parse_child_errno(stderr: &[u8]) -> i32 {
    let text = String::from_utf8_lossy(stderr);
    match text.trim().parse::<i32>() {
        Ok(libc::ENOANO) => -libc::EPERM,
        Ok(errno) if errno > 0 => -errno,
        _ => -libc::EPERM,
    }
}

/// Build the positional argv tail shared by all subcommands.
pub(crate) fn args_of<I, S>(parts: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    parts.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_child_errno() {
        assert_eq!(parse_child_errno(b"13"), -13);
        assert_eq!(parse_child_errno(b"13\n"), -13);
        assert_eq!(parse_child_errno(b"  1 "), -1);
    }

    #[test]
    fn test_enoano_collapses_to_eperm() {
        assert_eq!(
            parse_child_errno(libc::ENOANO.to_string().as_bytes()),
            -libc::EPERM
        );
    }

    #[test]
    fn test_garbage_collapses_to_eperm() {
        assert_eq!(parse_child_errno(b""), -libc::EPERM);
        assert_eq!(parse_child_errno(b"not-a-number"), -libc::EPERM);
        assert_eq!(parse_child_errno(b"-5"), -libc::EPERM);
        assert_eq!(parse_child_errno(b"0"), -libc::EPERM);
    }

    #[test]
    fn test_spawn_failure_is_eperm() {
        let ret = forksyscall(
            Path::new("/nonexistent/warden-binary"),
            None,
            "mknod",
            &args_of(["1", "-1", "/dev/null"]),
        );
        assert_eq!(ret, -libc::EPERM);
    }

    #[test]
    fn test_child_errno_via_real_process() {
        use std::os::unix::fs::PermissionsExt;

        // A shell script stands in for the helper: print an errno on
        // stderr and exit non-zero.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("helper.sh");
        std::fs::write(&script, "#!/bin/sh\necho 19 >&2\nexit 1\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let ret = forksyscall(&script, None, "mknod", &args_of(["1"]));
        assert_eq!(ret, -19);
    }

    #[test]
    fn test_success_is_zero() {
        let ret = forksyscall(Path::new("/bin/true"), None, "mknod", &args_of(["1"]));
        assert_eq!(ret, 0);
    }
}

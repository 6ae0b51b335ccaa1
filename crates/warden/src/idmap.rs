//! Uid/gid translation between the container and host namespaces, plus
//! credential lookup for notification target tasks.
//!
//! The id-map is bidirectional: `shift_from_host` turns the host-side ids
//! read out of `/proc/<pid>/status` into container-namespace ids, while
//! `shift_to_host` maps container ids (for example numeric `uid=` mount
//! options supplied by the container) back onto the host. An empty set
//! performs no translation.

use std::io::Read;
use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// One contiguous id-map range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapEntry {
    pub isuid: bool,
    pub isgid: bool,
    /// First id on the host side.
    pub hostid: i64,
    /// First id inside the container namespace.
    pub nsid: i64,
    pub maprange: i64,
}

impl IdmapEntry {
    fn covers_host(&self, id: i64) -> bool {
        id >= self.hostid && id < self.hostid + self.maprange
    }

    fn covers_ns(&self, id: i64) -> bool {
        id >= self.nsid && id < self.nsid + self.maprange
    }
}

/// A full uid/gid map for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapSet {
    pub entries: Vec<IdmapEntry>,
}

impl IdmapSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Map a host-side (uid, gid) pair into the container namespace.
    ///
    /// Unmapped ids become -1. An empty set is the identity map.
    pub fn shift_from_host(&self, uid: i64, gid: i64) -> (i64, i64) {
        if self.is_empty() {
            return (uid, gid);
        }

        (self.host_to_ns(uid, false), self.host_to_ns(gid, true))
    }

    /// Map a container-namespace id onto the host. Unmapped ids become -1.
    pub fn shift_to_host(&self, id: i64, is_gid: bool) -> i64 {
        if self.is_empty() {
            return id;
        }

        for entry in &self.entries {
            if (is_gid && !entry.isgid) || (!is_gid && !entry.isuid) {
                continue;
            }

            if entry.covers_ns(id) {
                return entry.hostid + (id - entry.nsid);
            }
        }

        -1
    }

    fn host_to_ns(&self, id: i64, is_gid: bool) -> i64 {
        for entry in &self.entries {
            if (is_gid && !entry.isgid) || (!is_gid && !entry.isuid) {
                continue;
            }

            if entry.covers_host(id) {
                return entry.nsid + (id - entry.hostid);
            }
        }

        -1
    }
}

/// Host-side credentials of a task, read from `/proc/<pid>/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskIds {
    pub uid: i64,
    pub gid: i64,
    pub fsuid: i64,
    pub fsgid: i64,
}

fn parse_id_line(rest: &str) -> Option<(i64, i64)> {
    // Columns after the label: real, effective, saved, filesystem.
    let mut fields = rest.split_whitespace();
    let _real = fields.next()?;
    let effective = fields.next()?.parse().ok()?;
    let _saved = fields.next()?;
    let fs = fields.next()?.parse().ok()?;
    Some((effective, fs))
}

fn parse_status_ids(status: &str) -> Option<TaskIds> {
    let mut uid = None;
    let mut gid = None;

    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            uid = parse_id_line(rest);
        } else if let Some(rest) = line.strip_prefix("Gid:") {
            gid = parse_id_line(rest);
        }

        if uid.is_some() && gid.is_some() {
            break;
        }
    }

    let (uid, fsuid) = uid?;
    let (gid, fsgid) = gid?;
    Some(TaskIds {
        uid,
        gid,
        fsuid,
        fsgid,
    })
}

/// Read the effective and filesystem uid/gid of a task.
///
/// # Errors
///
/// Returns an error if the task has exited or its status file is
/// malformed.
pub fn task_ids(pid: i32) -> Result<TaskIds> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status"))?;
    parse_status_ids(&status).ok_or_else(|| {
        WardenError::Config(format!("Failed to parse credentials of task {pid}"))
    })
}

/// Find the thread-group leader of the task behind an open `/proc/<pid>`
/// handle.
///
/// Going through the received proc fd rather than a fresh path keeps the
/// lookup immune to pid reuse.
pub fn find_tgid(proc_fd: RawFd) -> Result<i32> {
    // SAFETY: openat with a constant relative path; the returned fd is
    // checked before use and owned by the File below.
    let fd = unsafe {
        libc::openat(
            proc_fd,
            c"status".as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(WardenError::last_os("openat"));
    }

    // SAFETY: fd is valid and owned from here on.
    let mut file = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fd) };
    let mut status = String::new();
    file.read_to_string(&mut status)?;

    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Tgid:") {
            return rest
                .trim()
                .parse()
                .map_err(|_| WardenError::Config("Failed to parse Tgid".to_string()));
        }
    }

    Err(WardenError::Config(
        "No Tgid line in process status".to_string(),
    ))
}

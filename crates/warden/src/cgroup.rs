//! Minimal cgroup v2 counter access for the sysinfo emulator.
//!
//! The supervisor never manages cgroups; it only samples the counters of
//! the container's existing cgroup, resolved from the init process. The
//! unified hierarchy is assumed mounted at `/sys/fs/cgroup`.

use std::path::{Path, PathBuf};

use crate::error::{Result, WardenError};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Counter values parsed out of `memory.stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStat {
    /// Shared memory (tmpfs, shm).
    pub shmem: u64,
    /// Page cache.
    pub cache: u64,
}

/// Read-only view of one container's cgroup.
#[derive(Debug, Clone)]
pub struct CgroupReader {
    base: PathBuf,
}

impl CgroupReader {
    /// Resolve the cgroup of a process, normally the container's init.
    pub fn for_pid(pid: i32) -> Result<Self> {
        let content = std::fs::read_to_string(format!("/proc/{pid}/cgroup"))?;
        let path = parse_cgroup_self(&content).ok_or_else(|| {
            WardenError::Config(format!("No cgroup2 entry for pid {pid}"))
        })?;

        Ok(Self {
            base: Path::new(CGROUP_ROOT).join(path.trim_start_matches('/')),
        })
    }

    #[cfg(test)]
    fn at(base: PathBuf) -> Self {
        Self { base }
    }

    fn read_value(&self, file: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.base.join(file))?)
    }

    /// Read a single-value counter file. "max" yields `None`.
    fn read_counter(&self, file: &str) -> Result<Option<u64>> {
        let value = self.read_value(file)?;
        let value = value.trim();
        if value == "max" {
            return Ok(None);
        }

        value
            .parse()
            .map(Some)
            .map_err(|_| WardenError::Config(format!("Unparsable cgroup counter {file}: {value}")))
    }

    /// Number of tasks in the cgroup.
    pub fn process_count(&self) -> Result<u64> {
        self.read_counter("pids.current")?
            .ok_or_else(|| WardenError::Config("pids.current reported no value".to_string()))
    }

    /// Memory limit; `None` means unlimited.
    pub fn memory_limit(&self) -> Result<Option<u64>> {
        self.read_counter("memory.max")
    }

    pub fn memory_usage(&self) -> Result<u64> {
        Ok(self.read_counter("memory.current")?.unwrap_or(0))
    }

    pub fn memory_stat(&self) -> Result<MemoryStat> {
        let content = self.read_value("memory.stat")?;
        Ok(parse_memory_stat(&content))
    }

    /// Swap limit; `None` means unlimited. Errors when the swap controller
    /// is absent; the caller then skips the swap overlay.
    pub fn swap_limit(&self) -> Result<Option<u64>> {
        self.read_counter("memory.swap.max")
    }

    pub fn swap_usage(&self) -> Result<u64> {
        Ok(self.read_counter("memory.swap.current")?.unwrap_or(0))
    }
}

fn parse_cgroup_self(content: &str) -> Option<&str> {
    // cgroup2 entries look like "0::/payload/c1"; named v1 hierarchies
    // carry a controller list in the second field instead.
    content.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let id = fields.next()?;
        let controllers = fields.next()?;
        let path = fields.next()?;
        (id == "0" && controllers.is_empty()).then_some(path)
    })
}

fn parse_memory_stat(content: &str) -> MemoryStat {
    let mut stat = MemoryStat::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };

        let Ok(value) = value.trim().parse() else {
            continue;
        };

        match key {
            "shmem" => stat.shmem = value,
            // v2 calls the page cache "file"; v1 called it "cache".
            "file" | "cache" => stat.cache = value,
            _ => {}
        }
    }

    stat
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cgroup_self() {
        let content = "3:cpu:/legacy\n0::/payload/c1\n";
        assert_eq!(parse_cgroup_self(content), Some("/payload/c1"));
    }

    #[test]
    fn test_parse_cgroup_self_ignores_v1_rows() {
        assert_eq!(parse_cgroup_self("5:memory:/x\n"), None);
    }

    #[test]
    fn test_parse_memory_stat() {
        let stat = parse_memory_stat("anon 100\nfile 2048\nshmem 512\nslab 9\n");
        assert_eq!(stat.cache, 2048);
        assert_eq!(stat.shmem, 512);
    }

    #[test]
    fn test_counters_from_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pids.current"), "17\n").unwrap();
        std::fs::write(dir.path().join("memory.max"), "max\n").unwrap();
        std::fs::write(dir.path().join("memory.current"), "4096\n").unwrap();

        let cg = CgroupReader::at(dir.path().to_path_buf());
        assert_eq!(cg.process_count().unwrap(), 17);
        assert_eq!(cg.memory_limit().unwrap(), None);
        assert_eq!(cg.memory_usage().unwrap(), 4096);
        assert!(cg.swap_limit().is_err());
    }
}

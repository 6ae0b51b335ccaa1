//! sysinfo emulation.
//!
//! The only emulator that never delegates: the host's own `sysinfo` is
//! used as a baseline, the container's cgroup counters and init process
//! are overlaid on top, and the finished struct is written straight into
//! the target's memory. The reply then carries a plain success without
//! the continue flag, so the target's own syscall never runs.
//!
//! A 32-bit x86 container on a 64-bit kernel gets the i386 struct layout
//! with `mem_unit` 4096, scaling values that no longer fit in 32 bits.

use crate::arch::AUDIT_ARCH_I386;
use crate::cgroup::CgroupReader;
use crate::error::{Result, WardenError};
use crate::instance::Architecture;
use crate::mem;

use super::{revalidate, SyscallCtx};

/// Mirrors the i386 `struct sysinfo` layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Sysinfo32 {
    uptime: i32,
    loads: [u32; 3],
    totalram: u32,
    freeram: u32,
    sharedram: u32,
    bufferram: u32,
    totalswap: u32,
    freeswap: u32,
    procs: u16,
    pad: u16,
    totalhigh: u32,
    freehigh: u32,
    mem_unit: u32,
    _f: [u8; 8],
}

/// Architecture-independent holding place for the instance metrics.
#[derive(Debug, Clone, Copy, Default)]
struct InstanceMetrics {
    uptime: i64,
    procs: u16,
    totalram: u64,
    freeram: u64,
    sharedram: u64,
    bufferram: u64,
    totalswap: u64,
    freeswap: u64,
    unit: u32,
}

impl InstanceMetrics {
    /// Overlay the instance values onto the host baseline.
    fn to_native(self, host: &libc::sysinfo) -> libc::sysinfo {
        let mut info = *host;
        info.uptime = self.uptime as libc::c_long;
        info.procs = self.procs;
        info.totalram = self.totalram as libc::c_ulong;
        info.freeram = self.freeram as libc::c_ulong;
        info.sharedram = self.sharedram as libc::c_ulong;
        info.bufferram = self.bufferram as libc::c_ulong;
        info.totalswap = self.totalswap as libc::c_ulong;
        info.freeswap = self.freeswap as libc::c_ulong;
        info
    }

    /// Produce the i386 layout, scaling memory values by the unit.
    fn to_native32(self, host: &libc::sysinfo) -> Sysinfo32 {
        let unit = u64::from(self.unit.max(1));
        Sysinfo32 {
            uptime: self.uptime as i32,
            loads: [
                host.loads[0] as u32,
                host.loads[1] as u32,
                host.loads[2] as u32,
            ],
            totalram: (self.totalram / unit) as u32,
            freeram: (self.freeram / unit) as u32,
            sharedram: (self.sharedram / unit) as u32,
            bufferram: (self.bufferram / unit) as u32,
            totalswap: (self.totalswap / unit) as u32,
            freeswap: (self.freeswap / unit) as u32,
            procs: self.procs,
            pad: 0,
            totalhigh: 0,
            freehigh: 0,
            mem_unit: self.unit,
            _f: [0u8; 8],
        }
    }
}

/// Start time of a process in clock ticks, from `/proc/<pid>/stat`.
///
/// The comm field may contain spaces and parentheses; everything before
/// the final closing paren is skipped.
fn starttime_ticks(stat: &str) -> Option<i64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // starttime is overall field 22; the fields after comm start at 3.
    rest.split_whitespace().nth(19)?.parse().ok()
}

fn host_bytes(host: &libc::sysinfo, value: libc::c_ulong) -> u64 {
    value as u64 * u64::from(host.mem_unit.max(1))
}

fn collect_metrics(init_pid: i32, unit: u32, host: &libc::sysinfo) -> Result<InstanceMetrics> {
    let mut metrics = InstanceMetrics {
        unit,
        ..Default::default()
    };

    let cg = CgroupReader::for_pid(init_pid)?;

    // Instance uptime: host uptime minus the init process start time.
    let stat = std::fs::read_to_string(format!("/proc/{init_pid}/stat"))?;
    let ticks = starttime_ticks(&stat)
        .ok_or_else(|| WardenError::Config("Failed to parse init process stat".to_string()))?;
    let age = ticks / 100;
    if age > 0 {
        metrics.uptime = (host.uptime as i64).saturating_sub(age);
    }

    let pids = cg.process_count()?;
    metrics.procs = u16::try_from(pids).unwrap_or(u16::MAX);

    let stat = cg.memory_stat()?;
    metrics.sharedram = stat.shmem;
    metrics.bufferram = stat.cache;

    let limit = cg
        .memory_limit()?
        .unwrap_or_else(|| host_bytes(host, host.totalram));
    let usage = cg.memory_usage()?;
    metrics.totalram = limit;
    metrics.freeram = metrics
        .totalram
        .saturating_sub(usage)
        .saturating_sub(metrics.bufferram);

    // Swap counters are optional; without the controller the instance
    // reports no swap at all.
    if let (Ok(swap_limit), Ok(swap_usage)) = (cg.swap_limit(), cg.swap_usage()) {
        metrics.totalswap = swap_limit.unwrap_or_else(|| host_bytes(host, host.totalswap));
        metrics.freeswap = metrics.totalswap.saturating_sub(swap_usage);
    }

    Ok(metrics)
}

fn struct_bytes<T>(value: &T) -> &[u8] {
    // SAFETY: value is a plain repr(C) struct; viewing it as bytes for
    // the duration of the borrow is sound.
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

pub(crate) fn handle(ctx: &mut SyscallCtx) -> i32 {
    let req = ctx.bundle.req;

    // SAFETY: plain zero-initialisation of a C struct.
    let mut host: libc::sysinfo = unsafe { std::mem::zeroed() };
    // SAFETY: the kernel fills in the struct behind the valid pointer.
    if unsafe { libc::sysinfo(&mut host) } != 0 {
        tracing::warn!(
            err = %std::io::Error::last_os_error(),
            "Failed getting host sysinfo"
        );
        ctx.bundle.set_continue();
        return 0;
    }

    // Handle i386 on x86_64.
    let unit = if ctx.instance.architecture() == Architecture::X86_64
        && req.data.arch == AUDIT_ARCH_I386
    {
        4096
    } else {
        1
    };

    let metrics = match collect_metrics(ctx.bundle.header.init_pid, unit, &host) {
        Ok(metrics) => metrics,
        Err(err) => {
            tracing::warn!(err = %err, pid = ctx.bundle.header.init_pid, "Failed collecting instance metrics");
            ctx.bundle.set_continue();
            return 0;
        }
    };

    if let Err(neg_errno) = revalidate(ctx.bundle) {
        return neg_errno;
    }

    // The write must land before the reply; the target reads the struct
    // the moment its syscall returns.
    let result = if unit == 4096 {
        let info = metrics.to_native32(&host);
        mem::write_at(ctx.bundle.mem_fd(), struct_bytes(&info), req.data.args[0])
    } else {
        let info = metrics.to_native(&host);
        mem::write_at(ctx.bundle.mem_fd(), struct_bytes(&info), req.data.args[0])
    };

    if let Err(err) = result {
        tracing::warn!(err = %err, "Failed writing sysinfo result");
        ctx.bundle.set_continue();
        return 0;
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_baseline() -> libc::sysinfo {
        // SAFETY: plain zero-initialisation of a C struct.
        let mut host: libc::sysinfo = unsafe { std::mem::zeroed() };
        host.uptime = 5000;
        host.loads = [65536, 32768, 16384];
        host.totalram = 16 * 1024 * 1024 * 1024;
        host.mem_unit = 1;
        host
    }

    #[test]
    fn test_sysinfo32_layout() {
        // The i386 struct sysinfo is exactly 64 bytes.
        assert_eq!(std::mem::size_of::<Sysinfo32>(), 64);
    }

    #[test]
    fn test_native_overlay_keeps_host_loads() {
        let host = host_baseline();
        let metrics = InstanceMetrics {
            uptime: 123,
            procs: 7,
            totalram: 1 << 30,
            freeram: 1 << 29,
            unit: 1,
            ..Default::default()
        };

        let info = metrics.to_native(&host);
        assert_eq!(info.uptime, 123);
        assert_eq!(info.procs, 7);
        assert_eq!(info.totalram as u64, 1 << 30);
        assert_eq!(info.freeram as u64, 1 << 29);
        assert_eq!(info.loads, host.loads);
    }

    #[test]
    fn test_native32_scales_by_unit() {
        let host = host_baseline();
        let metrics = InstanceMetrics {
            uptime: 900,
            procs: 42,
            totalram: 8 * 1024 * 1024 * 1024,
            freeram: 2 * 1024 * 1024 * 1024,
            sharedram: 4096 * 3,
            bufferram: 4096 * 5,
            unit: 4096,
            ..Default::default()
        };

        let info = metrics.to_native32(&host);
        assert_eq!(info.mem_unit, 4096);
        assert_eq!(info.totalram, (8u64 * 1024 * 1024 * 1024 / 4096) as u32);
        assert_eq!(info.freeram, (2u64 * 1024 * 1024 * 1024 / 4096) as u32);
        assert_eq!(info.sharedram, 3);
        assert_eq!(info.bufferram, 5);
        assert_eq!(info.procs, 42);
        assert_eq!(info.totalhigh, 0);
        assert_eq!(info.uptime, 900);
    }

    #[test]
    fn test_starttime_parsing() {
        let stat = "4242 (init) S 1 4242 4242 0 -1 4194560 1 0 0 0 0 0 0 0 20 0 1 0 123456 1000 200 18446744073709551615";
        assert_eq!(starttime_ticks(stat), Some(123456));
    }

    #[test]
    fn test_starttime_parsing_with_hostile_comm() {
        // comm can contain spaces and parens; only the final paren counts.
        let stat = "4242 (my (we) ird) S 1 4242 4242 0 -1 4194560 1 0 0 0 0 0 0 0 20 0 1 0 99 1000 200 0";
        assert_eq!(starttime_ticks(stat), Some(99));
    }

    #[test]
    fn test_starttime_parsing_garbage() {
        assert_eq!(starttime_ticks("no parens here"), None);
        assert_eq!(starttime_ticks("1 (x) S 1 2"), None);
    }
}

//! The supervisor's view of a container instance.
//!
//! The container lifecycle layer owns instances; the supervisor only needs
//! a narrow capability-style handle resolved per notification. [`Instance`]
//! is that handle. Implementations live outside this crate (the lifecycle
//! layer, or test doubles).

use serde::{Deserialize, Serialize};

use crate::config::InstanceConfig;
use crate::error::Result;
use crate::idmap::IdmapSet;

/// Architecture of the instance, as reported by the lifecycle layer.
///
/// Only used for the compat-deny section name and to detect the 32-bit x86
/// personality in the sysinfo emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86_64,
    I686,
    Aarch64,
    Armv7l,
    Ppc64le,
    S390x,
    Riscv64,
    Mips64,
    Loongarch64,
}

impl Architecture {
    /// Kernel-style architecture name, as used in seccomp policy sections.
    pub fn name(self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::I686 => "i686",
            Architecture::Aarch64 => "aarch64",
            Architecture::Armv7l => "armv7l",
            Architecture::Ppc64le => "ppc64le",
            Architecture::S390x => "s390x",
            Architecture::Riscv64 => "riscv64",
            Architecture::Mips64 => "mips64",
            Architecture::Loongarch64 => "loongarch64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "x86_64" => Architecture::X86_64,
            "i686" | "i386" => Architecture::I686,
            "aarch64" => Architecture::Aarch64,
            "armv7l" => Architecture::Armv7l,
            "ppc64le" => Architecture::Ppc64le,
            "s390x" => Architecture::S390x,
            "riscv64" => Architecture::Riscv64,
            "mips64" => Architecture::Mips64,
            "loongarch64" => Architecture::Loongarch64,
            _ => return None,
        })
    }
}

/// Storage-specific idmapping support for a mount source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdmapStorageType {
    #[default]
    None,
    Idmapped,
}

impl IdmapStorageType {
    /// Bridge argv encoding. The empty string means no idmapped mount.
    pub fn as_arg(self) -> &'static str {
        match self {
            IdmapStorageType::None => "",
            IdmapStorageType::Idmapped => "idmapped",
        }
    }
}

/// A character/block device materialised on behalf of the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnixDevice {
    pub path: String,
    /// Full `mode_t` including the file type bits.
    pub mode: u32,
    /// Raw `dev_t` as passed by the caller.
    pub dev: u64,
}

impl UnixDevice {
    pub fn major(&self) -> u32 {
        // SAFETY: libc::major is a pure bit-shuffling macro wrapper.
        unsafe { libc::major(self.dev) }
    }

    pub fn minor(&self) -> u32 {
        // SAFETY: see major().
        unsafe { libc::minor(self.dev) }
    }
}

/// Capability-style reference to the container a notification belongs to.
///
/// Resolved by the caller-supplied lookup function from the monitor pid of
/// each frame. All methods are read-only from the supervisor's perspective
/// except [`Instance::insert_unix_device`], which persists an on-demand
/// device into the instance's runtime state.
pub trait Instance: Send + Sync {
    fn name(&self) -> &str;

    fn project(&self) -> &str;

    fn expanded_config(&self) -> &InstanceConfig;

    fn is_privileged(&self) -> bool;

    fn architecture(&self) -> Architecture;

    /// The id-map currently applied to the instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance has no usable id-map (for example
    /// while it is being torn down).
    fn current_idmap(&self) -> Result<IdmapSet>;

    /// The id-map persisted on disk, if any.
    fn disk_idmap(&self) -> Result<Option<IdmapSet>>;

    /// Whether the storage backing `path` can provide an idmapped mount for
    /// `fstype`.
    fn idmapped_storage(&self, path: &str, fstype: &str) -> IdmapStorageType;

    /// Persist a device node into the instance's runtime device state.
    ///
    /// Used as the fallback when the bridge reports `ENOMEDIUM` for a
    /// `mknod` emulation.
    fn insert_unix_device(&self, prefix: &str, device: &UnixDevice, pid: i32) -> Result<()>;
}

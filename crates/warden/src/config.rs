//! Instance configuration access.
//!
//! Container configuration reaches the supervisor as an expanded string map
//! (the lifecycle layer owns merging profiles into it). This module wraps
//! that map with typed accessors for the keys the supervisor consumes, and
//! parses the mount interception sub-policy.
//!
//! Several keys have a legacy spelling (`whitelist`/`blacklist`); the newer
//! spelling always wins when both are present.

use std::collections::BTreeMap;

use crate::error::{Result, WardenError};

/// Truthy values accepted in boolean configuration keys.
pub fn is_true(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_ascii_lowercase).as_deref(),
        Some("true" | "1" | "yes" | "on")
    )
}

/// Whether a boolean key is unset, empty, or explicitly false.
pub fn is_false_or_empty(value: Option<&str>) -> bool {
    !is_true(value)
}

/// Syscall categories that can be intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterceptClass {
    Mknod,
    SchedSetscheduler,
    Setxattr,
    Sysinfo,
    Mount,
    Bpf,
}

impl InterceptClass {
    pub const ALL: [InterceptClass; 6] = [
        InterceptClass::Mknod,
        InterceptClass::SchedSetscheduler,
        InterceptClass::Setxattr,
        InterceptClass::Sysinfo,
        InterceptClass::Mount,
        InterceptClass::Bpf,
    ];

    /// The configuration key enabling this category.
    pub fn config_key(self) -> &'static str {
        match self {
            InterceptClass::Mknod => "security.syscalls.intercept.mknod",
            InterceptClass::SchedSetscheduler => "security.syscalls.intercept.sched_setscheduler",
            InterceptClass::Setxattr => "security.syscalls.intercept.setxattr",
            InterceptClass::Sysinfo => "security.syscalls.intercept.sysinfo",
            InterceptClass::Mount => "security.syscalls.intercept.mount",
            InterceptClass::Bpf => "security.syscalls.intercept.bpf",
        }
    }
}

/// Expanded instance configuration.
#[derive(Debug, Clone, Default)]
pub struct InstanceConfig {
    map: BTreeMap<String, String>,
}

impl InstanceConfig {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// First present key wins; used for new/legacy spelling pairs.
    fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    /// Verbatim seccomp policy override, replacing the generated program.
    pub fn raw_seccomp(&self) -> Option<&str> {
        self.get("raw.seccomp").filter(|v| !v.is_empty())
    }

    /// Raw allow-list entries (`security.syscalls.allow`, legacy `whitelist`).
    pub fn syscalls_allow(&self) -> Option<&str> {
        self.first_of(&["security.syscalls.allow", "security.syscalls.whitelist"])
            .filter(|v| !v.is_empty())
    }

    /// Raw deny-list entries (`security.syscalls.deny`, legacy `blacklist`).
    pub fn syscalls_deny(&self) -> Option<&str> {
        self.first_of(&["security.syscalls.deny", "security.syscalls.blacklist"])
            .filter(|v| !v.is_empty())
    }

    /// Whether the baseline denials apply in deny-list mode. Defaults to true.
    pub fn deny_default(&self) -> bool {
        match self.first_of(&[
            "security.syscalls.deny_default",
            "security.syscalls.blacklist_default",
        ]) {
            None => true,
            value => is_true(value),
        }
    }

    /// Whether the key is present at all (needed because the default is true).
    pub fn deny_default_is_set(&self) -> bool {
        self.first_of(&[
            "security.syscalls.deny_default",
            "security.syscalls.blacklist_default",
        ])
        .is_some()
    }

    /// Whether the 32-bit compat entry points get denied.
    pub fn deny_compat(&self) -> bool {
        is_true(self.first_of(&[
            "security.syscalls.deny_compat",
            "security.syscalls.blacklist_compat",
        ]))
    }

    /// Whether a given syscall category is intercepted.
    pub fn intercept(&self, class: InterceptClass) -> bool {
        is_true(self.get(class.config_key()))
    }

    /// Whether any interception category is enabled.
    pub fn intercept_any(&self) -> bool {
        InterceptClass::ALL.iter().any(|c| self.intercept(*c))
    }

    /// Whether the instance opted into cgroup-device bpf emulation.
    pub fn bpf_devices(&self) -> bool {
        is_true(self.get("security.syscalls.intercept.bpf.devices"))
    }

    /// Whether intercepted mounts get idmapped to the container.
    pub fn mount_shift(&self) -> bool {
        is_true(self.get("security.syscalls.intercept.mount.shift"))
    }

    /// Filesystems mountable through the native branch.
    pub fn mount_allowed(&self) -> Vec<&str> {
        if !self.intercept(InterceptClass::Mount) {
            return Vec::new();
        }

        self.get("security.syscalls.intercept.mount.allowed")
            .map(|v| v.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Combined mount filter: fstype to FUSE binary, empty string for
    /// native-allowed filesystems. A filesystem may appear in only one of
    /// the two lists.
    pub fn mount_filter(&self) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();

        if !self.intercept(InterceptClass::Mount) {
            return Ok(map);
        }

        if let Some(fused) = self.get("security.syscalls.intercept.mount.fuse") {
            for entry in fused.split(',').filter(|s| !s.is_empty()) {
                let (fstype, binary) = entry.split_once('=').ok_or_else(|| {
                    WardenError::Config(format!(
                        "security.syscalls.intercept.mount.fuse is not of the form 'filesystem=fuse-binary': {entry}"
                    ))
                })?;

                map.insert(fstype.to_string(), binary.to_string());
            }
        }

        for fstype in self.mount_allowed() {
            if map.get(fstype).is_some_and(|bin| !bin.is_empty()) {
                return Err(WardenError::Config(format!(
                    "Filesystem {fstype} cannot appear in security.syscalls.intercept.mount.allowed and security.syscalls.intercept.mount.fuse"
                )));
            }

            map.insert(fstype.to_string(), String::new());
        }

        Ok(map)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for InstanceConfig {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(is_true(Some("true")));
        assert!(is_true(Some("True")));
        assert!(is_true(Some("1")));
        assert!(is_true(Some("yes")));
        assert!(is_true(Some("on")));
        assert!(!is_true(Some("false")));
        assert!(!is_true(Some("")));
        assert!(!is_true(None));
        assert!(is_false_or_empty(Some("0")));
        assert!(is_false_or_empty(None));
    }

    #[test]
    fn test_legacy_spelling_fallback() {
        let config = InstanceConfig::from([("security.syscalls.whitelist", "mknod\n")]);
        assert_eq!(config.syscalls_allow(), Some("mknod\n"));

        // New spelling wins when both are set.
        let config = InstanceConfig::from([
            ("security.syscalls.allow", "open\n"),
            ("security.syscalls.whitelist", "mknod\n"),
        ]);
        assert_eq!(config.syscalls_allow(), Some("open\n"));
    }

    #[test]
    fn test_deny_default_defaults_to_true() {
        let config = InstanceConfig::default();
        assert!(config.deny_default());
        assert!(!config.deny_default_is_set());

        let config = InstanceConfig::from([("security.syscalls.deny_default", "false")]);
        assert!(!config.deny_default());
        assert!(config.deny_default_is_set());
    }

    #[test]
    fn test_mount_filter_combines_lists() {
        let config = InstanceConfig::from([
            ("security.syscalls.intercept.mount", "true"),
            ("security.syscalls.intercept.mount.allowed", "ext4,xfs"),
            ("security.syscalls.intercept.mount.fuse", "cifs=mount.cifs"),
        ]);

        let filter = config.mount_filter().ok().unwrap();
        assert_eq!(filter.get("ext4").map(String::as_str), Some(""));
        assert_eq!(filter.get("xfs").map(String::as_str), Some(""));
        assert_eq!(filter.get("cifs").map(String::as_str), Some("mount.cifs"));
        assert_eq!(filter.get("nfs"), None);
    }

    #[test]
    fn test_mount_filter_rejects_overlap() {
        let config = InstanceConfig::from([
            ("security.syscalls.intercept.mount", "true"),
            ("security.syscalls.intercept.mount.allowed", "cifs"),
            ("security.syscalls.intercept.mount.fuse", "cifs=mount.cifs"),
        ]);

        assert!(config.mount_filter().is_err());
    }

    #[test]
    fn test_mount_filter_rejects_malformed_fuse_entry() {
        let config = InstanceConfig::from([
            ("security.syscalls.intercept.mount", "true"),
            ("security.syscalls.intercept.mount.fuse", "cifs"),
        ]);

        assert!(config.mount_filter().is_err());
    }

    #[test]
    fn test_mount_filter_empty_without_interception() {
        let config = InstanceConfig::from([("security.syscalls.intercept.mount.allowed", "ext4")]);
        assert!(config.mount_filter().ok().unwrap().is_empty());
        assert!(config.mount_allowed().is_empty());
    }

    #[test]
    fn test_intercept_any() {
        let config = InstanceConfig::from([("security.syscalls.intercept.sysinfo", "true")]);
        assert!(config.intercept_any());
        assert!(config.intercept(InterceptClass::Sysinfo));
        assert!(!config.intercept(InterceptClass::Mount));
    }
}

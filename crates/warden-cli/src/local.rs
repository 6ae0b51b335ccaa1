//! Instance implementation for standalone operation.
//!
//! Carries a configuration assembled from command-line flags. Without a
//! lifecycle daemon there is no id-map and no runtime device state, so
//! the id-map is the identity and device persistence is refused.

use warden::{
    Architecture, IdmapSet, IdmapStorageType, Instance, InstanceConfig, Result, UnixDevice,
    WardenError,
};

pub struct LocalInstance {
    name: String,
    project: String,
    architecture: Architecture,
    privileged: bool,
    config: InstanceConfig,
}

impl LocalInstance {
    pub fn from_args(
        name: &str,
        project: &str,
        arch: &str,
        privileged: bool,
        config_pairs: &[String],
    ) -> std::result::Result<Self, String> {
        let architecture = Architecture::from_name(arch)
            .ok_or_else(|| format!("Unknown architecture: {arch}"))?;

        let pairs = crate::cli::parse_config_pairs(config_pairs)?;

        Ok(Self {
            name: name.to_string(),
            project: project.to_string(),
            architecture,
            privileged,
            config: InstanceConfig::new(pairs.into_iter().collect()),
        })
    }
}

impl Instance for LocalInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn project(&self) -> &str {
        &self.project
    }

    fn expanded_config(&self) -> &InstanceConfig {
        &self.config
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn current_idmap(&self) -> Result<IdmapSet> {
        Ok(IdmapSet::default())
    }

    fn disk_idmap(&self) -> Result<Option<IdmapSet>> {
        Ok(None)
    }

    fn idmapped_storage(&self, _path: &str, _fstype: &str) -> IdmapStorageType {
        IdmapStorageType::None
    }

    fn insert_unix_device(&self, _prefix: &str, _device: &UnixDevice, _pid: i32) -> Result<()> {
        Err(WardenError::DeviceInsert(
            "standalone mode has no runtime device state".to_string(),
        ))
    }
}

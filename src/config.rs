use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::bootctrl::Slot;
use crate::constants::{
    BLOCK_DEV_NAME_MAPPER, DEFAULT_BLOCK_SIZE, RETROFIT_SUPER_BASE_NAME, SUPER_PARTITION_NAME,
};
use crate::error::PlanError;

/// Tri-state device feature flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureFlag {
    #[default]
    Disabled,
    /// the device launched with the feature
    Launch,
    /// the feature was added to a device that launched without it
    Retrofit,
}

impl FeatureFlag {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, FeatureFlag::Disabled)
    }
    pub fn is_launch(&self) -> bool {
        matches!(self, FeatureFlag::Launch)
    }
    pub fn is_retrofit(&self) -> bool {
        matches!(self, FeatureFlag::Retrofit)
    }
}

impl fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", match self {
            FeatureFlag::Disabled => "disabled",
            FeatureFlag::Launch => "launch",
            FeatureFlag::Retrofit => "retrofit",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub dynamic_partitions: FeatureFlag,
    #[serde(default)]
    pub virtual_ab: FeatureFlag,
    #[serde(default)]
    pub virtual_ab_compression: FeatureFlag,
}

/// Static description of the device the planner runs on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub features: FeatureFlags,
    /// running from recovery: the whole super partition may be used for one slot
    #[serde(default)]
    pub is_recovery: bool,
    /// whether system_other carries AVB keys in fstab, None if unknown
    #[serde(default)]
    pub avb_enabled_on_system_other: Option<bool>,
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
    #[serde(default = "default_super_name")]
    pub super_partition_name: String,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// directory of the file backed metadata store
    #[serde(default)]
    pub metadata_dir: Option<PathBuf>,
    /// physical disks scanned for static partitions
    #[serde(default)]
    pub gpt_disks: Vec<PathBuf>,
}

fn default_device_dir() -> PathBuf {
    PathBuf::from(BLOCK_DEV_NAME_MAPPER)
}

fn default_super_name() -> String {
    SUPER_PARTITION_NAME.to_string()
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            features: FeatureFlags::default(),
            is_recovery: false,
            avb_enabled_on_system_other: None,
            device_dir: default_device_dir(),
            super_partition_name: default_super_name(),
            block_size: default_block_size(),
            metadata_dir: None,
            gpt_disks: Vec::new(),
        }
    }
}

impl DeviceConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, PlanError> {
        let data = fs::read_to_string(path)?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self, PlanError> {
        let config: DeviceConfig = toml::from_str(data)?;
        if config.block_size == 0 || !config.block_size.is_power_of_two() {
            return Err(PlanError::InvalidMetadata(format!(
                "block size {} is not a power of two",
                config.block_size
            )));
        }
        Ok(config)
    }

    /// Name of the block device holding the super metadata of `slot`
    pub fn super_partition_name(&self, slot: Slot) -> String {
        if self.features.dynamic_partitions.is_retrofit() {
            slot.suffixed(RETROFIT_SUPER_BASE_NAME)
        } else {
            self.super_partition_name.clone()
        }
    }

    pub fn super_device(&self, slot: Slot) -> String {
        self.device_path(&self.super_partition_name(slot))
    }

    /// `name` under the by-name device directory
    pub fn device_path(&self, name: &str) -> String {
        self.device_dir.join(name).to_string_lossy().into_owned()
    }

    /// Commented example config
    pub fn template() -> String {
        let mut out = String::new();
        out.push_str("# dynpart device description\n");
        out.push_str("# feature flags take disabled | launch | retrofit\n");
        out.push_str("# metadata_dir holds one checksummed table per super device and slot\n\n");
        let example = DeviceConfig {
            features: FeatureFlags {
                dynamic_partitions: FeatureFlag::Launch,
                virtual_ab: FeatureFlag::Disabled,
                virtual_ab_compression: FeatureFlag::Disabled,
            },
            avb_enabled_on_system_other: Some(false),
            metadata_dir: Some(PathBuf::from("/data/local/tmp/dynpart")),
            ..DeviceConfig::default()
        };
        // plain data, serialization cannot fail
        out.push_str(&toml::to_string(&example).unwrap_or_default());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let config = DeviceConfig::from_toml_str(
            r#"
            [features]
            dynamic_partitions = "launch"
            virtual_ab = "retrofit"
            "#,
        )
        .unwrap();
        assert!(config.features.dynamic_partitions.is_launch());
        assert!(config.features.virtual_ab.is_retrofit());
        assert!(!config.features.virtual_ab_compression.is_enabled());
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.super_device(Slot::A), "/dev/block/by-name/super");
    }

    #[test]
    fn retrofit_super_is_slot_system() {
        let mut config = DeviceConfig::default();
        config.features.dynamic_partitions = FeatureFlag::Retrofit;
        assert_eq!(config.super_partition_name(Slot::B), "system_b");
    }

    #[test]
    fn template_parses_back() {
        let config = DeviceConfig::from_toml_str(&DeviceConfig::template()).unwrap();
        assert!(config.features.dynamic_partitions.is_launch());
        assert_eq!(config.avb_enabled_on_system_other, Some(false));
    }

    #[test]
    fn rejects_odd_block_size() {
        assert!(DeviceConfig::from_toml_str("block_size = 1000").is_err());
    }
}

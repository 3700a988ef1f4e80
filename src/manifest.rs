//! The part of an update manifest the planner consumes: the desired dynamic
//! partition layout of the target slot and the install operations the
//! optimizer may shorten.
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::error::PlanError;
use crate::extent::{div_round_up, total_blocks, Extent};

/// A partition group requested by the update, names without slot suffix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionGroupSpec {
    pub name: String,
    /// maximum size of the group in bytes
    pub size: u64,
    /// partition name -> desired size in bytes
    #[serde(default)]
    pub partitions: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicPartitionMetadata {
    #[serde(default)]
    pub groups: Vec<PartitionGroupSpec>,
    /// the payload may be applied through copy-on-write snapshots
    #[serde(default)]
    pub snapshot_enabled: bool,
    /// the snapshots use compression
    #[serde(default)]
    pub vabc_enabled: bool,
}

impl DynamicPartitionMetadata {
    /// Sum of the group budgets, None on overflow
    pub fn total_group_size(&self) -> Option<u64> {
        self.groups.iter().try_fold(0u64, |sum, g| sum.checked_add(g.size))
    }

    /// Sum of the partition sizes rounded up to whole blocks, None on overflow
    pub fn total_partition_size(&self, block_size: u64) -> Option<u64> {
        self.groups
            .iter()
            .flat_map(|g| g.partitions.values())
            .try_fold(0u64, |sum, &size| {
                div_round_up(size, block_size)
                    .checked_mul(block_size)
                    .and_then(|rounded| sum.checked_add(rounded))
            })
    }

    pub fn partition_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.groups
            .iter()
            .flat_map(|g| g.partitions.keys().map(String::as_str))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// None when the payload does not describe dynamic partitions, e.g. a
    /// retrofit payload applied on a dynamic partitions build
    #[serde(default)]
    pub dynamic_partition_metadata: Option<DynamicPartitionMetadata>,
}

impl UpdateManifest {
    pub fn from_toml_file(path: &Path) -> Result<Self, PlanError> {
        let data = fs::read_to_string(path)?;
        let manifest: UpdateManifest = toml::from_str(&data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Manifest with one group holding the given partitions
    pub fn with_group(name: &str, size: u64, partitions: &[(&str, u64)]) -> Self {
        let mut manifest = UpdateManifest::default();
        manifest.add_group(name, size, partitions);
        manifest
    }

    pub fn add_group(&mut self, name: &str, size: u64, partitions: &[(&str, u64)]) {
        let metadata = self.dynamic_partition_metadata.get_or_insert_with(Default::default);
        metadata.groups.push(PartitionGroupSpec {
            name: name.to_string(),
            size,
            partitions: partitions
                .iter()
                .map(|&(p, s)| (p.to_string(), s))
                .collect(),
        });
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic_partition_metadata.is_some()
    }

    pub fn snapshot_enabled(&self) -> bool {
        self.dynamic_partition_metadata
            .as_ref()
            .map_or(false, |m| m.snapshot_enabled)
    }

    pub fn vabc_enabled(&self) -> bool {
        self.dynamic_partition_metadata
            .as_ref()
            .map_or(false, |m| m.vabc_enabled)
    }

    /// Bytes of super the target slot needs: the larger of the group budgets
    /// and the partitions themselves, since a group of size 0 has no budget
    pub fn required_space(&self, block_size: u64) -> Result<u64, PlanError> {
        let Some(metadata) = &self.dynamic_partition_metadata else {
            return Ok(0);
        };
        let groups = metadata.total_group_size();
        let partitions = metadata.total_partition_size(block_size);
        match (groups, partitions) {
            (Some(groups), Some(partitions)) => Ok(groups.max(partitions)),
            _ => Err(PlanError::InvalidMetadata("manifest sizes overflow".to_string())),
        }
    }

    pub fn groups(&self) -> &[PartitionGroupSpec] {
        self.dynamic_partition_metadata
            .as_ref()
            .map(|m| m.groups.as_slice())
            .unwrap_or(&[])
    }

    /// Partition names are unique across groups and group names are unique
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut groups = HashSet::new();
        let mut partitions = HashSet::new();
        for group in self.groups() {
            if !groups.insert(group.name.as_str()) {
                return Err(PlanError::InvalidMetadata(format!(
                    "group {} listed twice in manifest",
                    group.name
                )));
            }
            for name in group.partitions.keys() {
                if !partitions.insert(name.as_str()) {
                    return Err(PlanError::InvalidMetadata(format!(
                        "partition {} listed in more than one group",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Replace,
    ReplaceBz,
    ReplaceXz,
    Zero,
    Discard,
    SourceCopy,
    SourceBsdiff,
    BrotliBsdiff,
    Puffdiff,
    Zucchini,
}

/// One install operation: read `src_extents`, write `dst_extents`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default)]
    pub src_extents: Vec<Extent>,
    #[serde(default)]
    pub dst_extents: Vec<Extent>,
}

impl InstallOperation {
    pub fn new(op_type: OperationType) -> Self {
        InstallOperation {
            op_type,
            src_extents: Vec::new(),
            dst_extents: Vec::new(),
        }
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, PlanError> {
        let data = fs::read_to_string(path)?;
        Ok(toml::from_str(&data)?)
    }

    pub fn src_blocks(&self) -> u64 {
        total_blocks(&self.src_extents)
    }

    pub fn dst_blocks(&self) -> u64 {
        total_blocks(&self.dst_extents)
    }

    /// nothing to read and nothing to write
    pub fn is_noop(&self) -> bool {
        self.src_extents.is_empty() && self.dst_extents.is_empty()
    }
}

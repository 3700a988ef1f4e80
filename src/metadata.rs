///metadata module
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use crc32fast::Hasher;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::bootctrl::Slot;
use crate::constants::{METADATA_FILE_EXTENSION, METADATA_HEAD_MAGIC, METADATA_TAIL_MAGIC};
use crate::error::PlanError;
use crate::extent::{append_blocks_to_extents, bytes2ieee, div_round_up, total_blocks, Extent};
use crate::extent_ranges::ExtentRangeSet;
use crate::manifest::PartitionGroupSpec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionGroup {
    pub name: String,
    /// 0 means the group is only bounded by the super partition
    pub maximum_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub name: String,
    pub group_name: String,
    pub attributes: u32,
    /// blocks of the super partition backing this partition, in logical order
    #[serde(default)]
    pub extents: Vec<Extent>,
}

impl PartitionEntry {
    pub fn num_blocks(&self) -> u64 {
        total_blocks(&self.extents)
    }

    pub fn size(&self, block_size: u64) -> u64 {
        self.num_blocks().saturating_mul(block_size)
    }

    pub fn has_attribute(&self, attribute: u32) -> bool {
        self.attributes & attribute != 0
    }
}

/// In-memory copy of the logical partition table stored in a super partition.
/// Loaded for one slot, mutated, then handed back to a [`MetadataStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperMetadata {
    pub super_size: u64,
    /// bytes at the start of super holding geometry and metadata copies
    pub metadata_reserved: u64,
    pub block_size: u64,
    /// names of the block devices making up super, `system_<slot>` on retrofit devices
    pub block_devices: Vec<String>,
    #[serde(default)]
    pub groups: Vec<PartitionGroup>,
    #[serde(default)]
    pub partitions: Vec<PartitionEntry>,
}

impl fmt::Display for SuperMetadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Super Size: {} ({})\nBlock Size: {}\nBlock Devices: {}\nAllocatable: {}\nFree: {}\n\n",
               self.super_size, bytes2ieee(self.super_size), self.block_size,
               self.block_devices.join(", "),
               bytes2ieee(self.allocatable_space()),
               bytes2ieee(self.allocatable_space().saturating_sub(self.used_space())))?;
        for group in &self.groups {
            let limit = if group.maximum_size == 0 {
                "unlimited".to_string()
            } else {
                bytes2ieee(group.maximum_size)
            };
            write!(f, "Group {} : used {} of {}\n", group.name,
                   bytes2ieee(self.group_used_space(&group.name)), limit)?;
            for partition in self.partitions.iter().filter(|p| p.group_name == group.name) {
                write!(f, "\t{} : {} attr {:#x}", partition.name,
                       bytes2ieee(partition.size(self.block_size)), partition.attributes)?;
                for extent in &partition.extents {
                    write!(f, " {}", extent)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl SuperMetadata {
    pub fn new(super_size: u64, metadata_reserved: u64, block_size: u64, block_devices: Vec<String>) -> Result<Self, PlanError> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(PlanError::InvalidMetadata(format!("block size {} is not a power of two", block_size)));
        }
        if div_round_up(metadata_reserved, block_size) >= super_size / block_size {
            return Err(PlanError::InvalidMetadata(format!(
                "super size {} leaves no room after {} reserved bytes", super_size, metadata_reserved)));
        }
        Ok(SuperMetadata {
            super_size,
            metadata_reserved,
            block_size,
            block_devices,
            groups: Vec::new(),
            partitions: Vec::new(),
        })
    }

    fn first_usable_block(&self) -> u64 {
        div_round_up(self.metadata_reserved, self.block_size)
    }

    fn last_usable_block(&self) -> u64 {
        self.super_size / self.block_size
    }

    /// Bytes of super that partitions may occupy
    pub fn allocatable_space(&self) -> u64 {
        self.last_usable_block().saturating_sub(self.first_usable_block()) * self.block_size
    }

    pub fn used_space(&self) -> u64 {
        self.partitions
            .iter()
            .fold(0, |sum: u64, p| sum.saturating_add(p.size(self.block_size)))
    }

    /// Allocatable blocks not backing any partition
    pub fn free_extents(&self) -> ExtentRangeSet {
        let mut free = ExtentRangeSet::new();
        let first = self.first_usable_block();
        free.add_extent(Extent::new(first, self.last_usable_block().saturating_sub(first)));
        for partition in &self.partitions {
            free.subtract_extents(&partition.extents);
        }
        free
    }

    pub fn is_block_device(&self, name: &str) -> bool {
        self.block_devices.iter().any(|device| device == name)
    }

    pub fn find_group(&self, name: &str) -> Option<&PartitionGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    pub fn partitions_in_group<'m>(&'m self, group: &'m str) -> impl Iterator<Item = &'m PartitionEntry> + 'm {
        self.partitions.iter().filter(move |p| p.group_name == group)
    }

    pub fn group_used_space(&self, group: &str) -> u64 {
        self.partitions_in_group(group)
            .fold(0, |sum: u64, p| sum.saturating_add(p.size(self.block_size)))
    }

    pub fn add_group(&mut self, name: &str, maximum_size: u64) -> Result<(), PlanError> {
        if self.find_group(name).is_some() {
            return Err(PlanError::InvalidMetadata(format!("group {} already exists", name)));
        }
        debug!("add group {} max {}", name, maximum_size);
        self.groups.push(PartitionGroup { name: name.to_string(), maximum_size });
        Ok(())
    }

    /// Change the budget of `name`, failing if its partitions no longer fit
    pub fn resize_group(&mut self, name: &str, maximum_size: u64) -> Result<(), PlanError> {
        let used = self.group_used_space(name);
        if maximum_size > 0 && used > maximum_size {
            return Err(PlanError::GroupOverBudget {
                group: name.to_string(),
                required: used,
                available: maximum_size,
            });
        }
        let group = self.groups.iter_mut().find(|g| g.name == name)
            .ok_or_else(|| PlanError::InvalidMetadata(format!("group {} not found", name)))?;
        group.maximum_size = maximum_size;
        Ok(())
    }

    pub fn remove_group_and_partitions(&mut self, name: &str) -> bool {
        let before = self.groups.len();
        self.groups.retain(|g| g.name != name);
        if self.groups.len() == before {
            return false;
        }
        self.partitions.retain(|p| p.group_name != name);
        debug!("removed group {} and its partitions", name);
        true
    }

    pub fn find_partition(&self, name: &str) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|p| p.name == name)
    }

    fn partition_index(&self, name: &str) -> Result<usize, PlanError> {
        self.partitions.iter().position(|p| p.name == name)
            .ok_or_else(|| PlanError::InvalidMetadata(format!("partition {} not found", name)))
    }

    /// Add an empty partition to an existing group
    pub fn add_partition(&mut self, name: &str, group: &str, attributes: u32) -> Result<(), PlanError> {
        if self.find_partition(name).is_some() {
            return Err(PlanError::InvalidMetadata(format!("partition {} already exists", name)));
        }
        if self.find_group(group).is_none() {
            return Err(PlanError::InvalidMetadata(format!("group {} not found", group)));
        }
        self.partitions.push(PartitionEntry {
            name: name.to_string(),
            group_name: group.to_string(),
            attributes,
            extents: Vec::new(),
        });
        Ok(())
    }

    pub fn remove_partition(&mut self, name: &str) -> bool {
        let before = self.partitions.len();
        self.partitions.retain(|p| p.name != name);
        self.partitions.len() != before
    }

    pub fn set_partition_attributes(&mut self, name: &str, attributes: u32) -> Result<(), PlanError> {
        let index = self.partition_index(name)?;
        self.partitions[index].attributes = attributes;
        Ok(())
    }

    /// Move a partition to another group without touching its extents.
    /// Budgets are not checked here.
    pub fn change_partition_group(&mut self, name: &str, group: &str) -> Result<(), PlanError> {
        if self.find_group(group).is_none() {
            return Err(PlanError::InvalidMetadata(format!("group {} not found", group)));
        }
        let index = self.partition_index(name)?;
        self.partitions[index].group_name = group.to_string();
        Ok(())
    }

    /// Group budget is respected by the partitions currently in it
    pub fn check_group_budget(&self, group: &str) -> Result<(), PlanError> {
        let Some(found) = self.find_group(group) else {
            return Err(PlanError::InvalidMetadata(format!("group {} not found", group)));
        };
        let used = self.group_used_space(group);
        if found.maximum_size > 0 && used > found.maximum_size {
            return Err(PlanError::GroupOverBudget {
                group: group.to_string(),
                required: used,
                available: found.maximum_size,
            });
        }
        Ok(())
    }

    /// Resize to `size` bytes rounded up to whole blocks.
    /// Shrinking drops blocks from the logical end, growing takes the lowest free blocks.
    pub fn resize_partition(&mut self, name: &str, size: u64) -> Result<(), PlanError> {
        let block_size = self.block_size;
        let wanted = div_round_up(size, block_size);
        let index = self.partition_index(name)?;
        let current = self.partitions[index].num_blocks();
        if wanted == current {
            return Ok(());
        }
        if wanted < current {
            let entry = &mut self.partitions[index];
            let mut remaining = current - wanted;
            while remaining > 0 {
                let Some(last) = entry.extents.last_mut() else {
                    break;
                };
                if last.num_blocks <= remaining {
                    remaining -= last.num_blocks;
                    entry.extents.pop();
                } else {
                    last.num_blocks -= remaining;
                    remaining = 0;
                }
            }
            debug!("shrunk {} from {} to {} blocks", name, current, wanted);
            return Ok(());
        }

        if wanted > self.last_usable_block().saturating_sub(self.first_usable_block()) {
            return Err(PlanError::SuperOverBudget {
                required: self.used_space().saturating_sub(current.saturating_mul(block_size)).saturating_add(size),
                available: self.allocatable_space(),
            });
        }
        let old_size = current * block_size;
        let new_size = wanted * block_size;
        let group_name = self.partitions[index].group_name.clone();
        if let Some(group) = self.find_group(&group_name) {
            let required = self.group_used_space(&group_name).saturating_sub(old_size).saturating_add(new_size);
            if group.maximum_size > 0 && required > group.maximum_size {
                return Err(PlanError::GroupOverBudget {
                    group: group_name,
                    required,
                    available: group.maximum_size,
                });
            }
        }
        let free = self.free_extents();
        let Some(extents) = free.get_extents_for_block_count(wanted - current) else {
            return Err(PlanError::SuperOverBudget {
                required: self.used_space().saturating_sub(old_size).saturating_add(new_size),
                available: self.allocatable_space(),
            });
        };
        let entry = &mut self.partitions[index];
        for extent in extents {
            append_blocks_to_extents(&mut entry.extents, extent.start_block, extent.num_blocks);
        }
        debug!("grew {} from {} to {} blocks", name, current, wanted);
        Ok(())
    }

    /// Add `slot`-suffixed groups and partitions sized as in `groups`
    pub fn add_slot_layout(&mut self, groups: &[PartitionGroupSpec], slot: Slot, attributes: u32) -> Result<(), PlanError> {
        for group in groups {
            let group_name = slot.suffixed(&group.name);
            self.add_group(&group_name, group.size)?;
            for (partition, size) in &group.partitions {
                let name = slot.suffixed(partition);
                self.add_partition(&name, &group_name, attributes)?;
                self.resize_partition(&name, *size)?;
            }
        }
        Ok(())
    }

    /// Copy of this table ready to be modified for `target`.
    /// On retrofit devices each slot has its own super, so the source slot's
    /// block devices are renamed and its partitions and groups dropped.
    pub fn for_update(&self, source: Slot, target: Slot, retrofit: bool) -> SuperMetadata {
        let mut table = self.clone();
        if retrofit {
            let (source_suffix, target_suffix) = (source.suffix(), target.suffix());
            for device in table.block_devices.iter_mut() {
                if let Some(base) = device.strip_suffix(source_suffix) {
                    *device = format!("{}{}", base, target_suffix);
                }
            }
            table.partitions.retain(|p| !p.name.ends_with(source_suffix));
            table.groups.retain(|g| !g.name.ends_with(source_suffix));
        }
        table
    }

    /// Structural checks run on every loaded table
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(PlanError::InvalidMetadata(format!("bad block size {}", self.block_size)));
        }
        let first = self.first_usable_block();
        let last = self.last_usable_block();
        let mut used = ExtentRangeSet::with_merge_touching(false);
        for partition in &self.partitions {
            if self.find_group(&partition.group_name).is_none() {
                return Err(PlanError::InvalidMetadata(format!(
                    "partition {} in unknown group {}", partition.name, partition.group_name)));
            }
            for extent in &partition.extents {
                let past_end = extent.checked_end_block().map_or(true, |end| end > last);
                if extent.is_empty() || extent.start_block < first || past_end {
                    return Err(PlanError::InvalidMetadata(format!(
                        "extent {} of {} outside usable blocks", extent, partition.name)));
                }
                if used.overlaps_with_extent(extent) {
                    return Err(PlanError::InvalidMetadata(format!(
                        "extent {} of {} is shared", extent, partition.name)));
                }
                used.add_extent(*extent);
            }
        }
        Ok(())
    }
}

/// Persistence of super metadata, one table per (super device, slot)
pub trait MetadataStore {
    /// None if the table is missing or corrupt
    fn load(&self, super_device: &str, slot: Slot) -> Option<SuperMetadata>;
    /// All-or-nothing write, false on failure
    fn store(&self, super_device: &str, metadata: &SuperMetadata, slot: Slot) -> bool;
}

/// Tables kept as checksummed files in a directory:
/// head magic line, TOML body, tail magic line, crc32 of the body (LE)
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    pub fn new(dir: &Path) -> Self {
        FileMetadataStore { dir: dir.to_path_buf() }
    }

    pub fn path_for(&self, super_device: &str, slot: Slot) -> PathBuf {
        let base = Path::new(super_device)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| super_device.to_string());
        self.dir.join(format!("{}.slot{}.{}", base, slot.0, METADATA_FILE_EXTENSION))
    }

    fn read_file(path: &Path) -> Result<SuperMetadata, String> {
        let data = fs::read(path).map_err(|e| format!("read failed: {}", e))?;
        let head = format!("{}\n", METADATA_HEAD_MAGIC);
        let tail = format!("{}\n", METADATA_TAIL_MAGIC);
        if data.len() < head.len() + tail.len() + 4 {
            return Err("file too short".to_string());
        }
        let (framed, crc32_buffer) = data.split_at(data.len() - 4);
        if !framed.starts_with(head.as_bytes()) {
            return Err("head magic not match".to_string());
        }
        if !framed.ends_with(tail.as_bytes()) {
            return Err("tail magic not match".to_string());
        }
        let body = &framed[head.len()..framed.len() - tail.len()];
        let mut crc32 = [0u8; 4];
        crc32.copy_from_slice(crc32_buffer);
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != u32::from_le_bytes(crc32) {
            return Err("crc32 not match".to_string());
        }
        let toml_str = std::str::from_utf8(body).map_err(|_| "body is not utf-8".to_string())?;
        let metadata: SuperMetadata = toml::from_str(toml_str).map_err(|e| format!("toml: {}", e))?;
        metadata.validate().map_err(|e| e.to_string())?;
        Ok(metadata)
    }

    fn write_file(path: &Path, metadata: &SuperMetadata) -> Result<(), PlanError> {
        let mut toml_str = toml::to_string(metadata)
            .map_err(|e| PlanError::InvalidMetadata(e.to_string()))?;
        if !toml_str.ends_with('\n') {
            toml_str.push('\n');
        }
        let mut hasher = Hasher::new();
        hasher.update(toml_str.as_bytes());
        let crc32_buffer = hasher.finalize().to_le_bytes();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(METADATA_HEAD_MAGIC.as_bytes())?;
        file.write_all(b"\n")?;
        file.write_all(toml_str.as_bytes())?;
        file.write_all(METADATA_TAIL_MAGIC.as_bytes())?;
        file.write_all(b"\n")?;
        file.write_all(&crc32_buffer)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl MetadataStore for FileMetadataStore {
    fn load(&self, super_device: &str, slot: Slot) -> Option<SuperMetadata> {
        let path = self.path_for(super_device, slot);
        match Self::read_file(&path) {
            Ok(metadata) => {
                debug!("loaded {} for slot {}", path.display(), slot);
                Some(metadata)
            }
            Err(reason) => {
                warn!("No valid metadata at {}: {}", path.display(), reason);
                None
            }
        }
    }

    fn store(&self, super_device: &str, metadata: &SuperMetadata, slot: Slot) -> bool {
        let path = self.path_for(super_device, slot);
        match Self::write_file(&path, metadata) {
            Ok(()) => {
                info!("Stored metadata for slot {} at {}", slot, path.display());
                true
            }
            Err(e) => {
                warn!("Failed to store metadata at {}: {}", path.display(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_METADATA_RESERVED_BYTES};

    const MIB: u64 = 1024 * 1024;

    fn table(super_size: u64) -> SuperMetadata {
        SuperMetadata::new(super_size, DEFAULT_METADATA_RESERVED_BYTES, DEFAULT_BLOCK_SIZE, vec!["super".to_string()]).unwrap()
    }

    #[test]
    fn allocatable_excludes_reserved() {
        let t = table(10 * MIB + MIB);
        assert_eq!(t.allocatable_space(), 10 * MIB);
        assert_eq!(t.free_extents().blocks(), 10 * MIB / DEFAULT_BLOCK_SIZE);
        assert!(SuperMetadata::new(MIB, MIB, DEFAULT_BLOCK_SIZE, vec![]).is_err());
    }

    #[test]
    fn grow_then_shrink_reuses_blocks() {
        let mut t = table(8 * MIB + MIB);
        t.add_group("main_a", 0).unwrap();
        t.add_partition("system_a", "main_a", 0).unwrap();
        t.add_partition("vendor_a", "main_a", 0).unwrap();
        t.resize_partition("system_a", 2 * MIB).unwrap();
        t.resize_partition("vendor_a", MIB).unwrap();
        t.resize_partition("system_a", 3 * MIB).unwrap();
        let system = t.find_partition("system_a").unwrap();
        assert_eq!(system.size(t.block_size), 3 * MIB);
        // first 2 MiB, then the blocks after vendor
        assert_eq!(system.extents.len(), 2);
        t.resize_partition("system_a", MIB + 1).unwrap();
        assert_eq!(t.find_partition("system_a").unwrap().size(t.block_size), MIB + DEFAULT_BLOCK_SIZE);
        assert_eq!(t.used_space(), 2 * MIB + DEFAULT_BLOCK_SIZE);
        t.validate().unwrap();
    }

    #[test]
    fn budgets_are_enforced() {
        let mut t = table(4 * MIB + MIB);
        t.add_group("small_a", 2 * MIB).unwrap();
        t.add_partition("odm_a", "small_a", 0).unwrap();
        assert!(matches!(
            t.resize_partition("odm_a", 3 * MIB),
            Err(PlanError::GroupOverBudget { required, available, .. }) if required == 3 * MIB && available == 2 * MIB
        ));
        t.add_group("big_a", 0).unwrap();
        t.add_partition("system_a", "big_a", 0).unwrap();
        let err = t.resize_partition("system_a", 5 * MIB).unwrap_err();
        assert_eq!(err.required_size(), Some(MIB));
        assert_eq!(t.used_space(), 0);
        t.resize_partition("odm_a", 2 * MIB).unwrap();
        assert!(t.resize_group("small_a", MIB).is_err());
    }

    #[test]
    fn huge_sizes_and_extents_are_rejected() {
        let mut t = table(4 * MIB + MIB);
        t.add_group("main_a", 0).unwrap();
        t.add_partition("system_a", "main_a", 0).unwrap();
        assert!(matches!(
            t.resize_partition("system_a", u64::MAX),
            Err(PlanError::SuperOverBudget { required, available }) if required == u64::MAX && available == 4 * MIB
        ));
        assert_eq!(t.used_space(), 0);

        t.partitions[0].extents.push(Extent::new(u64::MAX - 2, 5));
        assert!(matches!(t.validate(), Err(PlanError::InvalidMetadata(_))));
    }

    #[test]
    fn retrofit_view_drops_source_slot() {
        let mut t = SuperMetadata::new(8 * MIB, MIB, DEFAULT_BLOCK_SIZE, vec!["system_a".to_string()]).unwrap();
        t.add_group("main_a", 0).unwrap();
        t.add_group("main_b", 0).unwrap();
        t.add_partition("vendor_a", "main_a", 0).unwrap();
        t.add_partition("vendor_b", "main_b", 0).unwrap();
        let view = t.for_update(Slot::A, Slot::B, true);
        assert_eq!(view.block_devices, vec!["system_b".to_string()]);
        assert!(view.find_partition("vendor_a").is_none());
        assert!(view.find_group("main_a").is_none());
        assert_eq!(t.for_update(Slot::A, Slot::B, false), t);
    }

    #[test]
    fn file_store_round_trip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path());
        let mut t = table(16 * MIB);
        t.add_group("main_b", 8 * MIB).unwrap();
        t.add_partition("system_b", "main_b", 1).unwrap();
        t.resize_partition("system_b", 4 * MIB).unwrap();

        assert!(store.load("/dev/block/by-name/super", Slot::B).is_none());
        assert!(store.store("/dev/block/by-name/super", &t, Slot::B));
        assert_eq!(store.load("/dev/block/by-name/super", Slot::B), Some(t.clone()));
        assert!(store.load("/dev/block/by-name/super", Slot::A).is_none());

        let path = store.path_for("/dev/block/by-name/super", Slot::B);
        assert!(path.ends_with("super.slot1.lpmd"));
        let mut data = fs::read(&path).unwrap();
        let middle = data.len() / 2;
        data[middle] ^= 0x20;
        fs::write(&path, &data).unwrap();
        assert!(store.load("/dev/block/by-name/super", Slot::B).is_none());
    }
}

//! Block device resolution for partitions of either slot, device-mapper
//! bookkeeping and the system_other AVB footer.
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use log::{debug, error, info, warn};
use crate::bootctrl::Slot;
use crate::constants::{
    AVB_FOOTER_SIZE, DM_DEVICE_DIR, LP_PARTITION_ATTR_UPDATED, SOURCE_MAPPING_SUFFIX, SYSTEM_PARTITION_NAME,
};
use crate::device::{DmDeviceState, MapRequest, PartitionDevice};
use crate::error::PlanError;
use crate::manifest::{InstallOperation, OperationType};
use crate::optimizer::optimize_source_copy;
use crate::planner::DynamicPartitionControl;

/// Device holding system_other, mapped for the erase when `should_unmap`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemOtherPath {
    pub path: String,
    pub should_unmap: bool,
}

impl<'a> DynamicPartitionControl<'a> {
    /// Resolve where `partition_name` of `slot` can be read and written.
    ///
    /// `not_in_payload` marks partitions the payload does not update; their
    /// target devices are mapped read-only.
    pub fn get_partition_device(
        &mut self,
        partition_name: &str,
        slot: Slot,
        current_slot: Slot,
        not_in_payload: bool,
    ) -> Result<PartitionDevice, PlanError> {
        let slot = Slot::new(slot.0)?;
        let name_suffix = slot.suffixed(partition_name);
        if self.update_uses_snapshot_compression()
            && slot != current_slot
            && self.is_dynamic_partition(partition_name, slot)
        {
            return Ok(PartitionDevice {
                rw_device_path: String::new(),
                readonly_device_path: format!("{}{}", DM_DEVICE_DIR, name_suffix),
                is_dynamic: true,
            });
        }

        // target partitions the payload encodes as static stay static,
        // e.g. a retrofit payload on a dynamic partitions build
        if self.config.features.dynamic_partitions.is_enabled() && (slot == current_slot || self.is_target_dynamic) {
            if let Some(device) = self.get_dynamic_partition_device(&name_suffix, slot, current_slot, not_in_payload)? {
                return Ok(PartitionDevice::same_path(device, true));
            }
        }

        let static_path = self.config.device_path(&name_suffix);
        if !self.dm.device_exists(&static_path) {
            error!("Device file {} does not exist", static_path);
            return Err(PlanError::DeviceNotFound(static_path));
        }
        Ok(PartitionDevice::same_path(static_path, false))
    }

    /// Some(path) of the logical partition, None to fall back to a static one
    fn get_dynamic_partition_device(
        &mut self,
        name_suffix: &str,
        slot: Slot,
        current_slot: Slot,
        not_in_payload: bool,
    ) -> Result<Option<String>, PlanError> {
        let super_device = self.config.super_device(slot);
        let table = self.load_metadata(&super_device, slot)?;
        if table.find_partition(name_suffix).is_none() {
            info!("{} is not in super partition metadata", name_suffix);
            if self.is_super_block_device(current_slot, name_suffix) {
                error!("The static partition {} is a block device for current metadata, it cannot be used as a logical partition", name_suffix);
                return Err(PlanError::DeviceNotFound(name_suffix.to_string()));
            }
            return Ok(None);
        }

        if slot == current_slot {
            let source_name = format!("{}{}", name_suffix, SOURCE_MAPPING_SUFFIX);
            if self.dm.state(&source_name) == DmDeviceState::Active {
                let device = self.dm.dm_device_path(&source_name).ok_or_else(|| {
                    error!("{} is mapped but path is unknown", source_name);
                    PlanError::MapFailed(source_name.clone())
                })?;
                info!("{} is mapped on device mapper: {}", source_name, device);
                return Ok(Some(device));
            }
            warn!("{} is at current slot but it is not mapped, now try to map it", name_suffix);
            return self
                .map_partition_on_device_mapper(&super_device, name_suffix, &source_name, slot, false)
                .map(Some);
        }

        let force_writable = slot != current_slot && !not_in_payload;
        self.map_partition_on_device_mapper(&super_device, name_suffix, name_suffix, slot, force_writable)
            .map(Some)
    }

    fn is_super_block_device(&self, current_slot: Slot, name_suffix: &str) -> bool {
        let super_device = self.config.super_device(current_slot);
        self.metadata
            .load(&super_device, current_slot)
            .map_or(false, |table| table.is_block_device(name_suffix))
    }

    /// Map `partition_name` of `slot` as `device_name`, reusing a device this
    /// planner already mapped. A stray active device of the same name is
    /// unmapped first.
    pub fn map_partition_on_device_mapper(
        &mut self,
        super_device: &str,
        partition_name: &str,
        device_name: &str,
        slot: Slot,
        force_writable: bool,
    ) -> Result<String, PlanError> {
        let mut state = self.dm.state(device_name);
        if state == DmDeviceState::Active {
            if self.mapped_devices.contains(device_name) {
                let path = self.dm.dm_device_path(device_name).ok_or_else(|| {
                    error!("{} is mapped on device mapper but state is unknown", device_name);
                    PlanError::MapFailed(device_name.to_string())
                })?;
                info!("{} is mapped on device mapper: {}", device_name, path);
                return Ok(path);
            }
            // possibly mapped wrong by someone else
            self.unmap_partition_on_device_mapper(device_name)?;
            state = self.dm.state(device_name);
        }
        if state != DmDeviceState::Invalid {
            error!("{} is mapped on device mapper but state is unknown: {:?}", device_name, state);
            return Err(PlanError::MapFailed(device_name.to_string()));
        }

        let request = MapRequest {
            super_device,
            partition_name,
            device_name,
            slot,
            force_writable,
        };
        let path = self.dm.map(&request).ok_or_else(|| {
            error!("Cannot map {} from {} slot {}", partition_name, super_device, slot);
            PlanError::MapFailed(device_name.to_string())
        })?;
        info!("Mapped {} as {} at {}{}", partition_name, device_name, path,
              if force_writable { " (writable)" } else { "" });
        self.mapped_devices.insert(device_name.to_string());
        Ok(path)
    }

    pub fn unmap_partition_on_device_mapper(&mut self, device_name: &str) -> Result<(), PlanError> {
        if !self.dm.unmap(device_name) {
            error!("Cannot unmap {} from device mapper", device_name);
            return Err(PlanError::UnmapFailed(device_name.to_string()));
        }
        debug!("unmapped {}", device_name);
        self.mapped_devices.remove(device_name);
        Ok(())
    }

    /// Unmap every device this planner mapped, reporting the first failure
    pub fn unmap_all_partitions(&mut self) -> Result<(), PlanError> {
        if self.mapped_devices.is_empty() {
            return Ok(());
        }
        info!("Destroying {} mapped partitions", self.mapped_devices.len());
        let mut devices: Vec<String> = self.mapped_devices.iter().cloned().collect();
        devices.sort();
        let mut result = Ok(());
        for device in devices {
            if let Err(e) = self.unmap_partition_on_device_mapper(&device) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn is_mapped(&self, device_name: &str) -> bool {
        self.mapped_devices.contains(device_name)
    }

    pub fn update_uses_snapshot_compression(&self) -> bool {
        self.uses_compression
    }

    /// Names without suffix of the partitions in `slot`'s groups
    pub fn list_dynamic_partitions_for_slot(&self, slot: Slot, current_slot: Slot) -> Result<Vec<String>, PlanError> {
        if !self.config.features.dynamic_partitions.is_enabled() {
            return Err(PlanError::InvalidMetadata("dynamic partitions are not enabled".to_string()));
        }
        let slot = Slot::new(slot.0)?;
        let super_device = self.config.super_device(current_slot);
        let table = self.load_metadata(&super_device, slot)?;
        let suffix = slot.suffix();
        let mut names = Vec::new();
        for group in table.groups.iter().filter(|g| g.name.ends_with(suffix)) {
            for partition in table.partitions_in_group(&group.name) {
                if let Some(name) = partition.name.strip_suffix(suffix) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Looked up in the manifest for the target slot, lazily in the table otherwise
    pub fn is_dynamic_partition(&mut self, partition_name: &str, slot: Slot) -> bool {
        let index = slot.0 as usize;
        let Some(known) = self.dynamic_partition_list.get(index) else {
            error!("Invalid slot {}", slot.0);
            return false;
        };
        if known.is_empty() && self.config.features.dynamic_partitions.is_enabled() {
            let current = self.source_slot.unwrap_or(slot);
            match self.list_dynamic_partitions_for_slot(slot, current) {
                Ok(names) => self.dynamic_partition_list[index] = names,
                Err(e) => {
                    warn!("Cannot list dynamic partitions of slot {}: {}", slot, e);
                    return false;
                }
            }
        }
        self.dynamic_partition_list[index].iter().any(|name| name == partition_name)
    }

    /// Skip the parts of a SOURCE_COPY that copy a block onto itself.
    /// Only valid for partitions mapped on the dynamic path of a snapshot update.
    pub fn optimize_operation(&self, partition_name: &str, operation: &InstallOperation) -> Result<InstallOperation, PlanError> {
        if operation.op_type != OperationType::SourceCopy {
            return Err(PlanError::OptimizationNotApplicable("only SOURCE_COPY operations can be skipped"));
        }
        if !self.config.features.virtual_ab.is_enabled() {
            return Err(PlanError::OptimizationNotApplicable("Virtual A/B is not enabled"));
        }
        if !self.target_supports_snapshot {
            return Err(PlanError::OptimizationNotApplicable("target slot does not use snapshots"));
        }
        let mapped = self
            .target_slot
            .map_or(false, |target| self.mapped_devices.contains(&target.suffixed(partition_name)));
        if !mapped {
            return Err(PlanError::OptimizationNotApplicable("partition is not mapped as a dynamic partition"));
        }
        optimize_source_copy(operation)
    }

    /// Find the system_other device to erase, None when nothing should be erased
    pub fn get_system_other_path(
        &mut self,
        source: Slot,
        name_suffix: &str,
    ) -> Result<Option<SystemOtherPath>, PlanError> {
        let Some(has_avb) = self.config.avb_enabled_on_system_other else {
            error!("Cannot determine whether AVB is enabled on system_other");
            return Err(PlanError::SystemOther("AVB state of system_other is unknown".to_string()));
        };
        if !has_avb {
            info!("AVB is not enabled on system_other. Skip erasing.");
            return Ok(None);
        }
        let recovery = self.config.is_recovery;
        if !recovery && self.config.features.dynamic_partitions.is_retrofit() {
            error!("Cannot erase AVB footer on system_other on devices with retrofit dynamic partitions");
            return Err(PlanError::SystemOther("AVB enabled on retrofit system_other".to_string()));
        }

        if !self.config.features.dynamic_partitions.is_enabled() {
            let path = self.config.device_path(name_suffix);
            if !self.dm.device_exists(&path) {
                return Err(PlanError::DeviceNotFound(path));
            }
            return Ok(Some(SystemOtherPath { path, should_unmap: false }));
        }

        let source_super = self.config.super_device(source);
        let Some(table) = self.metadata.load(&source_super, source) else {
            if recovery {
                warn!("Super partition metadata cannot be read from the source slot, skip erasing");
                return Ok(None);
            }
            error!("Super partition metadata cannot be read from the source slot");
            return Err(PlanError::CorruptMetadata { device: source_super, slot: source });
        };
        let Some(partition) = table.find_partition(name_suffix) else {
            info!("Can't find {} in metadata source slot, skip erasing", name_suffix);
            return Ok(None);
        };
        if partition.has_attribute(LP_PARTITION_ATTR_UPDATED) {
            info!("{} was written by a previous update, skip erasing", name_suffix);
            return Ok(None);
        }
        if partition.size(table.block_size) < AVB_FOOTER_SIZE {
            info!("{} is smaller than the AVB footer, skip erasing", name_suffix);
            return Ok(None);
        }

        self.unmap_partition_on_device_mapper(name_suffix)?;
        let request = MapRequest {
            super_device: &source_super,
            partition_name: name_suffix,
            device_name: name_suffix,
            slot: source,
            force_writable: true,
        };
        let path = self
            .dm
            .map(&request)
            .ok_or_else(|| PlanError::MapFailed(name_suffix.to_string()))?;
        Ok(Some(SystemOtherPath { path, should_unmap: true }))
    }

    /// Zero the AVB footer of the factory system_other image so it is not
    /// verified as the target slot's system before it is rewritten
    pub fn erase_system_other_avb_footer(&mut self, source: Slot, target: Slot) -> Result<(), PlanError> {
        info!("Erasing AVB footer of system_other partition before update");
        let name_suffix = target.suffixed(SYSTEM_PARTITION_NAME);
        let Some(system_other) = self.get_system_other_path(source, &name_suffix)? else {
            return Ok(());
        };
        let erased = avb_footer_erase(&system_other.path);
        if system_other.should_unmap {
            self.unmap_partition_on_device_mapper(&name_suffix)?;
        }
        erased
    }
}

/// Overwrite the last AVB_FOOTER_SIZE bytes of `path` with zeros
pub fn avb_footer_erase(path: &str) -> Result<(), PlanError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let size = file.seek(SeekFrom::End(0))?;
    if size < AVB_FOOTER_SIZE {
        return Err(PlanError::SystemOther(format!("{} is smaller than the AVB footer", path)));
    }
    let zeros = [0u8; AVB_FOOTER_SIZE as usize];
    file.write_all_at(&zeros, size - AVB_FOOTER_SIZE)?;
    file.sync_all()?;
    info!("Erased AVB footer of {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn footer_erase_zeroes_tail_only() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), vec![b'X'; 4096]).unwrap();
        avb_footer_erase(file.path().to_str().unwrap()).unwrap();
        let content = fs::read(file.path()).unwrap();
        assert_eq!(content.len(), 4096);
        assert!(content[..4096 - 64].iter().all(|&b| b == b'X'));
        assert!(content[4096 - 64..].iter().all(|&b| b == 0));
    }

    #[test]
    fn footer_erase_rejects_tiny_devices() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), vec![b'X'; 10]).unwrap();
        assert!(avb_footer_erase(file.path().to_str().unwrap()).is_err());
    }
}

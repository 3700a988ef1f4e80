//! Device-mapper seam: mapping logical partitions of a super device to block
//! devices. The planner only sees this trait, the CLI plugs in a dry-run
//! mapper that records what it would do.
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use log::info;
use crate::bootctrl::Slot;
use crate::constants::DM_DEVICE_DIR;
use crate::gpt_helper::StaticPartitionIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmDeviceState {
    /// no such device
    #[default]
    Invalid,
    Suspended,
    Active,
}

/// One logical partition to map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest<'r> {
    pub super_device: &'r str,
    /// entry in the slot's partition table
    pub partition_name: &'r str,
    /// name of the device-mapper device to create
    pub device_name: &'r str,
    pub slot: Slot,
    pub force_writable: bool,
}

pub trait DeviceMapper {
    /// Create the device, returning its path
    fn map(&self, request: &MapRequest) -> Option<String>;
    /// Destroy the device if it exists; true when it is gone
    fn unmap(&self, device_name: &str) -> bool;
    fn state(&self, device_name: &str) -> DmDeviceState;
    fn dm_device_path(&self, device_name: &str) -> Option<String>;
    fn device_exists(&self, path: &str) -> bool;
}

/// Where to read and write one partition of a slot
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionDevice {
    /// empty when the partition must not be written directly
    pub rw_device_path: String,
    pub readonly_device_path: String,
    pub is_dynamic: bool,
}

impl PartitionDevice {
    pub fn same_path(path: String, is_dynamic: bool) -> Self {
        PartitionDevice {
            rw_device_path: path.clone(),
            readonly_device_path: path,
            is_dynamic,
        }
    }
}

/// Mapper that never touches the kernel: devices live in a table and are
/// reported under the mapper directory. Static partitions are found on disk
/// or in the GPT index.
pub struct DryRunDeviceMapper {
    devices: RefCell<HashMap<String, DmDeviceState>>,
    static_partitions: StaticPartitionIndex,
}

impl DryRunDeviceMapper {
    pub fn new(static_partitions: StaticPartitionIndex) -> Self {
        DryRunDeviceMapper {
            devices: RefCell::new(HashMap::new()),
            static_partitions,
        }
    }
}

impl DeviceMapper for DryRunDeviceMapper {
    fn map(&self, request: &MapRequest) -> Option<String> {
        info!("[dry-run] map {} of {} slot {} as {}{}", request.partition_name, request.super_device,
              request.slot, request.device_name, if request.force_writable { " (writable)" } else { "" });
        self.devices.borrow_mut().insert(request.device_name.to_string(), DmDeviceState::Active);
        self.dm_device_path(request.device_name)
    }

    fn unmap(&self, device_name: &str) -> bool {
        if self.devices.borrow_mut().remove(device_name).is_some() {
            info!("[dry-run] unmap {}", device_name);
        }
        true
    }

    fn state(&self, device_name: &str) -> DmDeviceState {
        self.devices.borrow().get(device_name).copied().unwrap_or_default()
    }

    fn dm_device_path(&self, device_name: &str) -> Option<String> {
        Some(format!("{}{}", DM_DEVICE_DIR, device_name))
    }

    fn device_exists(&self, path: &str) -> bool {
        if Path::new(path).exists() {
            return true;
        }
        Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| self.static_partitions.find(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_tracks_state() {
        let dm = DryRunDeviceMapper::new(StaticPartitionIndex::default());
        assert_eq!(dm.state("system_b"), DmDeviceState::Invalid);
        let path = dm.map(&MapRequest {
            super_device: "/dev/block/by-name/super",
            partition_name: "system_b",
            device_name: "system_b",
            slot: Slot::B,
            force_writable: true,
        });
        assert_eq!(path.as_deref(), Some("/dev/block/mapper/system_b"));
        assert_eq!(dm.state("system_b"), DmDeviceState::Active);
        assert!(dm.unmap("system_b"));
        assert!(dm.unmap("system_b"));
        assert_eq!(dm.state("system_b"), DmDeviceState::Invalid);
        assert!(!dm.device_exists("/nonexistent/by-name/boot_a"));
    }
}

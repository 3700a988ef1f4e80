#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use libdynpart_r::bootctrl::Slot;
use libdynpart_r::config::{DeviceConfig, FeatureFlag};
use libdynpart_r::constants::LP_PARTITION_ATTR_READONLY;
use libdynpart_r::device::{DeviceMapper, DmDeviceState, MapRequest};
use libdynpart_r::manifest::UpdateManifest;
use libdynpart_r::error::PlanError;
use libdynpart_r::metadata::{MetadataStore, SuperMetadata};
use libdynpart_r::planner::{DynamicPartitionControl, UpdateStrategy};
use libdynpart_r::snapshot::{SnapshotManager, SnapshotReturn};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;
pub const DEFAULT_GROUP: &str = "foo";
pub const DEFAULT_GROUP_SIZE: u64 = 5 * GIB;
/// two default groups plus the reserved metadata
pub const SUPER_SIZE: u64 = 2 * DEFAULT_GROUP_SIZE + MIB;
pub const FAKE_DEVICE_DIR: &str = "/fake/dev/path/";
pub const FAKE_MAPPER_DIR: &str = "/fake/mapped/";
pub const FAKE_SUPER: &str = "fake_super";

pub fn test_config() -> DeviceConfig {
    let mut config = DeviceConfig {
        device_dir: PathBuf::from(FAKE_DEVICE_DIR),
        super_partition_name: FAKE_SUPER.to_string(),
        avb_enabled_on_system_other: Some(false),
        ..DeviceConfig::default()
    };
    config.features.dynamic_partitions = FeatureFlag::Launch;
    config
}

pub fn virtual_ab_config() -> DeviceConfig {
    let mut config = test_config();
    config.features.virtual_ab = FeatureFlag::Launch;
    config
}

pub fn device(name: &str) -> String {
    format!("{}{}", FAKE_DEVICE_DIR, name)
}

pub fn dm_device(name: &str) -> String {
    format!("{}{}", FAKE_MAPPER_DIR, name)
}

/// Table with `<group>_a` and `<group>_b` groups; each suffixed partition
/// lands in the group of its own suffix
pub fn table_from<S: AsRef<str>>(super_size: u64, group: &str, group_size: u64, partitions: &[(S, u64)]) -> SuperMetadata {
    let mut table = SuperMetadata::new(super_size, MIB, 4096, vec![FAKE_SUPER.to_string()]).unwrap();
    for slot in [Slot::A, Slot::B] {
        table.add_group(&slot.suffixed(group), group_size).unwrap();
    }
    for (name, size) in partitions {
        let name = name.as_ref();
        let suffix = &name[name.len() - 2..];
        let group_name = format!("{}{}", group, suffix);
        table.add_partition(name, &group_name, LP_PARTITION_ATTR_READONLY).unwrap();
        table.resize_partition(name, *size).unwrap();
    }
    table
}

pub fn default_table<S: AsRef<str>>(partitions: &[(S, u64)]) -> SuperMetadata {
    table_from(SUPER_SIZE, DEFAULT_GROUP, DEFAULT_GROUP_SIZE, partitions)
}

/// Manifest with every partition in the default group
pub fn manifest_from(partitions: &[(&str, u64)]) -> UpdateManifest {
    UpdateManifest::with_group(DEFAULT_GROUP, DEFAULT_GROUP_SIZE, partitions)
}

/// partition name -> size in bytes
pub fn partition_sizes(table: &SuperMetadata) -> BTreeMap<String, u64> {
    table
        .partitions
        .iter()
        .map(|p| (p.name.clone(), p.size(table.block_size)))
        .collect()
}

pub fn sizes<S: AsRef<str>>(partitions: &[(S, u64)]) -> BTreeMap<String, u64> {
    partitions.iter().map(|(name, size)| (name.as_ref().to_string(), *size)).collect()
}

/// Tables keyed by (super device, slot), remembering every store
#[derive(Default)]
pub struct FakeMetadataStore {
    pub tables: RefCell<HashMap<(String, u32), SuperMetadata>>,
    pub stored: RefCell<Vec<(String, Slot, SuperMetadata)>>,
    pub fail_store: Cell<bool>,
}

impl FakeMetadataStore {
    pub fn set(&self, super_device: &str, slot: Slot, table: SuperMetadata) {
        self.tables.borrow_mut().insert((super_device.to_string(), slot.0), table);
    }

    pub fn last_stored(&self) -> Option<(String, Slot, SuperMetadata)> {
        self.stored.borrow().last().cloned()
    }

    pub fn store_count(&self) -> usize {
        self.stored.borrow().len()
    }
}

impl MetadataStore for FakeMetadataStore {
    fn load(&self, super_device: &str, slot: Slot) -> Option<SuperMetadata> {
        self.tables.borrow().get(&(super_device.to_string(), slot.0)).cloned()
    }

    fn store(&self, super_device: &str, metadata: &SuperMetadata, slot: Slot) -> bool {
        if self.fail_store.get() {
            return false;
        }
        self.stored
            .borrow_mut()
            .push((super_device.to_string(), slot, metadata.clone()));
        self.set(super_device, slot, metadata.clone());
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapCall {
    pub partition_name: String,
    pub device_name: String,
    pub slot: Slot,
    pub force_writable: bool,
}

/// Device mapper recording every call; devices exist only when listed
#[derive(Default)]
pub struct FakeDeviceMapper {
    pub states: RefCell<HashMap<String, DmDeviceState>>,
    pub maps: RefCell<Vec<MapCall>>,
    pub unmaps: RefCell<Vec<String>>,
    pub existing: RefCell<HashSet<String>>,
    pub fail_map: Cell<bool>,
    pub fail_unmap: RefCell<HashSet<String>>,
    /// device name -> path handed out by `map` instead of the mapper dir
    pub map_paths: RefCell<HashMap<String, String>>,
}

impl FakeDeviceMapper {
    pub fn set_state(&self, name: &str, state: DmDeviceState) {
        self.states.borrow_mut().insert(name.to_string(), state);
    }

    pub fn add_existing(&self, path: &str) {
        self.existing.borrow_mut().insert(path.to_string());
    }

    pub fn unmapped(&self) -> HashSet<String> {
        self.unmaps.borrow().iter().cloned().collect()
    }

    pub fn mapped_names(&self) -> Vec<String> {
        self.maps.borrow().iter().map(|m| m.device_name.clone()).collect()
    }
}

impl DeviceMapper for FakeDeviceMapper {
    fn map(&self, request: &MapRequest) -> Option<String> {
        if self.fail_map.get() {
            return None;
        }
        self.maps.borrow_mut().push(MapCall {
            partition_name: request.partition_name.to_string(),
            device_name: request.device_name.to_string(),
            slot: request.slot,
            force_writable: request.force_writable,
        });
        self.set_state(request.device_name, DmDeviceState::Active);
        let path = self.map_paths.borrow().get(request.device_name).cloned();
        Some(path.unwrap_or_else(|| dm_device(request.device_name)))
    }

    fn unmap(&self, device_name: &str) -> bool {
        self.unmaps.borrow_mut().push(device_name.to_string());
        if self.fail_unmap.borrow().contains(device_name) {
            return false;
        }
        self.states.borrow_mut().remove(device_name);
        true
    }

    fn state(&self, device_name: &str) -> DmDeviceState {
        self.states.borrow().get(device_name).copied().unwrap_or_default()
    }

    fn dm_device_path(&self, device_name: &str) -> Option<String> {
        Some(dm_device(device_name))
    }

    fn device_exists(&self, path: &str) -> bool {
        self.existing.borrow().contains(path)
    }
}

/// Snapshot engine answering every request with `result`
pub struct FakeSnapshotManager {
    pub result: RefCell<SnapshotReturn>,
    pub begin_calls: Cell<u32>,
    pub create_calls: Cell<u32>,
    pub cancel_calls: Cell<u32>,
    pub mountable: Cell<bool>,
    pub mounted: Cell<i32>,
}

impl Default for FakeSnapshotManager {
    fn default() -> Self {
        FakeSnapshotManager {
            result: RefCell::new(SnapshotReturn::Ok),
            begin_calls: Cell::new(0),
            create_calls: Cell::new(0),
            cancel_calls: Cell::new(0),
            mountable: Cell::new(true),
            mounted: Cell::new(0),
        }
    }
}

impl FakeSnapshotManager {
    pub fn returning(result: SnapshotReturn) -> Self {
        FakeSnapshotManager {
            result: RefCell::new(result),
            ..FakeSnapshotManager::default()
        }
    }
}

impl SnapshotManager for FakeSnapshotManager {
    fn begin_update(&self) -> bool {
        self.begin_calls.set(self.begin_calls.get() + 1);
        true
    }

    fn create_update_snapshots(&self, _manifest: &UpdateManifest) -> SnapshotReturn {
        self.create_calls.set(self.create_calls.get() + 1);
        self.result.borrow().clone()
    }

    fn cancel_update(&self) -> bool {
        self.cancel_calls.set(self.cancel_calls.get() + 1);
        true
    }

    fn ensure_metadata_mounted(&self) -> bool {
        if self.mountable.get() {
            self.mounted.set(self.mounted.get() + 1);
        }
        self.mountable.get()
    }

    fn release_metadata(&self) {
        self.mounted.set(self.mounted.get() - 1);
    }
}

/// Fakes shared by one planner under test
#[derive(Default)]
pub struct Harness {
    pub store: FakeMetadataStore,
    pub dm: FakeDeviceMapper,
    pub snapshot: FakeSnapshotManager,
}

impl Harness {
    pub fn control(&self, config: DeviceConfig) -> DynamicPartitionControl<'_> {
        DynamicPartitionControl::new(config, &self.store, &self.dm, &self.snapshot)
    }

    pub fn super_device() -> String {
        device(FAKE_SUPER)
    }

    pub fn set_metadata(&self, slot: Slot, table: SuperMetadata) {
        self.store.set(&Self::super_device(), slot, table);
    }

    /// Same table for both slots, as after a completed update
    pub fn set_default_metadata<S: AsRef<str>>(&self, partitions: &[(S, u64)]) {
        for slot in [Slot::A, Slot::B] {
            self.set_metadata(slot, default_table(partitions));
        }
    }

    pub fn prepare(
        &self,
        config: DeviceConfig,
        source: Slot,
        target: Slot,
        manifest: &UpdateManifest,
    ) -> Result<UpdateStrategy, PlanError> {
        let mut control = self.control(config);
        let result = control.prepare_partitions_for_update(source, target, manifest, true, false);
        result
    }

    /// Sizes of the last table committed for `slot`
    pub fn stored_sizes(&self, slot: Slot) -> Option<BTreeMap<String, u64>> {
        self.store
            .stored
            .borrow()
            .iter()
            .rev()
            .find(|(_, stored_slot, _)| *stored_slot == slot)
            .map(|(_, _, table)| partition_sizes(table))
    }
}

pub mod bootctrl;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod extent;
pub mod extent_ranges;
pub mod gpt_helper;
pub mod manifest;
pub mod metadata;
pub mod optimizer;
pub mod partition_device;
pub mod planner;
pub mod snapshot;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use log::{debug, info};
use bootctrl::Slot;
use config::DeviceConfig;
use constants::{get_block_dev_dir, DEFAULT_METADATA_RESERVED_BYTES, LP_PARTITION_ATTR_READONLY};
use device::DryRunDeviceMapper;
use error::PlanError;
use extent::bytes2ieee;
use gpt_helper::StaticPartitionIndex;
use manifest::{InstallOperation, UpdateManifest};
use metadata::{FileMetadataStore, MetadataStore, SuperMetadata};
use planner::{DynamicPartitionControl, UpdateStrategy};
use snapshot::OfflineSnapshotManager;

/// Generate a template device config file
pub fn write_template_config(path: &Path) -> Result<(), PlanError> {
    let mut file = fs::File::create(path)?;
    file.write_all(DeviceConfig::template().as_bytes())?;
    info!("Template config written to {}", path.display());
    match get_block_dev_dir() {
        Some(dir) => info!("Block devices by name found under {}", dir.display()),
        None => info!("No by-name block device directory here, set device_dir before use"),
    }
    Ok(())
}

fn metadata_store(config: &DeviceConfig) -> Result<FileMetadataStore, PlanError> {
    let dir = config
        .metadata_dir
        .as_ref()
        .ok_or_else(|| PlanError::InvalidMetadata("metadata_dir is not set in config".to_string()))?;
    fs::create_dir_all(dir)?;
    Ok(FileMetadataStore::new(dir))
}

fn dry_run_mapper(config: &DeviceConfig) -> DryRunDeviceMapper {
    DryRunDeviceMapper::new(StaticPartitionIndex::scan(&config.gpt_disks))
}

/// Create the tables of both slots: an empty super of `super_size` bytes,
/// with `manifest`'s layout for `slot` when given
pub fn init_super_metadata(
    config_path: &Path,
    super_size: u64,
    slot: Slot,
    manifest_path: Option<&Path>,
) -> Result<SuperMetadata, PlanError> {
    let slot = Slot::new(slot.0)?;
    let config = DeviceConfig::from_toml_file(config_path)?;
    let store = metadata_store(&config)?;
    let super_name = config.super_partition_name(slot);
    let mut table = SuperMetadata::new(super_size, DEFAULT_METADATA_RESERVED_BYTES, config.block_size, vec![super_name])?;
    if let Some(path) = manifest_path {
        let manifest = UpdateManifest::from_toml_file(path)?;
        table.add_slot_layout(manifest.groups(), slot, LP_PARTITION_ATTR_READONLY)?;
    }
    let retrofit = config.features.dynamic_partitions.is_retrofit();
    let other = table.for_update(slot, slot.other(), retrofit);
    for (current, current_table) in [(slot, &table), (slot.other(), &other)] {
        let device = config.super_device(current);
        if !store.store(&device, current_table, current) {
            return Err(PlanError::CommitFailed { device, slot: current });
        }
        debug!("Initial table stored for slot {} at {}", current, device);
    }
    info!("Initialized super of {} with {} partitions", bytes2ieee(super_size), table.partitions.len());
    Ok(table)
}

/// Prepare `target` for the manifest at `manifest_path` against the file
/// backed store, returning the chosen strategy and the target's table
pub fn run_plan(
    config_path: &Path,
    manifest_path: &Path,
    source: Slot,
    target: Slot,
    resume: bool,
    delete_source: bool,
) -> Result<(UpdateStrategy, Option<SuperMetadata>), PlanError> {
    let config = DeviceConfig::from_toml_file(config_path)?;
    let manifest = UpdateManifest::from_toml_file(manifest_path)?;
    let store = metadata_store(&config)?;
    let dm = dry_run_mapper(&config);
    let snapshot = OfflineSnapshotManager;
    let target_device = config.super_device(target);

    let mut control = DynamicPartitionControl::new(config, &store, &dm, &snapshot);
    let strategy = control.prepare_partitions_for_update(source, target, &manifest, !resume, delete_source)?;
    info!("Slot {} prepared with {:?}", target, strategy);
    control.cleanup()?;
    Ok((strategy, store.load(&target_device, target)))
}

/// Load the stored table of `slot`
pub fn show_slot(config_path: &Path, slot: Slot) -> Result<SuperMetadata, PlanError> {
    let slot = Slot::new(slot.0)?;
    let config = DeviceConfig::from_toml_file(config_path)?;
    let store = metadata_store(&config)?;
    let device = config.super_device(slot);
    store
        .load(&device, slot)
        .ok_or(PlanError::CorruptMetadata { device, slot })
}

/// Resolve `partition` of the target slot as an in-progress update would,
/// then drop the self-copies from the SOURCE_COPY operation at `operation_path`
pub fn run_optimize(
    config_path: &Path,
    manifest_path: &Path,
    operation_path: &Path,
    partition: &str,
    source: Slot,
) -> Result<InstallOperation, PlanError> {
    let config = DeviceConfig::from_toml_file(config_path)?;
    let manifest = UpdateManifest::from_toml_file(manifest_path)?;
    let source = Slot::new(source.0)?;
    let operation = InstallOperation::from_toml_file(operation_path)?;
    let store = metadata_store(&config)?;
    let dm = dry_run_mapper(&config);
    let snapshot = OfflineSnapshotManager;
    let target = source.other();

    let mut control = DynamicPartitionControl::new(config, &store, &dm, &snapshot);
    control.prepare_partitions_for_update(source, target, &manifest, false, false)?;
    let device = control.get_partition_device(partition, target, source, false)?;
    debug!("{} resolved to {:?}", partition, device);
    let optimized = control.optimize_operation(partition, &operation)?;
    control.cleanup()?;
    Ok(optimized)
}

/// Default location of a config file next to the metadata tables
pub fn default_config_path() -> PathBuf {
    PathBuf::from("/data/local/tmp/dynpart/device.toml")
}

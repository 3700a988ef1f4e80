//! Dynamic partition planning for an A/B update.
//!
//! [`DynamicPartitionControl`] decides how the target slot's logical
//! partitions are laid out in super. A Virtual A/B payload is handed to the
//! snapshot engine; everything else rewrites the partition table directly,
//! resizing target partitions in place and committing the table once.
use std::collections::{BTreeMap, HashSet};
use log::{error, info, warn};
use crate::bootctrl::{Slot, SlotPair};
use crate::config::DeviceConfig;
use crate::constants::{COW_GROUP_NAME, LP_PARTITION_ATTR_READONLY, LP_PARTITION_ATTR_UPDATED, MAX_NUM_SLOTS};
use crate::device::DeviceMapper;
use crate::error::PlanError;
use crate::extent::{bytes2ieee, div_round_up};
use crate::manifest::UpdateManifest;
use crate::metadata::{MetadataStore, SuperMetadata};
use crate::snapshot::{MetadataMountGuard, SnapshotManager, SnapshotReturn};

/// How one prepare call lays out the target slot, chosen once per call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// partitions are static for this update, the table is left alone
    Static,
    /// resuming an update whose table was already prepared
    Resume,
    /// copy-on-write snapshots created by the snapshot engine
    Snapshot,
    /// table rewritten in place, optionally reclaiming the source slot
    Direct { delete_source: bool },
}

pub struct DynamicPartitionControl<'a> {
    pub(crate) config: DeviceConfig,
    pub(crate) metadata: &'a dyn MetadataStore,
    pub(crate) dm: &'a dyn DeviceMapper,
    pub(crate) snapshot: &'a dyn SnapshotManager,
    pub(crate) source_slot: Option<Slot>,
    pub(crate) target_slot: Option<Slot>,
    pub(crate) target_supports_snapshot: bool,
    pub(crate) is_target_dynamic: bool,
    pub(crate) uses_compression: bool,
    /// device-mapper devices created through this planner
    pub(crate) mapped_devices: HashSet<String>,
    pub(crate) dynamic_partition_list: [Vec<String>; MAX_NUM_SLOTS as usize],
    metadata_mount: Option<MetadataMountGuard<'a>>,
}

impl<'a> DynamicPartitionControl<'a> {
    pub fn new(
        config: DeviceConfig,
        metadata: &'a dyn MetadataStore,
        dm: &'a dyn DeviceMapper,
        snapshot: &'a dyn SnapshotManager,
    ) -> Self {
        DynamicPartitionControl {
            config,
            metadata,
            dm,
            snapshot,
            source_slot: None,
            target_slot: None,
            target_supports_snapshot: false,
            is_target_dynamic: false,
            uses_compression: false,
            mapped_devices: HashSet::new(),
            dynamic_partition_list: Default::default(),
            metadata_mount: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn target_supports_snapshot(&self) -> bool {
        self.target_supports_snapshot
    }

    pub fn is_target_dynamic(&self) -> bool {
        self.is_target_dynamic
    }

    pub(crate) fn load_metadata(&self, super_device: &str, slot: Slot) -> Result<SuperMetadata, PlanError> {
        self.metadata.load(super_device, slot).ok_or_else(|| {
            error!("No valid metadata at {} for slot {}", super_device, slot);
            PlanError::CorruptMetadata { device: super_device.to_string(), slot }
        })
    }

    /// Prepare the target slot's partitions for `manifest`.
    ///
    /// `update` is false when resuming an interrupted update: slots and
    /// target state are recorded but no metadata is touched.
    /// `delete_source` asks to drop the source slot's copies of the
    /// manifest's partitions, which is only allowed in recovery.
    pub fn prepare_partitions_for_update(
        &mut self,
        source: Slot,
        target: Slot,
        manifest: &UpdateManifest,
        update: bool,
        delete_source: bool,
    ) -> Result<UpdateStrategy, PlanError> {
        self.source_slot = Some(source);
        self.target_slot = Some(target);

        if !self.config.features.dynamic_partitions.is_enabled() {
            info!("Dynamic partitions are not enabled, nothing to prepare");
            return Ok(UpdateStrategy::Static);
        }
        let slots = SlotPair::new(source, target).map_err(|e| {
            error!("Cannot prepare partitions: {}", e);
            e
        })?;

        let virtual_ab = self.config.features.virtual_ab.is_enabled();
        self.target_supports_snapshot = virtual_ab && manifest.snapshot_enabled();
        self.uses_compression = self.target_supports_snapshot
            && self.config.features.virtual_ab_compression.is_enabled()
            && manifest.vabc_enabled();
        self.is_target_dynamic = manifest.is_dynamic();
        if let Some(list) = self.dynamic_partition_list.get_mut(target.0 as usize) {
            *list = manifest
                .dynamic_partition_metadata
                .iter()
                .flat_map(|m| m.partition_names())
                .map(str::to_string)
                .collect();
        }

        if !self.is_target_dynamic {
            info!("Payload does not describe dynamic partitions, treating slot {} as static", target);
            return Ok(UpdateStrategy::Static);
        }
        if !update {
            info!("Resuming update to slot {}, partition metadata is kept", target);
            return Ok(UpdateStrategy::Resume);
        }
        manifest.validate()?;
        if delete_source && !self.config.is_recovery {
            error!("Refusing to delete source partitions outside recovery");
            return Err(PlanError::DeleteSourceOutsideRecovery);
        }

        let strategy = self.select_strategy(delete_source);
        info!("Preparing slot {} from slot {} with {:?}", slots.target, slots.source, strategy);
        let applied = match strategy {
            UpdateStrategy::Snapshot => {
                match self.prepare_snapshot_partitions_for_update(slots, manifest) {
                    Ok(()) => return Ok(UpdateStrategy::Snapshot),
                    Err(e) if !self.config.is_recovery => {
                        error!("Cannot create snapshots outside recovery: {}", e);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!("Snapshot update failed in recovery ({}), overwriting partitions and deleting source", e);
                        self.cancel_previous_update()?;
                        UpdateStrategy::Direct { delete_source: true }
                    }
                }
            }
            UpdateStrategy::Direct { .. } if virtual_ab => {
                info!("Using regular A/B on Virtual A/B because package disabled snapshots");
                self.cancel_previous_update()?;
                strategy
            }
            other => other,
        };
        if let UpdateStrategy::Direct { delete_source } = applied {
            self.prepare_dynamic_partitions_for_update(slots, manifest, delete_source)?;
        }
        Ok(applied)
    }

    fn select_strategy(&self, delete_source: bool) -> UpdateStrategy {
        if self.target_supports_snapshot {
            UpdateStrategy::Snapshot
        } else {
            UpdateStrategy::Direct { delete_source }
        }
    }

    /// /metadata must be mounted for the snapshot engine; in recovery it may
    /// legitimately be missing, e.g. freshly wiped
    fn expect_metadata_mounted(&mut self) -> bool {
        if !self.config.is_recovery {
            return true;
        }
        if self.metadata_mount.is_none() {
            self.metadata_mount = MetadataMountGuard::acquire(self.snapshot);
        }
        self.metadata_mount.is_some()
    }

    fn cancel_previous_update(&mut self) -> Result<(), PlanError> {
        if !self.expect_metadata_mounted() {
            info!("Skip canceling previous update because metadata is not mounted");
            return Ok(());
        }
        if !self.snapshot.cancel_update() {
            error!("Cannot cancel previous snapshot update");
            return Err(PlanError::Snapshot("cannot cancel previous update".to_string()));
        }
        Ok(())
    }

    fn prepare_snapshot_partitions_for_update(&mut self, slots: SlotPair, manifest: &UpdateManifest) -> Result<(), PlanError> {
        info!("Creating Virtual A/B snapshots");
        if !self.expect_metadata_mounted() {
            error!("/metadata is not mounted, cannot create snapshots");
            return Err(PlanError::Snapshot("metadata is not mounted".to_string()));
        }
        // fits before anything is begun
        self.check_super_allocatable_space(slots.source, manifest)?;
        if !self.snapshot.begin_update() {
            return Err(PlanError::Snapshot("cannot begin update".to_string()));
        }
        match self.snapshot.create_update_snapshots(manifest) {
            SnapshotReturn::Ok => {
                info!("Snapshots created for slot {}", slots.target);
                Ok(())
            }
            SnapshotReturn::NoSpace(required) => {
                warn!("Not enough space for snapshots, {} required", bytes2ieee(required));
                Err(PlanError::SnapshotNoSpace { required })
            }
            SnapshotReturn::Error(reason) => Err(PlanError::Snapshot(reason)),
        }
    }

    /// The groups of a snapshot update may use all of super
    fn check_super_allocatable_space(&self, source: Slot, manifest: &UpdateManifest) -> Result<(), PlanError> {
        let super_device = self.config.super_device(source);
        let table = self.load_metadata(&super_device, source)?;
        let required = manifest.required_space(table.block_size)?;
        let available = table.allocatable_space();
        if required > available {
            error!("Update needs {} but super only has {}", bytes2ieee(required), bytes2ieee(available));
            return Err(PlanError::SuperOverBudget { required, available });
        }
        Ok(())
    }

    fn prepare_dynamic_partitions_for_update(
        &mut self,
        slots: SlotPair,
        manifest: &UpdateManifest,
        delete_source: bool,
    ) -> Result<(), PlanError> {
        let SlotPair { source, target } = slots;
        // target devices would not match the new table
        let wanted: Vec<String> = manifest
            .groups()
            .iter()
            .flat_map(|g| g.partitions.keys())
            .map(|name| target.suffixed(name))
            .collect();
        for name in &wanted {
            self.unmap_partition_on_device_mapper(name)?;
        }
        self.erase_system_other_avb_footer(source, target)?;

        let source_device = self.config.super_device(source);
        let retrofit = self.config.features.dynamic_partitions.is_retrofit();
        let mut table = self.load_metadata(&source_device, source)?.for_update(source, target, retrofit);

        let stale: Vec<String> = table
            .partitions
            .iter()
            .filter(|p| p.name.ends_with(target.suffix()) && !wanted.contains(&p.name))
            .map(|p| p.name.clone())
            .collect();
        for name in &stale {
            self.unmap_partition_on_device_mapper(name)?;
        }

        let deleted = if delete_source {
            Self::delete_source_partitions(&mut table, source, manifest)
        } else {
            Vec::new()
        };
        self.update_partition_metadata(&mut table, target, manifest)?;

        let target_device = self.config.super_device(target);
        if !self.metadata.store(&target_device, &table, target) {
            error!("Cannot write metadata to {} for slot {}", target_device, target);
            return Err(PlanError::CommitFailed { device: target_device, slot: target });
        }
        info!("Committed slot {} metadata, {} used of {}", target,
              bytes2ieee(table.used_space()), bytes2ieee(table.allocatable_space()));

        // the source devices only go away once the new table is durable
        for name in &deleted {
            self.unmap_partition_on_device_mapper(name)?;
        }
        Ok(())
    }

    /// Remove the source slot's copies of the manifest's partitions, returning their names
    fn delete_source_partitions(table: &mut SuperMetadata, source: Slot, manifest: &UpdateManifest) -> Vec<String> {
        let mut deleted = Vec::new();
        for group in manifest.groups() {
            for partition in group.partitions.keys() {
                let name = source.suffixed(partition);
                if table.remove_partition(&name) {
                    info!("Deleting source partition {}", name);
                    deleted.push(name);
                }
            }
        }
        deleted
    }

    /// Rewrite the target slot's groups and partitions in `table` to match `manifest`.
    ///
    /// Source slot entries are never touched. Target partitions are resized
    /// in place: stale entries go first, then every shrink, then group
    /// budgets, then every grow or create, so freed blocks are reused.
    pub fn update_partition_metadata(
        &self,
        table: &mut SuperMetadata,
        target: Slot,
        manifest: &UpdateManifest,
    ) -> Result<(), PlanError> {
        if !target.is_valid() {
            return Err(PlanError::InvalidSlot(target.0));
        }
        let suffix = target.suffix();
        // group budgets alone miss groups of size 0
        let required = manifest.required_space(table.block_size)?;
        let mut available = table.allocatable_space();
        // both slots share one super without Virtual A/B
        if !self.config.features.dynamic_partitions.is_retrofit() && !self.config.features.virtual_ab.is_enabled() {
            available /= 2;
        }
        if required > available {
            error!("Update needs {} but only {} is available for slot {}",
                   bytes2ieee(required), bytes2ieee(available), target);
            return Err(PlanError::SuperOverBudget { required, available });
        }

        if table.remove_group_and_partitions(COW_GROUP_NAME) {
            info!("Removed group {} left by a previous update", COW_GROUP_NAME);
        }

        // suffixed partition name -> (suffixed group name, size)
        let mut wanted: BTreeMap<String, (String, u64)> = BTreeMap::new();
        let mut wanted_groups = HashSet::new();
        for group in manifest.groups() {
            let group_name = target.suffixed(&group.name);
            for (partition, size) in &group.partitions {
                wanted.insert(target.suffixed(partition), (group_name.clone(), *size));
            }
            wanted_groups.insert(group_name);
        }

        let stale: Vec<String> = table
            .partitions
            .iter()
            .filter(|p| p.name.ends_with(suffix) && !wanted.contains_key(&p.name))
            .map(|p| p.name.clone())
            .collect();
        for name in stale {
            info!("Removing partition {}", name);
            table.remove_partition(&name);
        }

        for (name, (_, size)) in &wanted {
            let shrinks = table
                .find_partition(name)
                .map_or(false, |p| p.num_blocks() > div_round_up(*size, table.block_size));
            if shrinks {
                table.resize_partition(name, *size)?;
                info!("Shrunk {} to {}", name, bytes2ieee(*size));
            }
        }

        for group in manifest.groups() {
            let group_name = target.suffixed(&group.name);
            if table.find_group(&group_name).is_none() {
                info!("Adding group {} with size {}", group_name, bytes2ieee(group.size));
                table.add_group(&group_name, group.size)?;
            }
        }
        for (name, (group_name, _)) in &wanted {
            let moves = table.find_partition(name).map_or(false, |p| &p.group_name != group_name);
            if moves {
                info!("Moving {} to group {}", name, group_name);
                table.change_partition_group(name, group_name)?;
            }
        }
        for group in manifest.groups() {
            let group_name = target.suffixed(&group.name);
            table.resize_group(&group_name, group.size).map_err(|e| {
                error!("Cannot resize group {}: {}", group_name, e);
                e
            })?;
        }
        let stale_groups: Vec<String> = table
            .group_names()
            .into_iter()
            .filter(|g| g.ends_with(suffix) && !wanted_groups.contains(g))
            .collect();
        for group in stale_groups {
            info!("Removing group {}", group);
            table.remove_group_and_partitions(&group);
        }

        for group in manifest.groups() {
            let group_name = target.suffixed(&group.name);
            for (partition, size) in &group.partitions {
                let name = target.suffixed(partition);
                if table.find_partition(&name).is_none() {
                    info!("Adding partition {} to group {}", name, group_name);
                    table.add_partition(&name, &group_name, LP_PARTITION_ATTR_READONLY | LP_PARTITION_ATTR_UPDATED)?;
                } else {
                    table.set_partition_attributes(&name, LP_PARTITION_ATTR_READONLY | LP_PARTITION_ATTR_UPDATED)?;
                }
                table.resize_partition(&name, *size).map_err(|e| {
                    error!("Cannot resize {} to {}: {}", name, bytes2ieee(*size), e);
                    e
                })?;
            }
        }
        Ok(())
    }

    /// Forget any in-flight snapshot update
    pub fn reset_update(&mut self) -> Result<(), PlanError> {
        if !self.config.features.virtual_ab.is_enabled() {
            return Ok(());
        }
        info!("Resetting snapshot update state");
        self.cancel_previous_update()
    }

    /// Unmap everything this planner mapped and release /metadata
    pub fn cleanup(&mut self) -> Result<(), PlanError> {
        let result = self.unmap_all_partitions();
        self.metadata_mount = None;
        result
    }
}

impl Drop for DynamicPartitionControl<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Cleanup failed: {}", e);
        }
    }
}

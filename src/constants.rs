use std::fs;
use std::path::PathBuf;

pub const BLOCK_DEV_NAME_MAPPER: &str = "/dev/block/by-name/";
pub const BLOCK_DEV_NAME_BOOT: &str = "/dev/block/bootdevice/by-name/";
/// device mapper nodes, also where compressed snapshot devices show up
pub const DM_DEVICE_DIR: &str = "/dev/block/mapper/";

pub const SUPER_PARTITION_NAME: &str = "super";
/// on retrofit devices the super metadata of a slot lives on system<suffix>
pub const RETROFIT_SUPER_BASE_NAME: &str = "system";
pub const SYSTEM_PARTITION_NAME: &str = "system";
/// group left behind by a Virtual A/B update, holding copy-on-write partitions
pub const COW_GROUP_NAME: &str = "cow";
/// source partitions are mapped read-only under this extra suffix during an update
pub const SOURCE_MAPPING_SUFFIX: &str = "_ota";

pub const LP_PARTITION_ATTR_READONLY: u32 = 1 << 0;
/// set on partitions written by an update, never on factory-flashed ones
pub const LP_PARTITION_ATTR_UPDATED: u32 = 1 << 2;

pub const DEFAULT_BLOCK_SIZE: u64 = 4096;
/// space at the start of super reserved for geometry and metadata copies
pub const DEFAULT_METADATA_RESERVED_BYTES: u64 = 1024 * 1024;
pub const AVB_FOOTER_SIZE: u64 = 64;
pub const MAX_NUM_SLOTS: u32 = 2;

pub const METADATA_HEAD_MAGIC: &str = "DYNPART_HEAD_MAGIC";
pub const METADATA_TAIL_MAGIC: &str = "DYNPART_TAIL_MAGIC";
pub const METADATA_FILE_EXTENSION: &str = "lpmd";

pub const BOOTCONFIG_PATH: &str = "/proc/bootconfig";
pub const CMDLINE_PATH: &str = "/proc/cmdline";
pub const SLOT_SUFFIX_PROPERTY: &str = "androidboot.slot_suffix";

/// Get the block device name mapper dir path, None if no candidate exists
pub fn get_block_dev_dir() -> Option<PathBuf> {
    [BLOCK_DEV_NAME_MAPPER, BLOCK_DEV_NAME_BOOT]
        .iter()
        .find(|dir| fs::metadata(dir).is_ok())
        .map(PathBuf::from)
}

use std::fs;
use std::path::{Path, PathBuf};
use gpt::disk::LogicalBlockSize;
use gpt::GptConfig;
use log::{debug, warn};
use crate::error::PlanError;

/// A physical partition found in a GPT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptPartitionInfo {
    pub name: String,
    pub disk: PathBuf,
    pub id: u32,
    pub first_lba: u64,
    pub last_lba: u64,
    pub sector_size: u64,
}

impl GptPartitionInfo {
    pub fn size(&self) -> u64 {
        (self.last_lba - self.first_lba + 1) * self.sector_size
    }
}

/// Static partitions of the configured disks, looked up by partition name
#[derive(Debug, Clone, Default)]
pub struct StaticPartitionIndex {
    partitions: Vec<GptPartitionInfo>,
}

impl StaticPartitionIndex {
    /// Read every disk; disks without a readable GPT are skipped
    pub fn scan(disks: &[PathBuf]) -> Self {
        let mut partitions = Vec::new();
        for disk in disks {
            match read_gpt_partitions(disk) {
                Ok(found) => {
                    debug!("{} static partitions on {}", found.len(), disk.display());
                    partitions.extend(found);
                }
                Err(e) => warn!("Skip disk {}: {}", disk.display(), e),
            }
        }
        StaticPartitionIndex { partitions }
    }

    pub fn find(&self, name: &str) -> Option<&GptPartitionInfo> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GptPartitionInfo> {
        self.partitions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// get disk sector size via sysfs, image files are read with 512 byte sectors
pub fn get_disk_sector_size(disk: &Path) -> Result<u64, PlanError> {
    let real = resolve_block_device(disk);
    if fs::metadata(&real).map(|m| m.is_file()).unwrap_or(false) {
        return Ok(512);
    }
    let disk_name = real
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PlanError::DeviceNotFound(disk.display().to_string()))?;
    let path = format!("/sys/class/block/{}/queue/logical_block_size", disk_name);
    let size_str = fs::read_to_string(&path)?;
    size_str
        .trim()
        .parse()
        .map_err(|_| PlanError::InvalidMetadata(format!("bad logical block size in {}", path)))
}

/// Map a sector size onto what the gpt crate understands
pub fn try_get_disk_lba(sector_size: u64) -> Result<LogicalBlockSize, PlanError> {
    match sector_size {
        512 => Ok(LogicalBlockSize::Lb512),
        4096 => Ok(LogicalBlockSize::Lb4096),
        other => Err(PlanError::InvalidMetadata(format!("unsupported sector size {}", other))),
    }
}

/// List the partitions of `disk` without opening it for writing
pub fn read_gpt_partitions(disk: &Path) -> Result<Vec<GptPartitionInfo>, PlanError> {
    let sector_size = get_disk_sector_size(disk)?;
    let gptcfg = GptConfig::new().writable(false).logical_block_size(try_get_disk_lba(sector_size)?);
    let gpt_disk = gptcfg
        .open(disk)
        .map_err(|e| PlanError::DeviceNotFound(format!("{}: {:?}", disk.display(), e)))?;
    Ok(gpt_disk
        .partitions()
        .iter()
        .map(|(id, partition)| GptPartitionInfo {
            name: partition.name.clone(),
            disk: disk.to_path_buf(),
            id: *id,
            first_lba: partition.first_lba,
            last_lba: partition.last_lba,
            sector_size,
        })
        .collect())
}

/// Follow a by-name symlink to the device node, path can be link or real device
pub fn resolve_block_device(path: &Path) -> PathBuf {
    match nix::fcntl::readlink(path) {
        Ok(target) => {
            let target = PathBuf::from(target);
            if target.is_absolute() {
                target
            } else {
                path.parent().map_or(target.clone(), |dir| dir.join(&target))
            }
        }
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_files_use_512_byte_sectors() {
        let image = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(get_disk_sector_size(image.path()).unwrap(), 512);
        assert!(try_get_disk_lba(1000).is_err());
    }

    #[test]
    fn blank_image_has_no_gpt() {
        let image = tempfile::NamedTempFile::new().unwrap();
        fs::write(image.path(), vec![0u8; 64 * 1024]).unwrap();
        assert!(read_gpt_partitions(image.path()).is_err());
        let index = StaticPartitionIndex::scan(&[image.path().to_path_buf()]);
        assert!(index.is_empty());
        assert!(index.find("boot_a").is_none());
    }

    #[test]
    fn resolves_relative_links() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("sda5");
        fs::write(&node, b"").unwrap();
        let by_name = dir.path().join("by-name");
        fs::create_dir(&by_name).unwrap();
        let link = by_name.join("system_b");
        std::os::unix::fs::symlink("../sda5", &link).unwrap();
        assert_eq!(resolve_block_device(&link), by_name.join("../sda5"));
        assert_eq!(resolve_block_device(&node), node);
    }
}

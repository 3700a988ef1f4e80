use thiserror::Error;
use crate::bootctrl::Slot;

/// Everything the planner can fail with. Nothing is retried internally;
/// the caller decides whether to free space, switch update mode or abort.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("No valid super partition metadata at {device} for slot {slot}")]
    CorruptMetadata { device: String, slot: Slot },
    #[error("Cannot prepare an update with source and target both at slot {0}")]
    SameSlotRequested(Slot),
    #[error("Slot {0} does not exist on this device")]
    InvalidSlot(u32),
    #[error("Group {group} needs {required} bytes but its maximum size is {available} bytes")]
    GroupOverBudget {
        group: String,
        required: u64,
        available: u64,
    },
    #[error("Super partition needs {required} bytes but only {available} bytes are allocatable")]
    SuperOverBudget { required: u64, available: u64 },
    #[error("Not enough space for snapshots, {required} bytes required")]
    SnapshotNoSpace { required: u64 },
    #[error("Snapshot update failed: {0}")]
    Snapshot(String),
    #[error("Cannot write super partition metadata to {device} for slot {slot}")]
    CommitFailed { device: String, slot: Slot },
    #[error("Cannot unmap {0} from device mapper")]
    UnmapFailed(String),
    #[error("Cannot map {0} on device mapper")]
    MapFailed(String),
    #[error("Operation cannot be optimized: {0}")]
    OptimizationNotApplicable(&'static str),
    #[error("Device {0} does not exist")]
    DeviceNotFound(String),
    #[error("Invalid partition metadata: {0}")]
    InvalidMetadata(String),
    #[error("Cannot erase AVB footer of system_other: {0}")]
    SystemOther(String),
    #[error("Source partitions can only be deleted in recovery")]
    DeleteSourceOutsideRecovery,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("Config parse error")]
    ConfigParse(#[from] toml::de::Error),
}

impl PlanError {
    /// Extra bytes needed for the update to fit, when the failure is a space shortfall
    pub fn required_size(&self) -> Option<u64> {
        match self {
            PlanError::SuperOverBudget { required, available } => {
                Some(required.saturating_sub(*available))
            }
            PlanError::SnapshotNoSpace { required } => Some(*required),
            _ => None,
        }
    }

    pub fn is_out_of_space(&self) -> bool {
        matches!(
            self,
            PlanError::GroupOverBudget { .. }
                | PlanError::SuperOverBudget { .. }
                | PlanError::SnapshotNoSpace { .. }
        )
    }
}

//! Request/response contract of the copy-on-write snapshot engine.
use log::{info, warn};
use crate::manifest::UpdateManifest;

/// Outcome of asking for update snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotReturn {
    Ok,
    /// bytes that must be freed before the snapshots fit
    NoSpace(u64),
    Error(String),
}

impl SnapshotReturn {
    pub fn is_ok(&self) -> bool {
        matches!(self, SnapshotReturn::Ok)
    }
}

pub trait SnapshotManager {
    /// Reset update state and start a new update
    fn begin_update(&self) -> bool;
    fn create_update_snapshots(&self, manifest: &UpdateManifest) -> SnapshotReturn;
    fn cancel_update(&self) -> bool;
    /// Make sure /metadata is mounted; false if it cannot be
    fn ensure_metadata_mounted(&self) -> bool;
    /// Undo a successful [`SnapshotManager::ensure_metadata_mounted`]
    fn release_metadata(&self);
}

/// Keeps /metadata mounted until dropped
pub struct MetadataMountGuard<'a> {
    snapshot: &'a dyn SnapshotManager,
}

impl<'a> MetadataMountGuard<'a> {
    pub fn acquire(snapshot: &'a dyn SnapshotManager) -> Option<Self> {
        if snapshot.ensure_metadata_mounted() {
            Some(MetadataMountGuard { snapshot })
        } else {
            None
        }
    }
}

impl Drop for MetadataMountGuard<'_> {
    fn drop(&mut self) {
        self.snapshot.release_metadata();
    }
}

/// Snapshot manager for hosts without a snapshot engine: every snapshot
/// request fails, so Virtual A/B payloads take the direct path in recovery.
#[derive(Debug, Default)]
pub struct OfflineSnapshotManager;

impl SnapshotManager for OfflineSnapshotManager {
    fn begin_update(&self) -> bool {
        info!("[offline] begin update");
        true
    }

    fn create_update_snapshots(&self, _manifest: &UpdateManifest) -> SnapshotReturn {
        warn!("[offline] snapshots are not available on this host");
        SnapshotReturn::Error("no snapshot engine".to_string())
    }

    fn cancel_update(&self) -> bool {
        info!("[offline] cancel update");
        true
    }

    fn ensure_metadata_mounted(&self) -> bool {
        false
    }

    fn release_metadata(&self) {}
}

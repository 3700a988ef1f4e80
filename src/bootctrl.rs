/// Slot numbering and suffixes of an A/B device
use std::fmt;
use std::fs;
use log::debug;
use serde::{Deserialize, Serialize};
use crate::constants::{BOOTCONFIG_PATH, CMDLINE_PATH, MAX_NUM_SLOTS, SLOT_SUFFIX_PROPERTY};
use crate::error::PlanError;

const AB_SLOT_SUFFIXES: [&str; MAX_NUM_SLOTS as usize] = ["_a", "_b"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slot(pub u32);

impl Slot {
    pub const A: Slot = Slot(0);
    pub const B: Slot = Slot(1);

    /// Slot `number`, failing for slots the device does not have
    pub fn new(number: u32) -> Result<Slot, PlanError> {
        let slot = Slot(number);
        if !slot.is_valid() {
            return Err(PlanError::InvalidSlot(number));
        }
        Ok(slot)
    }

    pub fn is_valid(&self) -> bool {
        self.0 < MAX_NUM_SLOTS
    }

    pub fn suffix(&self) -> &'static str {
        AB_SLOT_SUFFIXES.get(self.0 as usize).copied().unwrap_or("")
    }

    pub fn other(&self) -> Slot {
        Slot((self.0 + 1) % MAX_NUM_SLOTS)
    }

    /// `_a` / `a` -> slot 0
    pub fn from_suffix(suffix: &str) -> Option<Slot> {
        let letter = suffix.trim().trim_start_matches('_');
        AB_SLOT_SUFFIXES
            .iter()
            .position(|s| s.trim_start_matches('_') == letter)
            .map(|i| Slot(i as u32))
    }

    /// `name` with this slot's suffix appended
    pub fn suffixed(&self, name: &str) -> String {
        format!("{}{}", name, self.suffix())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match AB_SLOT_SUFFIXES.get(self.0 as usize) {
            Some(suffix) => write!(f, "{}", suffix.trim_start_matches('_').to_uppercase()),
            None => write!(f, "INVALID({})", self.0),
        }
    }
}

/// The running slot and the slot being updated, both valid and never equal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPair {
    pub source: Slot,
    pub target: Slot,
}

impl SlotPair {
    pub fn new(source: Slot, target: Slot) -> Result<Self, PlanError> {
        Slot::new(source.0)?;
        Slot::new(target.0)?;
        if source == target {
            return Err(PlanError::SameSlotRequested(source));
        }
        Ok(SlotPair { source, target })
    }
}

/// Find `androidboot.slot_suffix` in a bootconfig or kernel command line blob
pub fn parse_slot_suffix(content: &str) -> Option<Slot> {
    let value_of = |value: &str| Slot::from_suffix(value.trim().trim_matches('"'));
    for line in content.lines() {
        // bootconfig: one `key = "value"` per line
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == SLOT_SUFFIX_PROPERTY {
                return value_of(value);
            }
        }
        // cmdline: space separated key=value tokens
        for token in line.split_whitespace() {
            if let Some((key, value)) = token.split_once('=') {
                if key == SLOT_SUFFIX_PROPERTY {
                    return value_of(value);
                }
            }
        }
    }
    None
}

/// Get the current active android slot from bootconfig, falling back to the kernel command line
pub fn get_current_android_slot() -> Option<Slot> {
    for path in [BOOTCONFIG_PATH, CMDLINE_PATH] {
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        if let Some(slot) = parse_slot_suffix(&content) {
            debug!("current slot {} from {}", slot, path);
            return Some(slot);
        }
    }
    None
}

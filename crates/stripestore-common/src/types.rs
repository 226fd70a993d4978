//! Core type definitions for StripeStore
//!
//! Disks, containers and block addresses are small integers handed around
//! by the striping layer, so they are plain aliases rather than wrappers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a physical disk, dense from zero
pub type DiskId = u32;

/// Identifier of a fixed-size container
pub type ContainerId = u32;

/// Logical block address within a disk
pub type Lba = u64;

/// Class of a physical disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskRole {
    /// Holds container data
    #[default]
    Data,
    /// Holds log containers
    Log,
}

impl From<bool> for DiskRole {
    fn from(is_log: bool) -> Self {
        if is_log { Self::Log } else { Self::Data }
    }
}

/// Placement of one container of a stripe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripeLocation {
    /// Container placed
    pub container: ContainerId,
    /// Disk holding the container
    pub disk: DiskId,
    /// Base LBA of the container on that disk
    pub lba: Lba,
}

impl StripeLocation {
    #[must_use]
    pub const fn new(container: ContainerId, disk: DiskId, lba: Lba) -> Self {
        Self { container, disk, lba }
    }
}

impl fmt::Display for StripeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container {} @ disk {} lba {}", self.container, self.disk, self.lba)
    }
}

//! Container addressing
//!
//! Maps a container to a disk and a base LBA. Two modes exist and exactly
//! one is active for the lifetime of an engine:
//!
//! ```text
//! Direct mapping (n = 4, 8 blocks per container)
//!
//!   container:  0  1  2  3 | 4  5  6  7 | 8 ...
//!   disk:       0  1  2  3 | 0  1  2  3 | 0
//!   lba:        0  0  0  0 | 8  8  8  8 | 16
//!
//! Free list
//!
//!   disk bitmap  [####....##......]
//!                       ^ write_front: first fit at or after the cursor
//! ```
//!
//! Direct mapping never searches and cannot fail for fragmentation. The
//! free list searches the disk bitmap and reports exhaustion.

use crate::bitmap::Extent;
use crate::registry::DiskState;
use stripestore_common::{AddressingMode, ContainerId, DiskId, Lba, StripeLocation};

/// Disk holding `container` when striping over `n` disks
///
/// `None` in, `None` out: an invalid container has no disk.
#[must_use]
pub fn disk_of(container: Option<ContainerId>, n: u32) -> Option<DiskId> {
    container.map(|id| id % n)
}

/// Base LBA of `container` when striping over `n` disks
#[must_use]
pub fn lba_of(container: Option<ContainerId>, n: u32, blocks_per_container: u64) -> Option<Lba> {
    container.map(|id| u64::from(id / n) * blocks_per_container)
}

/// Full direct-mapped placement of a container
#[must_use]
pub fn stripe_location(
    container: ContainerId,
    n: u32,
    blocks_per_container: u64,
) -> StripeLocation {
    StripeLocation::new(
        container,
        container % n,
        u64::from(container / n) * blocks_per_container,
    )
}

/// What the engine asks of an allocator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocRequest {
    pub disk: DiskId,
    pub container: ContainerId,
    pub num_blocks: u64,
}

/// Picks and marks LBAs on a disk
///
/// Called with the disk's lock held; implementations mark the returned
/// extent in the bitmap before returning it.
pub trait LbaAllocator: Send + Sync {
    /// Reserve space for a new write, or `None` if the disk has no room
    fn allocate(&self, req: &AllocRequest, state: &mut DiskState) -> Option<Extent>;

    /// Where an already written container lives, if derivable
    fn locate(&self, disk: DiskId, container: ContainerId) -> Option<Lba>;
}

/// Placement as a pure function of the container id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectMapping {
    num_disks: u32,
    blocks_per_container: u64,
}

impl DirectMapping {
    /// # Panics
    /// Panics if `num_disks` is zero.
    #[must_use]
    pub fn new(num_disks: u32, blocks_per_container: u64) -> Self {
        assert!(num_disks > 0, "direct mapping needs at least one disk");
        Self {
            num_disks,
            blocks_per_container,
        }
    }

    fn container_lba(&self, disk: DiskId, container: ContainerId) -> Lba {
        assert_eq!(
            disk,
            container % self.num_disks,
            "container {container} does not map to disk {disk}"
        );
        u64::from(container / self.num_disks) * self.blocks_per_container
    }
}

impl LbaAllocator for DirectMapping {
    fn allocate(&self, req: &AllocRequest, state: &mut DiskState) -> Option<Extent> {
        assert!(
            req.num_blocks <= self.blocks_per_container,
            "write of {} blocks exceeds the {} block span of container {}",
            req.num_blocks,
            self.blocks_per_container,
            req.container
        );
        let lba = self.container_lba(req.disk, req.container);
        // The whole container span is claimed even for payload-only writes
        let extent = Extent::new(lba, self.blocks_per_container);
        assert!(
            state.bitmap.set_range(extent.start, extent.length),
            "container {} written twice on disk {}",
            req.container,
            req.disk
        );
        Some(extent)
    }

    fn locate(&self, disk: DiskId, container: ContainerId) -> Option<Lba> {
        Some(self.container_lba(disk, container))
    }
}

/// First-fit search from a per-disk cursor that only moves forward
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeList;

impl LbaAllocator for FreeList {
    fn allocate(&self, req: &AllocRequest, state: &mut DiskState) -> Option<Extent> {
        let lba = state
            .bitmap
            .first_zeros_and_flip(state.write_front, req.num_blocks)?;
        state.write_front = lba + req.num_blocks;
        Some(Extent::new(lba, req.num_blocks))
    }

    fn locate(&self, _disk: DiskId, _container: ContainerId) -> Option<Lba> {
        None
    }
}

/// The addressing mode chosen at startup
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addressing {
    Direct(DirectMapping),
    FreeList(FreeList),
}

impl Addressing {
    /// Build the allocator for a mode over `num_disks` disks
    #[must_use]
    pub fn new(mode: AddressingMode, num_disks: u32, blocks_per_container: u64) -> Self {
        match mode {
            AddressingMode::Direct => {
                Self::Direct(DirectMapping::new(num_disks, blocks_per_container))
            }
            AddressingMode::FreeList => Self::FreeList(FreeList),
        }
    }

    /// The mode this addressing implements
    #[must_use]
    pub const fn mode(&self) -> AddressingMode {
        match self {
            Self::Direct(_) => AddressingMode::Direct,
            Self::FreeList(_) => AddressingMode::FreeList,
        }
    }

    /// Allocator behind the mode
    #[must_use]
    pub fn allocator(&self) -> &dyn LbaAllocator {
        match self {
            Self::Direct(direct) => direct,
            Self::FreeList(free_list) => free_list,
        }
    }
}

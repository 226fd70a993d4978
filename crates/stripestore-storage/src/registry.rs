//! Disk registry
//!
//! Holds every physical disk the engine writes to: its static description,
//! its raw handle, and its allocation state behind a per-disk lock. Disks
//! are registered once at construction and live as long as the registry.
//!
//! Disk ids are dense small integers, so the registry is an arena indexed
//! by id. Info, bitmap and lock share one slot and cannot drift apart.

use crate::bitmap::RangeBitmap;
use crate::raw_io::RawFile;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use stripestore_common::{DiskId, DiskRole, Lba, Result, StorageConfig};
use tracing::{debug, info, warn};

/// Construction-time description of a disk
#[derive(Debug)]
pub struct DiskDescriptor {
    /// Dense disk index
    pub id: DiskId,
    /// Capacity in blocks
    pub num_blocks: u64,
    /// Log or data disk
    pub role: DiskRole,
    /// Handle to the device or disk file, owned by the registry from here on
    pub file: RawFile,
}

impl DiskDescriptor {
    #[must_use]
    pub const fn new(id: DiskId, num_blocks: u64, role: DiskRole, file: RawFile) -> Self {
        Self {
            id,
            num_blocks,
            role,
            file,
        }
    }
}

/// Static information about a registered disk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskInfo {
    pub id: DiskId,
    pub num_blocks: u64,
    pub role: DiskRole,
}

/// Mutable allocation state of a disk, only reachable through its lock
#[derive(Debug)]
pub struct DiskState {
    /// Allocated LBAs
    pub bitmap: RangeBitmap,
    /// Free bytes; decremented by allocations, never given back
    pub remaining: u64,
    /// Free-list cursor, only moves forward
    pub write_front: Lba,
}

/// Point-in-time view of a disk's space accounting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskUsage {
    pub remaining: u64,
    pub allocated_blocks: u64,
    pub write_front: Lba,
}

/// Disk statistics
#[derive(Debug, Default)]
pub struct DiskStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
}

impl DiskStats {
    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }
}

struct DiskSlot {
    info: DiskInfo,
    file: RawFile,
    state: Mutex<DiskState>,
    up: AtomicBool,
    stats: DiskStats,
}

/// Registry of all disks known to the engine
pub struct DiskRegistry {
    slots: Vec<DiskSlot>,
}

impl DiskRegistry {
    /// Register a fixed set of disks
    ///
    /// # Panics
    /// Panics if a disk id is registered twice or the ids are not exactly
    /// `0..n`; both mean the caller's disk list is inconsistent.
    #[must_use]
    pub fn new(descriptors: Vec<DiskDescriptor>, config: &StorageConfig) -> Self {
        let count = descriptors.len();
        let mut slots: Vec<Option<DiskSlot>> = Vec::with_capacity(count);
        slots.resize_with(count, || None);

        for desc in descriptors {
            let index = desc.id as usize;
            assert!(
                index < count,
                "disk id {} is outside the dense range 0..{count}",
                desc.id
            );
            assert!(slots[index].is_none(), "disk {} registered twice", desc.id);

            let capacity = desc.num_blocks * config.block_size;
            if desc.file.size() < capacity {
                warn!(
                    "disk {} ({}) is {} bytes, smaller than its {} block capacity",
                    desc.id,
                    desc.file.path(),
                    desc.file.size(),
                    desc.num_blocks
                );
            }

            if desc.file.is_read_only() {
                warn!(
                    "disk {} ({}) is open read-only; every write to it will fail",
                    desc.id,
                    desc.file.path()
                );
            }
            debug!(
                "disk {} ({}): {} blocks, {:?}, direct I/O {}",
                desc.id,
                desc.file.path(),
                desc.num_blocks,
                desc.role,
                desc.file.is_direct()
            );

            slots[index] = Some(DiskSlot {
                info: DiskInfo {
                    id: desc.id,
                    num_blocks: desc.num_blocks,
                    role: desc.role,
                },
                file: desc.file,
                state: Mutex::new(DiskState {
                    bitmap: RangeBitmap::new(desc.num_blocks),
                    remaining: capacity,
                    write_front: 0,
                }),
                up: AtomicBool::new(true),
                stats: DiskStats::default(),
            });
        }

        let slots: Vec<DiskSlot> = slots.into_iter().flatten().collect();
        info!("Registered {} disks", slots.len());

        Self { slots }
    }

    fn slot(&self, disk: DiskId) -> &DiskSlot {
        self.slots
            .get(disk as usize)
            .unwrap_or_else(|| panic!("disk {disk} is not registered"))
    }

    /// Number of registered disks
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no disks are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Static information about a disk
    #[must_use]
    pub fn info(&self, disk: DiskId) -> &DiskInfo {
        &self.slot(disk).info
    }

    /// Static information about every disk, in id order
    pub fn iter(&self) -> impl Iterator<Item = &DiskInfo> {
        self.slots.iter().map(|slot| &slot.info)
    }

    /// Take the disk's lock for exclusive access to its allocation state
    pub fn lock(&self, disk: DiskId) -> MutexGuard<'_, DiskState> {
        self.slot(disk).state.lock()
    }

    /// Raw handle of a disk
    #[must_use]
    pub fn file(&self, disk: DiskId) -> &RawFile {
        &self.slot(disk).file
    }

    /// I/O counters of a disk
    #[must_use]
    pub fn stats(&self, disk: DiskId) -> &DiskStats {
        &self.slot(disk).stats
    }

    /// Snapshot of a disk's space accounting, taken under its lock
    #[must_use]
    pub fn usage(&self, disk: DiskId) -> DiskUsage {
        let state = self.lock(disk);
        DiskUsage {
            remaining: state.remaining,
            allocated_blocks: state.bitmap.count_set(),
            write_front: state.write_front,
        }
    }

    /// Whether a disk is marked up
    #[must_use]
    pub fn is_up(&self, disk: DiskId) -> bool {
        self.slot(disk).up.load(Ordering::Acquire)
    }

    /// Exclude a disk from selection for new stripes
    pub fn mark_down(&self, disk: DiskId) {
        warn!("Disk {disk} marked down");
        self.slot(disk).up.store(false, Ordering::Release);
    }

    /// Make a disk selectable again
    pub fn mark_up(&self, disk: DiskId) {
        info!("Disk {disk} marked up");
        self.slot(disk).up.store(true, Ordering::Release);
    }

    /// Flush every disk handle
    pub fn sync_all(&self) -> Result<()> {
        for slot in &self.slots {
            slot.file.sync_data()?;
        }
        Ok(())
    }
}

//! Block I/O engine
//!
//! Reads and writes containers on registered disks. Every operation holds
//! the target disk's lock for its whole duration, which makes the lock the
//! only serialization point per disk; operations on different disks run in
//! parallel.
//!
//! Writes that need a new location allocate it in the disk bitmap *before*
//! issuing the I/O. The allocation is wrapped in a guard that clears the
//! bits again unless the write succeeds and commits it, so a failed write
//! never leaves a visible allocation behind and `remaining` only moves for
//! writes that reached the disk.

use crate::addressing::{Addressing, AllocRequest};
use crate::bitmap::{Extent, RangeBitmap};
use crate::pool::fan_out;
use crate::raw_io::AlignedBuffer;
use crate::registry::DiskRegistry;
use crate::selector::select_disks;
use crate::trace::{IoDirection, TraceRecord, TraceSink};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use stripestore_common::{
    AddressingMode, ContainerId, DiskId, DiskRole, Error, Lba, Result, StorageConfig,
    StripeLocation,
};
use tracing::{debug, error, warn};

/// A request to the generic block writer
#[derive(Clone, Copy, Debug)]
pub struct BlockWrite<'a> {
    /// Target disk; `None` makes the write a no-op
    pub disk: Option<DiskId>,
    /// Container being written; consulted for allocation and logging only
    pub container: ContainerId,
    /// Blocks covered by the write
    pub num_blocks: u64,
    /// Bytes taken from `buf`
    pub len: u64,
    pub buf: &'a [u8],
    /// Explicit location, or `None` to allocate one
    pub start: Option<Lba>,
}

/// One full-container write of a stripe
#[derive(Clone, Copy, Debug)]
pub struct ContainerWrite<'a> {
    pub disk: DiskId,
    pub container: ContainerId,
    pub buf: &'a [u8],
}

/// One full-container read of a stripe
#[derive(Debug)]
pub struct ContainerRead<'a> {
    pub disk: DiskId,
    pub lba: Lba,
    pub buf: &'a mut [u8],
}

/// Bitmap range marked ahead of a write; cleared on drop unless committed
struct PendingAllocation<'a> {
    bitmap: &'a mut RangeBitmap,
    extent: Extent,
    committed: bool,
}

impl<'a> PendingAllocation<'a> {
    const fn new(bitmap: &'a mut RangeBitmap, extent: Extent) -> Self {
        Self {
            bitmap,
            extent,
            committed: false,
        }
    }

    fn commit(mut self) -> Extent {
        self.committed = true;
        self.extent
    }
}

impl Drop for PendingAllocation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.bitmap.clear_range(self.extent.start, self.extent.length);
        }
    }
}

/// Container-level I/O over a set of registered disks
pub struct BlockEngine {
    registry: Arc<DiskRegistry>,
    config: Arc<StorageConfig>,
    addressing: Addressing,
    trace: Option<Arc<dyn TraceSink>>,
    started: Instant,
}

impl BlockEngine {
    /// Create an engine over `registry` using the configured addressing mode
    ///
    /// Direct mapping stripes over every registered disk.
    #[must_use]
    pub fn new(registry: Arc<DiskRegistry>, config: Arc<StorageConfig>) -> Self {
        let num_disks = u32::try_from(registry.len()).unwrap_or(u32::MAX);
        if num_disks != config.num_disks {
            warn!(
                "Configured for {} disks but {} are registered; striping over the registered set",
                config.num_disks, num_disks
            );
        }
        let addressing = Addressing::new(
            config.addressing,
            num_disks.max(1),
            config.blocks_per_container,
        );

        Self {
            registry,
            config,
            addressing,
            trace: None,
            started: Instant::now(),
        }
    }

    /// Report every completed I/O to `sink`
    #[must_use]
    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DiskRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[must_use]
    pub const fn addressing_mode(&self) -> AddressingMode {
        self.addressing.mode()
    }

    /// Where direct mapping puts `container`; `None` under the free list
    #[must_use]
    pub fn locate(&self, container: ContainerId) -> Option<StripeLocation> {
        match self.addressing {
            Addressing::Direct(_) => {
                let n = u32::try_from(self.registry.len()).unwrap_or(u32::MAX);
                Some(crate::addressing::stripe_location(
                    container,
                    n,
                    self.config.blocks_per_container,
                ))
            }
            Addressing::FreeList(_) => None,
        }
    }

    /// Write a whole container, reserved trailer included, at a new location
    pub fn write_container(
        &self,
        disk: DiskId,
        container: ContainerId,
        buf: &[u8],
    ) -> Result<Option<Lba>> {
        self.write_blocks(&BlockWrite {
            disk: Some(disk),
            container,
            num_blocks: self.config.blocks_per_container,
            len: self.config.container_size(),
            buf,
            start: None,
        })
    }

    /// Write a container's payload, leaving its trailer untouched
    pub fn write_container_data(
        &self,
        disk: DiskId,
        container: ContainerId,
        buf: &[u8],
    ) -> Result<Option<Lba>> {
        self.write_blocks(&BlockWrite {
            disk: Some(disk),
            container,
            num_blocks: self.config.blocks_per_container,
            len: self.config.container_data_size(),
            buf,
            start: None,
        })
    }

    /// Overwrite the reserved trailer of an already placed container
    pub fn write_container_reserved(
        &self,
        disk: DiskId,
        container_lba: Lba,
        buf: &[u8],
    ) -> Result<Option<Lba>> {
        let reserved = self.config.reserved_blocks_per_container;
        self.write_blocks(&BlockWrite {
            disk: Some(disk),
            container: 0,
            num_blocks: reserved,
            len: self.config.container_reserved_size(),
            buf,
            start: Some(container_lba + (self.config.blocks_per_container - reserved)),
        })
    }

    /// Generic block writer behind every container write
    ///
    /// Returns `Ok(None)` without touching any state for a missing disk, zero
    /// blocks or zero length. Otherwise returns the LBA written.
    ///
    /// # Errors
    /// `OutOfSpace` when allocation finds no room; the device error when the
    /// write fails. Any allocation made by this call is undone first.
    ///
    /// # Panics
    /// Panics on a misaligned length, a buffer shorter than `len`, a range
    /// past the end of the disk, or, under direct mapping, a disk/container
    /// mismatch or an allocation larger than one container.
    pub fn write_blocks(&self, req: &BlockWrite<'_>) -> Result<Option<Lba>> {
        let Some(disk) = req.disk else {
            return Ok(None);
        };
        if req.num_blocks == 0 || req.len == 0 {
            return Ok(None);
        }
        self.assert_aligned("write length", req.len);
        assert!(
            req.len <= req.num_blocks * self.config.block_size,
            "write of {} bytes does not fit in {} blocks",
            req.len,
            req.num_blocks
        );
        let buf = Self::prefix(req.buf, req.len);

        let mut state = self.registry.lock(disk);

        let Some(lba) = req.start else {
            let alloc = AllocRequest {
                disk,
                container: req.container,
                num_blocks: req.num_blocks,
            };
            let Some(extent) = self.addressing.allocator().allocate(&alloc, &mut state) else {
                warn!(
                    "Disk {} is out of space for container {}",
                    disk, req.container
                );
                return Err(Error::OutOfSpace {
                    disk,
                    blocks: req.num_blocks,
                });
            };

            let pending = PendingAllocation::new(&mut state.bitmap, extent);
            self.issue_write(disk, req.container, extent.start, buf)?;
            let extent = pending.commit();
            state.remaining -= extent.length * self.config.block_size;
            return Ok(Some(extent.start));
        };

        self.assert_fits(disk, lba, req.num_blocks);
        self.issue_write(disk, req.container, lba, buf)?;
        drop(state);
        Ok(Some(lba))
    }

    /// Write a sub-range of an already placed container
    ///
    /// With `is_new_write` the range is allocated and accounted as fresh
    /// space (undone if the write fails); otherwise it is an overwrite of
    /// space already accounted for.
    ///
    /// # Panics
    /// Panics if `start + num_blocks` reaches the end of the disk, or if a
    /// new write overlaps allocated blocks.
    pub fn write_partial_container(
        &self,
        disk: DiskId,
        container: ContainerId,
        start: Lba,
        num_blocks: u64,
        buf: &[u8],
        is_new_write: bool,
    ) -> Result<Lba> {
        let disk_blocks = self.registry.info(disk).num_blocks;
        assert!(
            start + num_blocks < disk_blocks,
            "partial write {start}+{num_blocks} overflows disk {disk} of {disk_blocks} blocks"
        );
        let buf = Self::prefix(buf, num_blocks * self.config.block_size);

        let mut state = self.registry.lock(disk);

        if !is_new_write {
            self.issue_write(disk, container, start, buf)?;
            return Ok(start);
        }

        assert!(
            state.bitmap.set_range(start, num_blocks),
            "partial write {start}+{num_blocks} on disk {disk} overlaps allocated blocks"
        );
        let pending = PendingAllocation::new(&mut state.bitmap, Extent::new(start, num_blocks));
        self.issue_write(disk, container, start, buf)?;
        let extent = pending.commit();
        state.remaining -= extent.length * self.config.block_size;
        Ok(start)
    }

    /// Read a whole container starting at `container_lba`
    pub fn read_container(&self, disk: DiskId, container_lba: Lba, buf: &mut [u8]) -> Result<()> {
        self.read_partial_container(
            disk,
            container_lba,
            (0, self.config.container_size()),
            buf,
        )
    }

    /// Read `len` bytes at `offset` into the container at `container_lba`
    ///
    /// Reads never allocate and never touch the bitmap.
    ///
    /// # Panics
    /// Panics if `offset` or `len` is not block aligned or `buf` is shorter
    /// than `len`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_partial_container(
        &self,
        disk: DiskId,
        container_lba: Lba,
        (offset, len): (u64, u64),
        buf: &mut [u8],
    ) -> Result<()> {
        self.assert_aligned("read offset", offset);
        self.assert_aligned("read length", len);
        assert!(
            buf.len() as u64 >= len,
            "buffer of {} bytes is shorter than read of {len}",
            buf.len()
        );

        let _state = self.registry.lock(disk);

        let disk_offset = container_lba * self.config.block_size + offset;
        let file = self.registry.file(disk);
        let stats = self.registry.stats(disk);

        if let Err(e) = file.read_at(disk_offset, &mut buf[..len as usize]) {
            stats.record_read_error();
            error!(
                "Error on read from disk {} ({}) at {} length {}: {}",
                disk,
                file.path(),
                disk_offset,
                len,
                e
            );
            return Err(e);
        }
        stats.record_read(len);
        debug!("Read from disk {} at {} length {}", disk, disk_offset, len);
        self.trace(disk, disk_offset, len, IoDirection::Read);

        Ok(())
    }

    /// Overwrite a container with zeros
    ///
    /// The container's blocks stay allocated; zeroing stands in for a trim
    /// that would hand the space back.
    ///
    /// # Panics
    /// Panics under free-list addressing, where a container has no derivable
    /// location.
    #[allow(clippy::cast_possible_truncation)]
    pub fn discard_container(&self, disk: DiskId, container: ContainerId) -> Result<()> {
        let lba = self
            .addressing
            .allocator()
            .locate(disk, container)
            .unwrap_or_else(|| {
                panic!("container {container} has no derivable location to discard")
            });

        let zeros = AlignedBuffer::new(self.config.container_size() as usize);
        self.write_blocks(&BlockWrite {
            disk: Some(disk),
            container,
            num_blocks: self.config.blocks_per_container,
            len: self.config.container_size(),
            buf: &zeros,
            start: Some(lba),
        })?;
        Ok(())
    }

    /// Write the containers of a stripe in parallel
    ///
    /// Results are in the order of `writes`.
    pub fn write_stripe(&self, writes: &[ContainerWrite<'_>]) -> Vec<Result<Option<Lba>>> {
        fan_out(self.config.num_threads, writes.iter().collect(), |w| {
            self.write_container(w.disk, w.container, w.buf)
        })
    }

    /// Read the containers of a stripe in parallel
    ///
    /// Results are in the order of `reads`.
    pub fn read_stripe(&self, reads: &mut [ContainerRead<'_>]) -> Vec<Result<()>> {
        fan_out(self.config.num_threads, reads.iter_mut().collect(), |r| {
            self.read_container(r.disk, r.lba, r.buf)
        })
    }

    /// Pick up to `n` disks of `role` for a new stripe, skipping `filter`
    #[must_use]
    pub fn select_disks(&self, n: usize, role: DiskRole, filter: &HashSet<DiskId>) -> Vec<DiskId> {
        select_disks(&self.registry, n, role, filter)
    }

    /// Write `buf` at `lba` on `disk`; the caller holds the disk lock
    fn issue_write(&self, disk: DiskId, container: ContainerId, lba: Lba, buf: &[u8]) -> Result<()> {
        let disk_offset = lba * self.config.block_size;
        let len = buf.len() as u64;
        let file = self.registry.file(disk);
        let stats = self.registry.stats(disk);

        debug!(
            "write container {} to LBA {} (disk {}, off {})",
            container, lba, disk, disk_offset
        );
        if let Err(e) = file.write_at(disk_offset, buf) {
            stats.record_write_error();
            error!(
                "Error on write to disk {} ({}) at {} length {}: {}",
                disk,
                file.path(),
                disk_offset,
                len,
                e
            );
            return Err(e);
        }
        stats.record_write(len);
        self.trace(disk, disk_offset, len, IoDirection::Write);
        Ok(())
    }

    fn trace(&self, disk: DiskId, offset: u64, len: u64, direction: IoDirection) {
        if let Some(sink) = &self.trace {
            let unit = self.config.trace_block_size;
            sink.record(&TraceRecord {
                timestamp_us: u64::try_from(self.started.elapsed().as_micros())
                    .unwrap_or(u64::MAX),
                disk,
                offset: offset / unit,
                length: len / unit,
                direction,
            });
        }
    }

    fn assert_aligned(&self, what: &str, value: u64) {
        assert!(
            value % self.config.block_size == 0,
            "{what} {value} is not a multiple of block size {}",
            self.config.block_size
        );
    }

    fn assert_fits(&self, disk: DiskId, lba: Lba, num_blocks: u64) {
        let disk_blocks = self.registry.info(disk).num_blocks;
        assert!(
            lba + num_blocks <= disk_blocks,
            "write {lba}+{num_blocks} overflows disk {disk} of {disk_blocks} blocks"
        );
    }

    #[allow(clippy::cast_possible_truncation)]
    fn prefix(buf: &[u8], len: u64) -> &[u8] {
        assert!(
            buf.len() as u64 >= len,
            "buffer of {} bytes is shorter than write of {len}",
            buf.len()
        );
        &buf[..len as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_io::RawFile;
    use crate::registry::DiskDescriptor;
    use crate::registry::tests::{test_config, test_disks};
    use crate::trace::MemoryTraceSink;
    use rand::RngCore;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use tempfile::TempDir;

    fn engine_with(
        dir: &TempDir,
        config: StorageConfig,
        num_blocks: u64,
        num_disks: usize,
    ) -> BlockEngine {
        let disks = test_disks(dir, &config, num_blocks, &vec![DiskRole::Data; num_disks]);
        let registry = Arc::new(DiskRegistry::new(disks, &config));
        BlockEngine::new(registry, Arc::new(config))
    }

    /// Engine whose disks all refuse writes
    fn failing_engine(dir: &TempDir, config: StorageConfig, num_blocks: u64) -> BlockEngine {
        let disks = (0..config.num_disks)
            .map(|i| {
                let path = dir.path().join(format!("ro{i}.img"));
                RawFile::create(&path, num_blocks * config.block_size, false).unwrap();
                let file = RawFile::open(&path, true, false).unwrap();
                DiskDescriptor::new(i, num_blocks, DiskRole::Data, file)
            })
            .collect();
        let registry = Arc::new(DiskRegistry::new(disks, &config));
        BlockEngine::new(registry, Arc::new(config))
    }

    fn random_container(config: &StorageConfig) -> AlignedBuffer {
        let mut buf = AlignedBuffer::new(config.container_size() as usize);
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    #[test]
    fn test_container_lands_at_direct_location() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(4), 1000, 4);
        let data = random_container(engine.config());

        let loc = engine.locate(13).unwrap();
        assert_eq!((loc.disk, loc.lba), (1, 24));

        let lba = engine.write_container(1, 13, &data).unwrap();
        assert_eq!(lba, Some(24));

        let mut read = AlignedBuffer::new(data.len());
        engine.read_container(1, 24, &mut read).unwrap();
        assert_eq!(&read[..], &data[..]);

        let usage = engine.registry().usage(1);
        assert_eq!(usage.allocated_blocks, 8);
        assert_eq!(usage.remaining, (1000 - 8) * 4096);
        assert_eq!(engine.registry().usage(0).allocated_blocks, 0);
    }

    #[test]
    fn test_free_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            addressing: AddressingMode::FreeList,
            ..test_config(2)
        };
        let engine = engine_with(&dir, config, 100, 2);
        assert!(engine.locate(3).is_none());

        let first = random_container(engine.config());
        let second = random_container(engine.config());
        assert_eq!(engine.write_container(0, 7, &first).unwrap(), Some(0));
        assert_eq!(engine.write_container(0, 3, &second).unwrap(), Some(8));
        assert_eq!(engine.registry().usage(0).write_front, 16);

        let mut read = AlignedBuffer::new(first.len());
        engine.read_container(0, 0, &mut read).unwrap();
        assert_eq!(&read[..], &first[..]);
        engine.read_container(0, 8, &mut read).unwrap();
        assert_eq!(&read[..], &second[..]);
    }

    #[test]
    fn test_data_then_reserved_write() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(2), 100, 2);
        let config = engine.config().clone();

        let payload = vec![0xAAu8; config.container_data_size() as usize];
        let lba = engine.write_container_data(0, 2, &payload).unwrap().unwrap();
        assert_eq!(lba, 8);
        // Payload-only writes still claim the whole container span
        assert_eq!(engine.registry().usage(0).allocated_blocks, 8);

        let trailer = vec![0x55u8; config.container_reserved_size() as usize];
        let written = engine.write_container_reserved(0, lba, &trailer).unwrap();
        assert_eq!(written, Some(lba + 6));
        assert_eq!(engine.registry().usage(0).allocated_blocks, 8);
        assert_eq!(engine.registry().usage(0).remaining, (100 - 8) * 4096);

        let mut read = vec![0u8; config.container_size() as usize];
        engine.read_container(0, lba, &mut read).unwrap();
        let split = config.container_data_size() as usize;
        assert!(read[..split].iter().all(|&b| b == 0xAA));
        assert!(read[split..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_degenerate_writes_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(1), 100, 1);
        let buf = vec![1u8; 4096];

        let no_disk = BlockWrite {
            disk: None,
            container: 0,
            num_blocks: 1,
            len: 4096,
            buf: &buf,
            start: None,
        };
        assert_eq!(engine.write_blocks(&no_disk).unwrap(), None);
        assert_eq!(
            engine
                .write_blocks(&BlockWrite {
                    disk: Some(0),
                    num_blocks: 0,
                    ..no_disk
                })
                .unwrap(),
            None
        );
        assert_eq!(
            engine
                .write_blocks(&BlockWrite {
                    disk: Some(0),
                    len: 0,
                    ..no_disk
                })
                .unwrap(),
            None
        );

        let usage = engine.registry().usage(0);
        assert_eq!(usage.allocated_blocks, 0);
        assert_eq!(usage.remaining, 100 * 4096);
        assert_eq!(
            engine.registry().stats(0).writes.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_failed_write_rolls_back_direct() {
        let dir = tempfile::tempdir().unwrap();
        let engine = failing_engine(&dir, test_config(2), 100);
        let data = random_container(engine.config());

        let before = engine.registry().lock(1).bitmap.clone();
        let err = engine.write_container(1, 5, &data).unwrap_err();
        assert!(err.is_io());

        assert_eq!(engine.registry().lock(1).bitmap, before);
        assert_eq!(engine.registry().usage(1).remaining, 100 * 4096);
        assert_eq!(
            engine
                .registry()
                .stats(1)
                .write_errors
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_failed_write_rolls_back_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            addressing: AddressingMode::FreeList,
            ..test_config(1)
        };
        let engine = failing_engine(&dir, config, 100);
        let data = random_container(engine.config());

        let before = engine.registry().lock(0).bitmap.clone();
        assert!(engine.write_container(0, 0, &data).is_err());
        assert_eq!(engine.registry().lock(0).bitmap, before);
        assert_eq!(engine.registry().usage(0).remaining, 100 * 4096);
    }

    #[test]
    fn test_failed_partial_new_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let engine = failing_engine(&dir, test_config(1), 100);
        let buf = vec![7u8; 2 * 4096];

        assert!(engine.write_partial_container(0, 0, 10, 2, &buf, true).is_err());
        let usage = engine.registry().usage(0);
        assert_eq!(usage.allocated_blocks, 0);
        assert_eq!(usage.remaining, 100 * 4096);
    }

    #[test]
    fn test_free_list_out_of_space() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            addressing: AddressingMode::FreeList,
            ..test_config(1)
        };
        let engine = engine_with(&dir, config, 20, 1);
        let data = random_container(engine.config());

        assert!(engine.write_container(0, 0, &data).unwrap().is_some());
        assert!(engine.write_container(0, 1, &data).unwrap().is_some());
        let before = engine.registry().usage(0);

        let err = engine.write_container(0, 2, &data).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(engine.registry().usage(0), before);
    }

    #[test]
    fn test_partial_writes_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(1), 100, 1);
        let first = vec![0x11u8; 3 * 4096];
        let second = vec![0x22u8; 4096];

        assert_eq!(engine.write_partial_container(0, 0, 40, 3, &first, true).unwrap(), 40);
        let usage = engine.registry().usage(0);
        assert_eq!(usage.allocated_blocks, 3);
        assert_eq!(usage.remaining, 97 * 4096);

        // Overwrite inside the range: no new accounting
        assert_eq!(engine.write_partial_container(0, 0, 41, 1, &second, false).unwrap(), 41);
        assert_eq!(engine.registry().usage(0), usage);

        let mut read = vec![0u8; 2 * 4096];
        engine.read_partial_container(0, 40, (4096, 8192), &mut read).unwrap();
        assert!(read[..4096].iter().all(|&b| b == 0x22));
        assert!(read[4096..].iter().all(|&b| b == 0x11));
    }

    #[test]
    #[should_panic(expected = "overflows disk")]
    fn test_partial_write_overflow_panics() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(1), 100, 1);
        let buf = vec![0u8; 4 * 4096];
        let _ = engine.write_partial_container(0, 0, 96, 4, &buf, false);
    }

    #[test]
    #[should_panic(expected = "overlaps allocated blocks")]
    fn test_partial_new_write_over_allocation_panics() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(1), 100, 1);
        let data = random_container(engine.config());
        engine.write_container(0, 0, &data).unwrap();
        let _ = engine.write_partial_container(0, 0, 4, 1, &data, true);
    }

    #[test]
    fn test_misaligned_partial_io_panics() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(2), 100, 2);
        let mut buf = vec![0u8; 4 * 4096];

        for disk in 0..2 {
            for (offset, len) in [(1, 4096), (4095, 4096), (0, 100), (2048, 2048), (4096, 4097)] {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    engine.read_partial_container(disk, 0, (offset, len), &mut buf)
                }));
                assert!(result.is_err(), "({offset}, {len}) accepted on disk {disk}");
            }

            let result = catch_unwind(AssertUnwindSafe(|| {
                engine.write_blocks(&BlockWrite {
                    disk: Some(disk),
                    container: 0,
                    num_blocks: 1,
                    len: 1000,
                    buf: &buf,
                    start: Some(0),
                })
            }));
            assert!(result.is_err());
        }
    }

    #[test]
    fn test_discard_zeroes_but_keeps_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(2), 100, 2);
        let data = random_container(engine.config());

        let lba = engine.write_container(1, 3, &data).unwrap().unwrap();
        let usage = engine.registry().usage(1);

        engine.discard_container(1, 3).unwrap();
        let mut read = AlignedBuffer::new(data.len());
        engine.read_container(1, lba, &mut read).unwrap();
        assert!(read.iter().all(|&b| b == 0));
        assert_eq!(engine.registry().usage(1), usage);
    }

    #[test]
    fn test_oversized_direct_write_leaves_neighbour_intact() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(2), 100, 2);
        let neighbour = random_container(engine.config());
        let oversized = vec![0xEEu8; 16 * 4096];

        let result = catch_unwind(AssertUnwindSafe(|| {
            engine.write_blocks(&BlockWrite {
                disk: Some(0),
                container: 0,
                num_blocks: 16,
                len: 16 * 4096,
                buf: &oversized,
                start: None,
            })
        }));
        assert!(result.is_err());
        assert_eq!(engine.registry().usage(0).allocated_blocks, 0);

        // Container 2 shares disk 0 and starts where container 0 ends
        assert_eq!(engine.write_container(0, 2, &neighbour).unwrap(), Some(8));
        let mut read = AlignedBuffer::new(neighbour.len());
        engine.read_container(0, 8, &mut read).unwrap();
        assert_eq!(&read[..], &neighbour[..]);
        assert_eq!(engine.registry().usage(0).allocated_blocks, 8);
    }

    #[test]
    #[should_panic(expected = "no derivable location")]
    fn test_discard_under_free_list_panics() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            addressing: AddressingMode::FreeList,
            ..test_config(1)
        };
        let engine = engine_with(&dir, config, 100, 1);
        let _ = engine.discard_container(0, 0);
    }

    #[test]
    fn test_concurrent_allocations_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            addressing: AddressingMode::FreeList,
            ..test_config(1)
        };
        let engine = engine_with(&dir, config, 1000, 1);
        let data = random_container(engine.config());

        let extents: Vec<Extent> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8u32)
                .map(|t| {
                    let engine = &engine;
                    let data = &data;
                    scope.spawn(move || {
                        (0..10u32)
                            .map(|i| {
                                let lba = engine.write_container(0, t * 10 + i, data).unwrap();
                                Extent::new(lba.unwrap(), 8)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(extents.len(), 80);
        for (i, a) in extents.iter().enumerate() {
            for b in &extents[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
        let usage = engine.registry().usage(0);
        assert_eq!(usage.allocated_blocks, 640);
        assert_eq!(usage.remaining, (1000 - 640) * 4096);
    }

    #[test]
    fn test_concurrent_direct_writes_on_one_disk() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(4), 1000, 4);
        let data = random_container(engine.config());

        // Containers 1, 5, 9, ... all map to disk 1
        let lbas: Vec<Lba> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8u32)
                .map(|t| {
                    let engine = &engine;
                    let data = &data;
                    scope.spawn(move || {
                        (0..10u32)
                            .map(|i| {
                                let container = (t * 10 + i) * 4 + 1;
                                engine.write_container(1, container, data).unwrap().unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let mut sorted = lbas.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..80).map(|k| k * 8).collect::<Vec<Lba>>());

        let usage = engine.registry().usage(1);
        assert_eq!(usage.allocated_blocks, 80 * 8);
        assert_eq!(usage.remaining, (1000 - 80 * 8) * 4096);
        for other in [0, 2, 3] {
            assert_eq!(engine.registry().usage(other).allocated_blocks, 0);
        }
    }

    #[test]
    fn test_stripe_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(4), 100, 4);
        let payloads: Vec<AlignedBuffer> =
            (0..8).map(|_| random_container(engine.config())).collect();

        let writes: Vec<ContainerWrite<'_>> = payloads
            .iter()
            .enumerate()
            .map(|(i, buf)| ContainerWrite {
                disk: i as DiskId % 4,
                container: i as ContainerId,
                buf,
            })
            .collect();
        let lbas: Vec<Lba> = engine
            .write_stripe(&writes)
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert_eq!(lbas, vec![0, 0, 0, 0, 8, 8, 8, 8]);

        let mut bufs: Vec<Vec<u8>> = (0..8)
            .map(|_| vec![0u8; engine.config().container_size() as usize])
            .collect();
        let mut reads: Vec<ContainerRead<'_>> = bufs
            .iter_mut()
            .enumerate()
            .map(|(i, buf)| ContainerRead {
                disk: i as DiskId % 4,
                lba: lbas[i],
                buf,
            })
            .collect();
        assert!(engine.read_stripe(&mut reads).iter().all(Result::is_ok));
        drop(reads);

        for (read, written) in bufs.iter().zip(&payloads) {
            assert_eq!(&read[..], &written[..]);
        }
    }

    #[test]
    fn test_trace_records_io() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemoryTraceSink::new());
        let engine = engine_with(&dir, test_config(4), 1000, 4).with_trace(sink.clone());
        let data = random_container(engine.config());

        engine.write_container(1, 13, &data).unwrap();
        let mut read = AlignedBuffer::new(data.len());
        engine.read_partial_container(1, 24, (4096, 8192), &mut read).unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].disk, 1);
        assert_eq!((records[0].offset, records[0].length), (24, 8));
        assert_eq!(records[0].direction, IoDirection::Write);
        assert_eq!((records[1].offset, records[1].length), (25, 2));
        assert_eq!(records[1].direction, IoDirection::Read);
        assert!(records[0].timestamp_us <= records[1].timestamp_us);
    }

    #[test]
    fn test_stats_count_io() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, test_config(1), 100, 1);
        let data = random_container(engine.config());
        engine.write_container(0, 0, &data).unwrap();
        let mut read = AlignedBuffer::new(data.len());
        engine.read_container(0, 0, &mut read).unwrap();

        let stats = engine.registry().stats(0);
        let load = |c: &std::sync::atomic::AtomicU64| c.load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(load(&stats.writes), 1);
        assert_eq!(load(&stats.reads), 1);
        assert_eq!(load(&stats.bytes_written), 32768);
        assert_eq!(load(&stats.bytes_read), 32768);
    }
}

//! Range bitmap for tracking allocated LBAs on one disk
//!
//! Uses one bit per block: 0 = free, 1 = used. The bitmap has no lock of
//! its own; it lives inside the per-disk state and is only touched while
//! that disk's lock is held.

/// A contiguous range of blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// Starting block number
    pub start: u64,
    /// Number of blocks in the extent
    pub length: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Get the ending block number (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Check if two extents overlap
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// One bit per block of a disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeBitmap {
    /// Bitmap data
    data: Vec<u8>,
    /// Total number of blocks
    total_blocks: u64,
    /// Number of set bits (cached)
    set_blocks: u64,
}

impl RangeBitmap {
    /// Create a bitmap for the given number of blocks (all free)
    #[must_use]
    pub fn new(total_blocks: u64) -> Self {
        let bytes_needed = usize::try_from(total_blocks.div_ceil(8))
            .expect("bitmap size exceeds address space");
        Self {
            data: vec![0u8; bytes_needed],
            total_blocks,
            set_blocks: 0,
        }
    }

    /// Get the total number of blocks
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.total_blocks
    }

    /// Check if the bitmap covers no blocks
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_blocks == 0
    }

    /// Get the number of allocated blocks
    #[must_use]
    pub const fn count_set(&self) -> u64 {
        self.set_blocks
    }

    /// Check if a block is allocated; out of range blocks count as allocated
    #[must_use]
    pub fn is_set(&self, block: u64) -> bool {
        block >= self.total_blocks || self.bit(block)
    }

    /// Check that every block of the range is free
    ///
    /// # Panics
    /// Panics if the range extends past the end of the disk.
    #[must_use]
    pub fn is_range_clear(&self, start: u64, len: u64) -> bool {
        self.assert_in_range(start, len);
        (start..start + len).all(|block| !self.bit(block))
    }

    /// Mark a range as allocated
    ///
    /// Returns `false` without changing anything if any block in the range
    /// is already allocated.
    ///
    /// # Panics
    /// Panics if the range extends past the end of the disk.
    pub fn set_range(&mut self, start: u64, len: u64) -> bool {
        if !self.is_range_clear(start, len) {
            return false;
        }
        self.flip_on(start, len);
        true
    }

    /// Mark a range as free; already free blocks are left as they are
    ///
    /// # Panics
    /// Panics if the range extends past the end of the disk.
    pub fn clear_range(&mut self, start: u64, len: u64) {
        self.assert_in_range(start, len);
        for block in start..start + len {
            if self.bit(block) {
                let (byte, mask) = Self::locate(block);
                self.data[byte] &= !mask;
                self.set_blocks -= 1;
            }
        }
    }

    /// Find the first run of `len` free blocks at or after `from` and
    /// allocate it
    ///
    /// Returns the first block of the run, or `None` if no run fits before
    /// the end of the disk.
    pub fn first_zeros_and_flip(&mut self, from: u64, len: u64) -> Option<u64> {
        if len == 0 || from >= self.total_blocks {
            return None;
        }

        let mut run_start = from;
        let mut run_len = 0u64;

        for block in from..self.total_blocks {
            if self.bit(block) {
                run_start = block + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == len {
                    self.flip_on(run_start, len);
                    return Some(run_start);
                }
            }
        }

        None
    }

    fn flip_on(&mut self, start: u64, len: u64) {
        for block in start..start + len {
            let (byte, mask) = Self::locate(block);
            self.data[byte] |= mask;
        }
        self.set_blocks += len;
    }

    fn bit(&self, block: u64) -> bool {
        let (byte, mask) = Self::locate(block);
        self.data[byte] & mask != 0
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn locate(block: u64) -> (usize, u8) {
        ((block / 8) as usize, 1 << (block % 8))
    }

    fn assert_in_range(&self, start: u64, len: u64) {
        assert!(
            start.checked_add(len).is_some_and(|end| end <= self.total_blocks),
            "block range {start}+{len} exceeds disk of {} blocks",
            self.total_blocks
        );
    }
}

//! StripeStore Storage - Container I/O on raw disks
//!
//! This crate implements the block layer of StripeStore:
//! - Raw disk access (O_DIRECT / F_NOCACHE)
//! - Per-disk allocation bitmaps and space accounting
//! - Direct-mapped and free-list container addressing
//! - Container, partial-container and stripe reads and writes
//! - Disk selection for new stripes
//! - Optional I/O tracing

pub mod addressing;
pub mod bitmap;
pub mod engine;
mod pool;
pub mod raw_io;
pub mod registry;
pub mod selector;
pub mod trace;

// Re-exports
pub use addressing::{Addressing, AllocRequest, DirectMapping, FreeList, LbaAllocator};
pub use bitmap::{Extent, RangeBitmap};
pub use engine::{BlockEngine, BlockWrite, ContainerRead, ContainerWrite};
pub use raw_io::{ALIGNMENT, AlignedBuffer, RawFile, SECTOR_SIZE};
pub use registry::{DiskDescriptor, DiskInfo, DiskRegistry, DiskState, DiskStats, DiskUsage};
pub use selector::select_disks;
pub use trace::{FileTraceSink, IoDirection, MemoryTraceSink, TraceRecord, TraceSink};

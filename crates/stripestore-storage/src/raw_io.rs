//! Platform-specific raw disk I/O
//!
//! Provides positioned access to disk files and block devices, optionally
//! bypassing the OS page cache:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! All transfers use explicit offsets (`pread`/`pwrite`), so a single
//! handle can serve concurrent readers and writers.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::ptr::NonNull;
use stripestore_common::{Error, Result};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Buffer alignment that satisfies direct I/O on every supported device
pub const ALIGNMENT: usize = 4096;

/// Offset/length granularity required by direct I/O (logical sector size)
pub const SECTOR_SIZE: u64 = 512;

/// Raw file handle with optional direct I/O
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
    direct_io: bool,
}

impl RawFile {
    /// Open an existing file or block device
    pub fn open(path: impl AsRef<Path>, read_only: bool, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }
        Self::apply_direct_flag(&mut options, direct_io);

        let file = options
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open {path_str}: {e}")))?;
        Self::apply_nocache(&file, &path_str, direct_io)?;

        let size = if Self::is_block_device(&path) {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.metadata()
                .map_err(|e| {
                    Error::storage(format!("failed to get metadata for {path_str}: {e}"))
                })?
                .len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
            direct_io,
        })
    }

    /// Create a disk file of the given size
    ///
    /// Regular files are created (or truncated) and sized. Block devices are
    /// opened as-is and report their real capacity; `size` is ignored.
    pub fn create(path: impl AsRef<Path>, size: u64, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block_device = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(true);
        }
        Self::apply_direct_flag(&mut options, direct_io);

        let file = options
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to create {path_str}: {e}")))?;
        Self::apply_nocache(&file, &path_str, direct_io)?;

        let actual_size = if is_block_device {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.set_len(size)
                .map_err(|e| Error::storage(format!("failed to set size for {path_str}: {e}")))?;
            size
        };

        Ok(Self {
            file,
            path: path_str,
            size: actual_size,
            read_only: false,
            direct_io,
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_direct_flag(options: &mut OpenOptions, direct_io: bool) {
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_direct_flag(_options: &mut OpenOptions, _direct_io: bool) {}

    #[cfg(target_os = "macos")]
    fn apply_nocache(file: &File, path: &str, direct_io: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        if !direct_io {
            return Ok(());
        }
        // SAFETY: the descriptor is owned by `file` and open for the call.
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if ret == -1 {
            return Err(Error::storage(format!(
                "failed to set F_NOCACHE on {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    #[allow(clippy::unnecessary_wraps)]
    const fn apply_nocache(_file: &File, _path: &str, _direct_io: bool) -> Result<()> {
        Ok(())
    }

    /// Check if path is a block device; missing paths are not
    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&path).is_ok_and(|m| m.file_type().is_block_device())
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64 ioctl
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &raw mut size) };
        if ret == -1 {
            return Err(Error::storage(format!(
                "failed to get block device size for {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};

        let mut f = file;
        let size = f
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::storage(format!("failed to get device size for {path}: {e}")))?;
        Ok(size)
    }

    /// Get the file size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Get the file path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether writes are refused
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the page cache is bypassed
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        self.direct_io
    }

    /// Fill `buf` from the given offset
    ///
    /// With direct I/O, offset and length must be sector aligned.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file.read_exact_at(buf, offset).map_err(|e| {
            Error::storage(format!(
                "read of {} bytes at {offset} failed on {}: {e}",
                buf.len(),
                self.path
            ))
        })
    }

    /// Write all of `buf` at the given offset
    ///
    /// With direct I/O, offset and length must be sector aligned.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(self.path.clone()));
        }
        self.check_alignment(offset, buf.len())?;
        self.file.write_all_at(buf, offset).map_err(|e| {
            Error::storage(format!(
                "write of {} bytes at {offset} failed on {}: {e}",
                buf.len(),
                self.path
            ))
        })
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::storage(format!("sync_data failed on {}: {e}", self.path)))
    }

    fn check_alignment(&self, offset: u64, size: usize) -> Result<()> {
        if !self.direct_io {
            return Ok(());
        }
        if offset % SECTOR_SIZE != 0 {
            return Err(Error::storage(format!(
                "offset {offset} is not aligned to {SECTOR_SIZE}"
            )));
        }
        if size as u64 % SECTOR_SIZE != 0 {
            return Err(Error::storage(format!(
                "size {size} is not aligned to {SECTOR_SIZE}"
            )));
        }
        Ok(())
    }
}

/// Zeroed heap buffer aligned for direct I/O
///
/// Callers allocate their container buffers through this type so the
/// memory satisfies O_DIRECT alignment. The length is rounded up to a
/// multiple of the alignment.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Create a zeroed buffer of at least `size` bytes
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, ALIGNMENT)
    }

    /// Create a zeroed buffer with a custom power-of-two alignment
    ///
    /// # Panics
    /// Panics if `alignment` is not a power of two or allocation fails.
    #[must_use]
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        let aligned_size = size.max(1).div_ceil(alignment) * alignment;
        let layout = Layout::from_size_align(aligned_size, alignment)
            .expect("alignment must be a power of two");

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    /// Buffer length in bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; buffers hold at least one alignment unit
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Alignment of the start address
    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid and uniquely borrowed through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in with_alignment with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len())
            .field("alignment", &self.alignment())
            .finish()
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

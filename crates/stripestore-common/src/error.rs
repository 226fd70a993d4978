//! Error types for StripeStore
//!
//! Only recoverable faults live here. Broken caller invariants (misaligned
//! offsets, duplicate disks, overflowing ranges) panic instead.

use crate::types::DiskId;
use thiserror::Error;

/// Common result type for StripeStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for StripeStore
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("disk {disk} has no free run of {blocks} blocks")]
    OutOfSpace { disk: DiskId, blocks: u64 },

    #[error("file is read-only: {0}")]
    ReadOnly(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Setup errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the disk ran out of allocatable space
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. })
    }

    /// Check if this is a fault reported by the device or its handle
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::DiskIo(_) | Self::Storage(_) | Self::ReadOnly(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let full = Error::OutOfSpace { disk: 2, blocks: 8 };
        assert!(full.is_capacity());
        assert!(!full.is_io());

        let io = Error::from(std::io::Error::other("boom"));
        assert!(io.is_io());
        assert!(!io.is_capacity());

        assert!(Error::ReadOnly("/dev/null".into()).is_io());
        assert!(!Error::configuration("bad").is_io());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::OutOfSpace { disk: 3, blocks: 16 };
        assert_eq!(err.to_string(), "disk 3 has no free run of 16 blocks");
        assert_eq!(
            Error::configuration("no disks").to_string(),
            "configuration error: no disks"
        );
    }
}

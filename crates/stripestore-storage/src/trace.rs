//! Optional I/O trace output
//!
//! Each completed disk I/O can be reported to a sink as one record. The
//! file format is one line per record:
//!
//! ```text
//! <timestamp_us> <disk> <offset> <length> <direction>
//! ```
//!
//! with offset and length in device blocks and direction 0 for writes,
//! 1 for reads. Tracing is observational only; the engine behaves the same
//! with or without a sink.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use stripestore_common::{DiskId, Error, Result};
use tracing::warn;

/// Direction of a traced I/O
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoDirection {
    Write = 0,
    Read = 1,
}

/// One completed I/O
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceRecord {
    /// Microseconds since the engine started
    pub timestamp_us: u64,
    pub disk: DiskId,
    /// Offset in device blocks
    pub offset: u64,
    /// Length in device blocks
    pub length: u64,
    pub direction: IoDirection,
}

/// Receiver of trace records
pub trait TraceSink: Send + Sync {
    fn record(&self, record: &TraceRecord);
}

/// Appends trace records to a text file
pub struct FileTraceSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileTraceSink {
    /// Create (or truncate) the trace file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(&path).map_err(|e| {
            Error::storage(format!(
                "failed to create trace file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Flush buffered records to the file
    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

impl TraceSink for FileTraceSink {
    fn record(&self, record: &TraceRecord) {
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(
            writer,
            "{} {} {} {} {}",
            record.timestamp_us,
            record.disk,
            record.offset,
            record.length,
            record.direction as u8
        ) {
            warn!("Failed to write trace record: {}", e);
        }
    }
}

impl Drop for FileTraceSink {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}

/// Keeps trace records in memory
#[derive(Default)]
pub struct MemoryTraceSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemoryTraceSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    #[must_use]
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().clone()
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, record: &TraceRecord) {
        self.records.lock().push(*record);
    }
}

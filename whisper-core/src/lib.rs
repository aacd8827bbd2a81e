//! Whisper Core - Round-Robin Time-Series Storage
//!
//! A Rust implementation of the Whisper file format used by Graphite:
//! - Fixed-size files, one per metric, allocated up front
//! - Several archives of decreasing precision and increasing retention
//! - Writes consolidate automatically into the coarser archives
//!
//! # Architecture
//!
//! - **format / archive**: header, descriptor table and retention parsing
//! - **storage**: the in-memory file image, ring addressing, propagation and
//!   dirty page tracking, plus the [`Whisper`] file handle
//! - **io**: positioned vectored transfers and staging buffers
//! - **transport**: records for shipping fetched series between processes
//!
//! ```no_run
//! use whisper_core::{AggregationMethod, Timestamp, Value, Whisper, WhisperConfig, ARCHIVE_ID_ALL};
//!
//! # fn main() -> whisper_core::Result<()> {
//! let archives = "1m:2h,1h:2d,1d:30d".parse()?;
//! let config = WhisperConfig::default();
//! let mut db = Whisper::create("cpu.wsp", archives, AggregationMethod::Average, 0.5, &config)?;
//!
//! let now = Timestamp::from_system_time(std::time::SystemTime::now());
//! db.update_point_for_archive(ARCHIVE_ID_ALL, now, Value(42.0), now)?;
//! db.sync()?;
//! db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod codec;
pub mod format;
pub mod io;
pub mod storage;
pub mod transport;

mod error;
mod types;

pub use archive::{parse_archive_list, ArchiveInfo, ArchiveList, ARCHIVE_ID_ALL};
pub use codec::Codec;
pub use error::{Result, WhisperError};
pub use format::{AggregationMethod, Header, Meta};
pub use storage::{FileData, Whisper, WhisperConfig};
pub use transport::{FileDump, TimeSeries};
pub use types::*;

/// Whisper Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Dirty tracking and transfer granularity (4KB)
    pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

    /// Size of the buffers used to stage the first page on open (4KB)
    pub const STAGING_BUFFER_SIZE: usize = 4 * 1024;

    /// Returned staging buffers kept for reuse
    pub const MAX_IDLE_BUFFERS: usize = 64;

    /// Most buffers passed to one vectored system call
    pub const MAX_IOVECS: usize = 1024;
}

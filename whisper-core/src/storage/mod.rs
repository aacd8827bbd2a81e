//! Storage engine - file image, dirty tracking and the file handle

mod dirty;
mod file_data;
mod whisper;

pub use dirty::{BitSet, DirtyPages};
pub use file_data::FileData;
pub use whisper::Whisper;

use crate::io::BufferPool;
use crate::{Result, WhisperError};
use std::sync::Arc;

/// Options for creating and opening Whisper files
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Take an exclusive advisory lock while the file is open
    pub flock: bool,
    /// Open without write access; sync fails if anything changed
    pub read_only: bool,
    /// Keep the image in memory only; no file is touched
    pub in_memory: bool,
    /// Fail creation if the path already exists
    pub exclusive: bool,
    /// Granularity of dirty tracking and vectored transfers
    pub page_size: usize,
    /// Staging pool used when opening; the process-wide pool if unset
    pub buffer_pool: Option<Arc<BufferPool>>,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            flock: true,
            read_only: false,
            in_memory: false,
            exclusive: false,
            page_size: crate::config::DEFAULT_PAGE_SIZE,
            buffer_pool: None,
        }
    }
}

impl WhisperConfig {
    /// Configuration for a memory-only handle
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            flock: false,
            ..Self::default()
        }
    }

    /// Configuration for inspecting a file without modifying it
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            flock: false,
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    /// Reject combinations that cannot work
    pub fn validate(&self) -> Result<()> {
        dirty::check_page_size(self.page_size)?;
        if self.read_only && self.exclusive {
            return Err(WhisperError::Config(
                "exclusive creation needs write access".into(),
            ));
        }
        Ok(())
    }
}

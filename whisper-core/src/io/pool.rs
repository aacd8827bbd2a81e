//! Reusable fixed-size staging buffers

use crate::config::{MAX_IDLE_BUFFERS, STAGING_BUFFER_SIZE};
use crate::{Result, WhisperError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Pool of zeroed byte buffers, all exactly `buffer_size` long
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes
    pub fn new(buffer_size: usize) -> Self {
        Self::with_max_idle(buffer_size, MAX_IDLE_BUFFERS)
    }

    /// Create a pool that keeps at most `max_idle` returned buffers
    pub fn with_max_idle(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size,
            max_idle,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers waiting for reuse
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Take a zeroed buffer of `buffer_size` bytes
    pub fn get(&self) -> Vec<u8> {
        match self.free.lock().pop() {
            Some(buf) => buf,
            None => vec![0u8; self.buffer_size],
        }
    }

    /// Return a buffer for reuse.
    ///
    /// Buffers whose capacity differs from the pool size are rejected.
    pub fn put(&self, mut buf: Vec<u8>) -> Result<()> {
        if buf.capacity() != self.buffer_size {
            return Err(WhisperError::BufferCapacity {
                expected: self.buffer_size,
                actual: buf.capacity(),
            });
        }

        buf.clear();
        buf.resize(self.buffer_size, 0);

        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
        Ok(())
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_idle", &self.max_idle)
            .field("idle", &self.idle())
            .finish()
    }
}

/// Process-wide pool of `STAGING_BUFFER_SIZE` buffers
pub fn default_pool() -> Arc<BufferPool> {
    static POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();
    POOL.get_or_init(|| Arc::new(BufferPool::new(STAGING_BUFFER_SIZE)))
        .clone()
}

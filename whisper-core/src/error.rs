//! Error types for the Whisper engine

use crate::format::AggregationMethod;
use crate::Timestamp;
use thiserror::Error;

/// Result type alias for Whisper operations
pub type Result<T> = std::result::Result<T, WhisperError>;

/// Whisper error types
#[derive(Error, Debug)]
pub enum WhisperError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Input ended before a complete record could be decoded
    #[error("need {needed} more bytes")]
    Truncated { needed: usize },

    /// Stored layout disagrees with the layout computed from the header
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Duration text could not be parsed
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// Archive list violates one of the layout invariants
    #[error("Invalid archive list: {0}")]
    InvalidArchive(String),

    /// Unknown aggregation method code or name
    #[error("Invalid aggregation method: {0}")]
    InvalidAggregationMethod(String),

    /// xFilesFactor outside [0, 1]
    #[error("Invalid xFilesFactor: {0} (must be between 0 and 1)")]
    InvalidXFilesFactor(f32),

    /// Archive id is neither the sentinel nor a valid index
    #[error("Archive id {id} out of range (archive count {count})")]
    ArchiveIdOutOfRange { id: i32, count: usize },

    /// Write timestamp falls outside the retention window
    #[error("Timestamp {timestamp} not covered by any archive (now {now})")]
    TimestampNotCovered { timestamp: Timestamp, now: Timestamp },

    /// Fetch range with from after until
    #[error("Invalid time range: from {from} is after until {until}")]
    InvalidTimeRange { from: Timestamp, until: Timestamp },

    /// Aggregation method reserved for future use cannot consolidate
    #[error("Aggregation method {0} cannot be used for consolidation")]
    UnsupportedAggregation(AggregationMethod),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Buffer returned to a pool with the wrong capacity
    #[error("Buffer capacity mismatch: expected {expected}, got {actual}")]
    BufferCapacity { expected: usize, actual: usize },
}

impl WhisperError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, WhisperError::Io(_) | WhisperError::Truncated { .. })
    }

    /// Check if error means the input was merely short
    pub fn is_truncated(&self) -> bool {
        matches!(self, WhisperError::Truncated { .. })
    }

    /// Number of additional bytes a truncated decode needs
    pub fn needed_bytes(&self) -> Option<usize> {
        match self {
            WhisperError::Truncated { needed } => Some(*needed),
            _ => None,
        }
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, WhisperError::Corruption(_))
    }
}

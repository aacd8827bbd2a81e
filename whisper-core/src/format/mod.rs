//! On-disk layout of a Whisper file
//!
//! ```text
//! Header (16 bytes)
//!   aggregationMethod u32
//!   maxRetention      u32
//!   xFilesFactor      f32
//!   archiveCount      u32
//! ArchiveDescriptor (12 bytes, archiveCount times)
//!   offset            u32
//!   secondsPerPoint   u32
//!   numberOfPoints    u32
//! Point (12 bytes, numberOfPoints times per archive)
//!   timestamp         u32
//!   value             f64
//! ```
//!
//! All fields are big-endian.

mod aggregation;

pub use aggregation::{accumulator_for, aggregate, Accumulator, AggregationMethod};

use crate::archive::{ArchiveInfo, ArchiveList};
use crate::codec::{ensure_len, Codec};
use crate::{Duration, Result, WhisperError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the metadata header
pub const HEADER_SIZE: usize = 16;

/// Size of one archive descriptor
pub const ARCHIVE_INFO_SIZE: usize = 12;

/// Size of one stored point
pub const POINT_SIZE: usize = 12;

/// File-wide metadata stored in the first 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// How finer points consolidate into coarser archives
    pub aggregation_method: AggregationMethod,
    /// Retention of the coarsest archive
    pub max_retention: Duration,
    /// Minimum known fraction needed to consolidate
    pub x_files_factor: f32,
    /// Number of archive descriptors that follow
    pub archive_count: u32,
}

impl Meta {
    /// Build the metadata matching an archive list
    pub fn new(
        aggregation_method: AggregationMethod,
        x_files_factor: f32,
        archives: &ArchiveList,
    ) -> Result<Self> {
        validate_x_files_factor(x_files_factor)?;
        Ok(Self {
            aggregation_method,
            max_retention: archives.max_retention(),
            x_files_factor,
            archive_count: archives.len() as u32,
        })
    }
}

/// Reject values outside [0, 1], NaN included
pub fn validate_x_files_factor(x_files_factor: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&x_files_factor) {
        return Err(WhisperError::InvalidXFilesFactor(x_files_factor));
    }
    Ok(())
}

impl Codec for Meta {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.aggregation_method as u32);
        dst.put_u32(self.max_retention.as_secs() as u32);
        dst.put_f32(self.x_files_factor);
        dst.put_u32(self.archive_count);
    }

    fn consume(mut src: &[u8]) -> Result<(&[u8], Self)> {
        ensure_len(src, HEADER_SIZE)?;
        let aggregation_method = AggregationMethod::try_from(src.get_u32())?;
        let max_retention = Duration::from_secs(src.get_u32() as i32);
        let x_files_factor = src.get_f32();
        let archive_count = src.get_u32();

        validate_x_files_factor(x_files_factor)?;
        if archive_count == 0 {
            return Err(WhisperError::InvalidArchive(
                "header declares zero archives".into(),
            ));
        }

        Ok((
            src,
            Self {
                aggregation_method,
                max_retention,
                x_files_factor,
                archive_count,
            },
        ))
    }
}

/// Metadata plus the archive descriptor table
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub meta: Meta,
    pub archives: ArchiveList,
}

impl Header {
    /// Build a consistent header for a new file
    pub fn new(
        archives: ArchiveList,
        aggregation_method: AggregationMethod,
        x_files_factor: f32,
    ) -> Result<Self> {
        let meta = Meta::new(aggregation_method, x_files_factor, &archives)?;
        Ok(Self { meta, archives })
    }

    /// Encoded size of the header and descriptor table
    pub fn size(&self) -> usize {
        self.archives.header_size()
    }
}

impl Codec for Header {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        self.meta.append_to(dst);
        for archive in &self.archives {
            archive.append_to(dst);
        }
    }

    fn consume(src: &[u8]) -> Result<(&[u8], Self)> {
        let (mut src, meta) = Meta::consume(src)?;
        ensure_len(src, meta.archive_count as usize * ARCHIVE_INFO_SIZE)?;

        let mut infos = Vec::with_capacity(meta.archive_count as usize);
        for _ in 0..meta.archive_count {
            let (rest, info) = ArchiveInfo::consume(src)?;
            infos.push(info);
            src = rest;
        }
        let archives = ArchiveList::from_decoded(infos)?;

        if meta.max_retention != archives.max_retention() {
            return Err(WhisperError::Corruption(format!(
                "header max retention {} disagrees with coarsest archive retention {}",
                meta.max_retention,
                archives.max_retention()
            )));
        }

        Ok((src, Self { meta, archives }))
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "aggregationMethod:{}\tmaxRetention:{}\txFilesFactor:{}\tarchiveCount:{}",
            self.meta.aggregation_method,
            self.meta.max_retention.as_secs(),
            self.meta.x_files_factor,
            self.meta.archive_count
        )?;
        for (i, archive) in self.archives.iter().enumerate() {
            write!(
                f,
                "\narchiveInfo:{}\toffset:{}\tsecondsPerPoint:{}\tnumberOfPoints:{}\tretention:{}",
                i,
                archive.offset(),
                archive.seconds_per_point().as_secs(),
                archive.number_of_points(),
                archive.max_retention()
            )?;
        }
        Ok(())
    }
}

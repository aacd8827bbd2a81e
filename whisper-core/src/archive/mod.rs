//! Archive (resolution tier) model
//!
//! An archive is a fixed-capacity ring of points at one step. A file holds an
//! ordered list of archives, finest first, whose point arrays follow the
//! header and descriptor table back to back.

mod parser;

pub use parser::parse_archive_list;

use crate::codec::{ensure_len, Codec};
use crate::format::{ARCHIVE_INFO_SIZE, HEADER_SIZE, POINT_SIZE};
use crate::types::{floor_div, floor_mod};
use crate::{Duration, Result, Timestamp, WhisperError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sentinel archive id: span every archive, or let the engine pick one
pub const ARCHIVE_ID_ALL: i32 = -1;

/// One resolution tier of a Whisper file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveInfo {
    offset: u32,
    seconds_per_point: Duration,
    number_of_points: u32,
}

impl ArchiveInfo {
    /// Create an archive descriptor; the offset is assigned by [`ArchiveList::new`]
    pub fn new(seconds_per_point: Duration, number_of_points: u32) -> Self {
        Self {
            offset: 0,
            seconds_per_point,
            number_of_points,
        }
    }

    /// Byte offset of the point array within the file
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Step between consecutive points
    pub fn seconds_per_point(&self) -> Duration {
        self.seconds_per_point
    }

    /// Ring capacity
    pub fn number_of_points(&self) -> u32 {
        self.number_of_points
    }

    /// Time span covered by the ring, saturating if the descriptor is invalid
    pub fn max_retention(&self) -> Duration {
        self.seconds_per_point
            .checked_mul(self.number_of_points)
            .unwrap_or(Duration::from_secs(i32::MAX))
    }

    /// Size of the point array in bytes
    pub fn size(&self) -> usize {
        self.number_of_points as usize * POINT_SIZE
    }

    /// Byte offset one past the end of the point array
    pub fn end_offset(&self) -> usize {
        self.offset as usize + self.size()
    }

    /// Byte offset of the point stored in ring slot `index`
    pub(crate) fn point_offset(&self, index: usize) -> usize {
        self.offset as usize + index * POINT_SIZE
    }

    /// Ring slot holding `interval`, given the interval stored in slot 0.
    ///
    /// Only meaningful on a validated archive (positive step and capacity).
    pub fn point_index(&self, base_interval: Timestamp, interval: Timestamp) -> usize {
        let distance = floor_div(
            interval.as_i64() - base_interval.as_i64(),
            self.seconds_per_point.as_i64(),
        );
        floor_mod(distance, self.number_of_points as i64) as usize
    }

    /// Align `t` down to this archive's step
    pub fn interval_for_write(&self, t: Timestamp) -> Timestamp {
        t.truncate(self.seconds_per_point)
    }

    /// Read alignment: the step boundary strictly after the one containing `t`
    pub fn interval(&self, t: Timestamp) -> Timestamp {
        self.interval_for_write(t) + self.seconds_per_point
    }
}

impl Codec for ArchiveInfo {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.offset);
        dst.put_u32(self.seconds_per_point.as_secs() as u32);
        dst.put_u32(self.number_of_points);
    }

    fn consume(mut src: &[u8]) -> Result<(&[u8], Self)> {
        ensure_len(src, ARCHIVE_INFO_SIZE)?;
        let offset = src.get_u32();
        let seconds_per_point = Duration::from_secs(src.get_u32() as i32);
        let number_of_points = src.get_u32();
        Ok((
            src,
            Self {
                offset,
                seconds_per_point,
                number_of_points,
            },
        ))
    }
}

impl fmt::Display for ArchiveInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds_per_point, self.max_retention())
    }
}

/// Validated, ordered list of archives, finest precision first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchiveList(Vec<ArchiveInfo>);

impl ArchiveList {
    /// Build a list from step/count descriptors, assigning contiguous offsets
    pub fn new(mut archives: Vec<ArchiveInfo>) -> Result<Self> {
        let mut offset = HEADER_SIZE + archives.len() * ARCHIVE_INFO_SIZE;
        for archive in &mut archives {
            archive.offset = u32::try_from(offset).map_err(|_| {
                WhisperError::InvalidArchive(format!("offset {} exceeds file size limit", offset))
            })?;
            offset = offset.saturating_add(archive.size());
        }
        let list = Self(archives);
        list.validate()?;
        Ok(list)
    }

    /// Adopt descriptors read from a file, offsets included
    pub fn from_decoded(archives: Vec<ArchiveInfo>) -> Result<Self> {
        let list = Self(archives);
        list.validate()?;
        Ok(list)
    }

    /// Check every layout invariant
    pub fn validate(&self) -> Result<()> {
        let archives = &self.0;
        if archives.is_empty() {
            return Err(WhisperError::InvalidArchive(
                "at least one archive is required".into(),
            ));
        }

        for (i, archive) in archives.iter().enumerate() {
            if !archive.seconds_per_point.is_positive() {
                return Err(WhisperError::InvalidArchive(format!(
                    "archive {}: seconds per point must be positive, got {}",
                    i,
                    archive.seconds_per_point.as_secs()
                )));
            }
            if archive.number_of_points == 0 {
                return Err(WhisperError::InvalidArchive(format!(
                    "archive {}: number of points must be positive",
                    i
                )));
            }
            if archive
                .seconds_per_point
                .checked_mul(archive.number_of_points)
                .is_none()
            {
                return Err(WhisperError::InvalidArchive(format!(
                    "archive {}: retention of {} points at {} overflows",
                    i, archive.number_of_points, archive.seconds_per_point
                )));
            }
        }

        for (i, pair) in archives.windows(2).enumerate() {
            let (higher, lower) = (&pair[0], &pair[1]);
            let (step, next_step) = (higher.seconds_per_point, lower.seconds_per_point);

            if step >= next_step {
                return Err(WhisperError::InvalidArchive(format!(
                    "archive {} precision {} is not finer than archive {} precision {}",
                    i,
                    step,
                    i + 1,
                    next_step
                )));
            }
            if next_step.as_secs() % step.as_secs() != 0 {
                return Err(WhisperError::InvalidArchive(format!(
                    "archive {} precision {} does not evenly divide archive {} precision {}",
                    i,
                    step,
                    i + 1,
                    next_step
                )));
            }
            if higher.max_retention() >= lower.max_retention() {
                return Err(WhisperError::InvalidArchive(format!(
                    "archive {} retention {} must be shorter than archive {} retention {}",
                    i,
                    higher.max_retention(),
                    i + 1,
                    lower.max_retention()
                )));
            }
            let points_per_consolidation = (next_step.as_secs() / step.as_secs()) as u32;
            if higher.number_of_points < points_per_consolidation {
                return Err(WhisperError::InvalidArchive(format!(
                    "archive {} has {} points, needs at least {} to consolidate into archive {}",
                    i,
                    higher.number_of_points,
                    points_per_consolidation,
                    i + 1
                )));
            }
        }

        let file_size = self.header_size() + archives.iter().map(ArchiveInfo::size).sum::<usize>();
        if file_size > u32::MAX as usize {
            return Err(WhisperError::InvalidArchive(format!(
                "file size {} exceeds the 32-bit offset range",
                file_size
            )));
        }

        self.validate_offsets()
    }

    fn validate_offsets(&self) -> Result<()> {
        let mut expected = self.header_size();
        for (i, archive) in self.0.iter().enumerate() {
            if archive.offset as usize != expected {
                return Err(WhisperError::Corruption(format!(
                    "archive {} offset {} does not match expected {}",
                    i, archive.offset, expected
                )));
            }
            expected += archive.size();
        }
        Ok(())
    }

    /// Bytes taken by the metadata header and descriptor table
    pub fn header_size(&self) -> usize {
        HEADER_SIZE + self.0.len() * ARCHIVE_INFO_SIZE
    }

    /// Total file size implied by the layout
    pub fn file_size(&self) -> usize {
        self.0.last().map(ArchiveInfo::end_offset).unwrap_or(HEADER_SIZE)
    }

    /// Retention of the coarsest archive
    pub fn max_retention(&self) -> Duration {
        self.0
            .last()
            .map(ArchiveInfo::max_retention)
            .unwrap_or(Duration::ZERO)
    }

    /// Number of archives
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a validated list
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get an archive by index
    pub fn get(&self, index: usize) -> Option<&ArchiveInfo> {
        self.0.get(index)
    }

    /// Iterate over archives, finest first
    pub fn iter(&self) -> std::slice::Iter<'_, ArchiveInfo> {
        self.0.iter()
    }

    /// Borrow the descriptors
    pub fn as_slice(&self) -> &[ArchiveInfo] {
        &self.0
    }

    /// Map a non-sentinel archive id to an index
    pub fn resolve(&self, id: i32) -> Result<usize> {
        usize::try_from(id)
            .ok()
            .filter(|&i| i < self.0.len())
            .ok_or(WhisperError::ArchiveIdOutOfRange {
                id,
                count: self.0.len(),
            })
    }

    /// Highest-precision archive whose retention covers `age` seconds
    pub fn best_for_age(&self, age: i64) -> Option<usize> {
        self.0
            .iter()
            .position(|a| a.max_retention().as_i64() >= age)
    }
}

impl<'a> IntoIterator for &'a ArchiveList {
    type Item = &'a ArchiveInfo;
    type IntoIter = std::slice::Iter<'a, ArchiveInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromStr for ArchiveList {
    type Err = WhisperError;

    fn from_str(s: &str) -> Result<Self> {
        parse_archive_list(s)
    }
}

impl TryFrom<String> for ArchiveList {
    type Error = WhisperError;

    fn try_from(s: String) -> Result<Self> {
        parse_archive_list(&s)
    }
}

impl From<ArchiveList> for String {
    fn from(list: ArchiveList) -> Self {
        list.to_string()
    }
}

impl fmt::Display for ArchiveList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, archive) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", archive)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(step: i32, points: u32) -> ArchiveInfo {
        ArchiveInfo::new(Duration::from_secs(step), points)
    }

    #[test]
    fn test_point_index_wraps_both_ways() {
        let list = ArchiveList::new(vec![archive(1, 5)]).unwrap();
        let arc = list.get(0).unwrap();
        let base = Timestamp::new(1000);
        let at = |secs: i32| base + Duration::from_secs(secs);

        assert_eq!(arc.point_index(base, base), 0);
        assert_eq!(arc.point_index(base, at(4)), 4);
        assert_eq!(arc.point_index(base, at(5)), 0);
        assert_eq!(arc.point_index(base, at(-1)), 4);
        assert_eq!(arc.point_index(base, at(-6)), 4);
    }

    #[test]
    fn test_intervals() {
        let arc = archive(60, 10);
        assert_eq!(arc.interval_for_write(Timestamp::new(119)), Timestamp::new(60));
        assert_eq!(arc.interval_for_write(Timestamp::new(120)), Timestamp::new(120));
        assert_eq!(arc.interval(Timestamp::new(119)), Timestamp::new(120));
        assert_eq!(arc.interval(Timestamp::new(120)), Timestamp::new(180));
    }

    #[test]
    fn test_offsets_are_contiguous() {
        let list = ArchiveList::new(vec![archive(60, 120), archive(3600, 48)]).unwrap();
        assert_eq!(list.header_size(), 16 + 2 * 12);
        assert_eq!(list.get(0).unwrap().offset(), 40);
        assert_eq!(list.get(1).unwrap().offset(), 40 + 120 * 12);
        assert_eq!(list.file_size(), 40 + 120 * 12 + 48 * 12);
        assert_eq!(list.max_retention(), Duration::from_secs(48 * 3600));
    }

    #[test]
    fn test_validation_rules() {
        let invalid = |archives: Vec<ArchiveInfo>| {
            matches!(
                ArchiveList::new(archives),
                Err(WhisperError::InvalidArchive(_))
            )
        };

        assert!(invalid(vec![]));
        assert!(invalid(vec![archive(0, 10)]));
        assert!(invalid(vec![archive(-5, 10)]));
        assert!(invalid(vec![archive(10, 0)]));
        // same precision
        assert!(invalid(vec![archive(60, 10), archive(60, 20)]));
        // decreasing precision
        assert!(invalid(vec![archive(120, 10), archive(60, 100)]));
        // not divisible
        assert!(invalid(vec![archive(60, 100), archive(90, 100)]));
        // retention not increasing
        assert!(invalid(vec![archive(60, 120), archive(120, 60)]));
        // not enough points to consolidate
        assert!(invalid(vec![archive(1, 5), archive(10, 100)]));
        // retention overflow
        assert!(invalid(vec![archive(i32::MAX, 2)]));

        assert!(ArchiveList::new(vec![archive(1, 10), archive(10, 100)]).is_ok());
    }

    #[test]
    fn test_decoded_offset_mismatch_is_corruption() {
        let mut info = archive(60, 10);
        info.offset = 29;
        let err = ArchiveList::from_decoded(vec![info]).unwrap_err();
        assert!(err.is_corruption());

        info.offset = 28;
        assert!(ArchiveList::from_decoded(vec![info]).is_ok());
    }

    #[test]
    fn test_resolve_and_best_archive() {
        let list = ArchiveList::new(vec![archive(60, 120), archive(3600, 48)]).unwrap();
        assert_eq!(list.resolve(1).unwrap(), 1);
        assert!(matches!(
            list.resolve(2),
            Err(WhisperError::ArchiveIdOutOfRange { id: 2, count: 2 })
        ));
        assert!(list.resolve(-2).is_err());

        assert_eq!(list.best_for_age(60), Some(0));
        assert_eq!(list.best_for_age(7200), Some(0));
        assert_eq!(list.best_for_age(7201), Some(1));
        assert_eq!(list.best_for_age(48 * 3600 + 1), None);
    }

    #[test]
    fn test_descriptor_codec() {
        let list = ArchiveList::new(vec![archive(60, 120)]).unwrap();
        let info = *list.get(0).unwrap();
        let buf = info.encode();
        assert_eq!(buf, [0, 0, 0, 28, 0, 0, 0, 60, 0, 0, 0, 120]);
        let (_, decoded) = ArchiveInfo::consume(&buf).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(ArchiveInfo::consume(&buf[..11]).unwrap_err().needed_bytes(), Some(1));
    }

    #[test]
    fn test_serde_uses_text_form() {
        let list: ArchiveList = "1m:2h,1h:2d".parse().unwrap();
        let json = serde_json::to_string(&list).unwrap();
        assert_eq!(json, "\"1m:2h,1h:2d\"");
        let back: ArchiveList = serde_json::from_str(&json).unwrap();
        assert_eq!(back, list);
        assert!(serde_json::from_str::<ArchiveList>("\"1m:1m,1m:1h\"").is_err());
    }
}

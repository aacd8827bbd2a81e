//! In-memory image of a Whisper file
//!
//! [`FileData`] owns the full byte image, reads and writes points directly in
//! it, and records which pages changed so a flush only writes those.
//!
//! Ring addressing is relative to the interval stored in slot 0 (the base).
//! A base of zero means the archive has never been written; the first write
//! lands in slot 0 and defines the base.

use super::dirty::{check_page_size, DirtyPages};
use crate::archive::{ArchiveInfo, ArchiveList, ARCHIVE_ID_ALL};
use crate::codec::Codec;
use crate::format::{aggregate, AggregationMethod, Header, Meta, HEADER_SIZE, POINT_SIZE};
use crate::io::PositionedWrite;
use crate::transport::{FileDump, TimeSeries};
use crate::{sort_points, Duration, Point, Result, Timestamp, Value, WhisperError};
use std::ops::Range;
use tracing::trace;

/// Whole-file byte image with dirty page tracking
#[derive(Debug, Clone)]
pub struct FileData {
    header: Header,
    buf: Vec<u8>,
    dirty: DirtyPages,
}

impl FileData {
    /// Build a zero-filled image for a new file
    pub fn create(
        archives: ArchiveList,
        aggregation_method: AggregationMethod,
        x_files_factor: f32,
        page_size: usize,
    ) -> Result<Self> {
        check_page_size(page_size)?;
        if !aggregation_method.is_consolidating() {
            return Err(WhisperError::UnsupportedAggregation(aggregation_method));
        }

        let header = Header::new(archives, aggregation_method, x_files_factor)?;
        let file_size = header.archives.file_size();
        let mut buf = Vec::with_capacity(file_size);
        header.append_to(&mut buf);
        buf.resize(file_size, 0);

        Ok(Self {
            header,
            dirty: DirtyPages::new(file_size, page_size),
            buf,
        })
    }

    /// Adopt an existing image, validating it against its own header
    pub fn from_bytes(buf: Vec<u8>, page_size: usize) -> Result<Self> {
        check_page_size(page_size)?;
        let (_, header) = Header::consume(&buf)?;

        let expected = header.archives.file_size();
        if buf.len() < expected {
            return Err(WhisperError::Truncated {
                needed: expected - buf.len(),
            });
        }
        if buf.len() > expected {
            return Err(WhisperError::Corruption(format!(
                "image is {} bytes but the layout ends at {}",
                buf.len(),
                expected
            )));
        }

        Ok(Self {
            header,
            dirty: DirtyPages::new(expected, page_size),
            buf,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn meta(&self) -> &Meta {
        &self.header.meta
    }

    pub fn archives(&self) -> &ArchiveList {
        &self.header.archives
    }

    pub fn aggregation_method(&self) -> AggregationMethod {
        self.header.meta.aggregation_method
    }

    pub fn x_files_factor(&self) -> f32 {
        self.header.meta.x_files_factor
    }

    pub fn max_retention(&self) -> Duration {
        self.header.meta.max_retention
    }

    /// The raw file image
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn file_size(&self) -> usize {
        self.buf.len()
    }

    pub fn page_size(&self) -> usize {
        self.dirty.page_size()
    }

    /// Whether anything changed since the last flush
    pub fn is_dirty(&self) -> bool {
        self.dirty.is_dirty()
    }

    /// Byte ranges the next flush would write
    pub fn dirty_ranges(&self) -> Vec<Range<usize>> {
        self.dirty.byte_ranges(self.buf.len())
    }

    /// Change the consolidation function for future propagation
    pub fn set_aggregation_method(&mut self, method: AggregationMethod) -> Result<()> {
        if !method.is_consolidating() {
            return Err(WhisperError::UnsupportedAggregation(method));
        }
        self.header.meta.aggregation_method = method;
        self.write_meta();
        Ok(())
    }

    /// Change the known-fraction threshold for future propagation
    pub fn set_x_files_factor(&mut self, x_files_factor: f32) -> Result<()> {
        crate::format::validate_x_files_factor(x_files_factor)?;
        self.header.meta.x_files_factor = x_files_factor;
        self.write_meta();
        Ok(())
    }

    fn write_meta(&mut self) {
        let meta = self.header.meta;
        let mut dst = &mut self.buf[..HEADER_SIZE];
        meta.append_to(&mut dst);
        self.dirty.mark(0..HEADER_SIZE);
    }

    /// Fetch points between `from` and `until` as of `now`.
    ///
    /// With [`ARCHIVE_ID_ALL`] the finest archive covering `from` is used.
    /// The window is clamped to what the archive can hold; a window entirely
    /// in the future or before the retention yields no points. Slots whose
    /// stored timestamp does not match the expected interval come back as NaN.
    pub fn fetch_from_archive(
        &self,
        archive_id: i32,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<Point>> {
        self.fetch_time_series(archive_id, from, until, now)
            .map(|series| series.points)
    }

    /// Like [`fetch_from_archive`](Self::fetch_from_archive), keeping the
    /// window and step of the archive that served the request
    pub fn fetch_time_series(
        &self,
        archive_id: i32,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<TimeSeries> {
        if from > until {
            return Err(WhisperError::InvalidTimeRange { from, until });
        }

        let (index, clamped) = if archive_id == ARCHIVE_ID_ALL {
            match clamp_window(from, until, now, self.max_retention()) {
                Some((from, until)) => {
                    let age = now.as_i64() - from.as_i64();
                    let index = self
                        .archives()
                        .best_for_age(age)
                        .unwrap_or(self.archives().len() - 1);
                    (index, Some((from, until)))
                }
                None => (0, None),
            }
        } else {
            let index = self.archives().resolve(archive_id)?;
            let retention = self.archive(index).max_retention();
            (index, clamp_window(from, until, now, retention))
        };

        let archive = self.archive(index);
        let step = archive.seconds_per_point();
        let Some((from, until)) = clamped else {
            return Ok(TimeSeries::empty(from, until, step));
        };

        let from_interval = archive.interval(from);
        let mut until_interval = archive.interval(until);
        if from_interval == until_interval {
            until_interval = until_interval + step;
        }

        let mut points = self.raw_points(&archive, from_interval, until_interval);
        clear_old_points(&mut points, from_interval, step);

        Ok(TimeSeries {
            from: from_interval,
            until: until_interval,
            step,
            points,
        })
    }

    /// Stored points for `[from_interval, until_interval)`, unvalidated.
    ///
    /// Reads one contiguous run, or two when the window wraps the ring end.
    pub fn fetch_raw_points(
        &self,
        archive_id: i32,
        from_interval: Timestamp,
        until_interval: Timestamp,
    ) -> Result<Vec<Point>> {
        let index = self.archives().resolve(archive_id)?;
        let archive = self.archive(index);
        Ok(self.raw_points(&archive, from_interval, until_interval))
    }

    /// Every stored point of one archive, or of all archives, in slot order
    pub fn get_all_raw_unsorted_points(&self, archive_id: i32) -> Result<Vec<Point>> {
        if archive_id == ARCHIVE_ID_ALL {
            let mut points = Vec::new();
            for archive in self.archives() {
                self.points_in(archive, 0..archive.number_of_points() as usize, &mut points);
            }
            return Ok(points);
        }

        let archive = self.archive(self.archives().resolve(archive_id)?);
        let mut points = Vec::with_capacity(archive.number_of_points() as usize);
        self.points_in(&archive, 0..archive.number_of_points() as usize, &mut points);
        Ok(points)
    }

    /// Header plus every archive's points over `[from, until]` as of `now`
    pub fn dump(&self, from: Timestamp, until: Timestamp, now: Timestamp) -> Result<FileDump> {
        let series = (0..self.archives().len() as i32)
            .map(|id| self.fetch_time_series(id, from, until, now))
            .collect::<Result<Vec<_>>>()?;
        Ok(FileDump {
            header: self.header.clone(),
            series,
        })
    }

    /// Write one point as of `now`, then consolidate into coarser archives.
    ///
    /// With [`ARCHIVE_ID_ALL`] the finest archive covering the point's age
    /// receives it. An explicit archive must itself cover that age.
    ///
    /// The file's max retention is an exclusive bound here: a point exactly
    /// that old is rejected, while batched updates still accept it.
    pub fn update_point_for_archive(
        &mut self,
        archive_id: i32,
        time: Timestamp,
        value: Value,
        now: Timestamp,
    ) -> Result<()> {
        let age = now.as_i64() - time.as_i64();
        let not_covered = WhisperError::TimestampNotCovered {
            timestamp: time,
            now,
        };
        if age < 0 || age >= self.max_retention().as_i64() {
            return Err(not_covered);
        }

        let index = if archive_id == ARCHIVE_ID_ALL {
            self.archives().best_for_age(age).ok_or(not_covered)?
        } else {
            let index = self.archives().resolve(archive_id)?;
            if self.archive(index).max_retention().as_i64() < age {
                return Err(not_covered);
            }
            index
        };
        self.check_consolidation(index)?;

        let archive = self.archive(index);
        let interval = archive.interval_for_write(time);
        self.write_point(&archive, Point { time: interval, value });
        self.propagate_from(index, &[interval])
    }

    /// Write a batch of points as of `now`, then consolidate.
    ///
    /// With [`ARCHIVE_ID_ALL`] points go to the finest archive covering their
    /// age; points older than the coarsest retention are dropped. With an
    /// explicit archive, points it cannot cover are dropped. Future points
    /// are always dropped. Within one interval the latest timestamp wins,
    /// and among equal timestamps the one given last.
    ///
    /// Retention is an inclusive bound for batches: a point exactly as old
    /// as the target archive's retention is kept.
    pub fn update_points_for_archive(
        &mut self,
        archive_id: i32,
        points: &[Point],
        now: Timestamp,
    ) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        if archive_id != ARCHIVE_ID_ALL {
            let index = self.archives().resolve(archive_id)?;
            let retention = self.archive(index).max_retention().as_i64();
            let mut batch: Vec<Point> = points
                .iter()
                .filter(|p| {
                    let age = now.as_i64() - p.time.as_i64();
                    (0..=retention).contains(&age)
                })
                .copied()
                .collect();
            if batch.is_empty() {
                return Ok(());
            }
            self.check_consolidation(index)?;
            sort_points(&mut batch);
            return self.archive_update_many(index, &batch);
        }

        self.check_consolidation(0)?;
        let mut sorted = points.to_vec();
        sort_points(&mut sorted);

        let count = self.archives().len();
        let mut index = 0;
        let mut batch: Vec<Point> = Vec::new();
        // newest first; equal timestamps come out in reverse input order
        for point in sorted.into_iter().rev() {
            let age = now.as_i64() - point.time.as_i64();
            if age < 0 {
                continue;
            }
            while index < count && self.archive(index).max_retention().as_i64() < age {
                if !batch.is_empty() {
                    batch.reverse();
                    self.archive_update_many(index, &batch)?;
                    batch.clear();
                }
                index += 1;
            }
            if index == count {
                break;
            }
            batch.push(point);
        }

        if index < count && !batch.is_empty() {
            batch.reverse();
            self.archive_update_many(index, &batch)?;
        }
        Ok(())
    }

    /// Write all dirty pages through `writer` and mark them clean.
    ///
    /// Adjacent dirty pages are merged; each merged range is one vectored
    /// write of page-sized slices. Returns the number of ranges written.
    pub fn flush<W: PositionedWrite + ?Sized>(&mut self, writer: &mut W) -> Result<usize> {
        let ranges = self.dirty.byte_ranges(self.buf.len());
        let page_size = self.dirty.page_size();

        for range in &ranges {
            let slices: Vec<&[u8]> = self.buf[range.clone()].chunks(page_size).collect();
            trace!(offset = range.start, len = range.len(), "writing dirty range");
            writer.write_vectored_at(&slices, range.start as u64)?;
        }

        self.dirty.clear();
        Ok(ranges.len())
    }

    fn archive(&self, index: usize) -> ArchiveInfo {
        self.header.archives.as_slice()[index]
    }

    /// Propagation needs a consolidating method once a coarser archive exists
    fn check_consolidation(&self, index: usize) -> Result<()> {
        let method = self.aggregation_method();
        if index + 1 < self.archives().len() && !method.is_consolidating() {
            return Err(WhisperError::UnsupportedAggregation(method));
        }
        Ok(())
    }

    fn point_at(&self, archive: &ArchiveInfo, index: usize) -> Point {
        let offset = archive.point_offset(index);
        let slot = &self.buf[offset..offset + POINT_SIZE];
        let time = Timestamp::new(u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]));
        let mut value = [0u8; 8];
        value.copy_from_slice(&slot[4..]);
        Point {
            time,
            value: Value(f64::from_be_bytes(value)),
        }
    }

    fn base_interval(&self, archive: &ArchiveInfo) -> Timestamp {
        self.point_at(archive, 0).time
    }

    fn points_in(&self, archive: &ArchiveInfo, slots: Range<usize>, out: &mut Vec<Point>) {
        out.extend(slots.map(|i| self.point_at(archive, i)));
    }

    /// `count` consecutive ring slots starting at `start`, wrapping once
    fn ring_points(&self, archive: &ArchiveInfo, start: usize, count: usize) -> Vec<Point> {
        let n = archive.number_of_points() as usize;
        let mut points = Vec::with_capacity(count);
        if start + count <= n {
            self.points_in(archive, start..start + count, &mut points);
        } else {
            self.points_in(archive, start..n, &mut points);
            self.points_in(archive, 0..start + count - n, &mut points);
        }
        points
    }

    fn raw_points(
        &self,
        archive: &ArchiveInfo,
        from_interval: Timestamp,
        until_interval: Timestamp,
    ) -> Vec<Point> {
        let base = self.base_interval(archive);
        let n = archive.number_of_points() as usize;
        let from_index = archive.point_index(base, from_interval);
        let until_index = archive.point_index(base, until_interval);
        let count = if from_index < until_index {
            until_index - from_index
        } else {
            n - from_index + until_index
        };
        self.ring_points(archive, from_index, count)
    }

    /// Store an aligned point in its ring slot
    fn write_point(&mut self, archive: &ArchiveInfo, point: Point) {
        let base = self.base_interval(archive);
        let index = if base.is_zero() {
            0
        } else {
            archive.point_index(base, point.time)
        };

        let offset = archive.point_offset(index);
        let mut dst = &mut self.buf[offset..offset + POINT_SIZE];
        point.append_to(&mut dst);
        self.dirty.mark(offset..offset + POINT_SIZE);
    }

    /// Align, dedupe and store chronologically sorted points, then propagate
    fn archive_update_many(&mut self, index: usize, points: &[Point]) -> Result<()> {
        let archive = self.archive(index);

        let mut aligned: Vec<Point> = Vec::with_capacity(points.len());
        for p in points {
            let point = Point {
                time: archive.interval_for_write(p.time),
                value: p.value,
            };
            match aligned.last_mut() {
                Some(last) if last.time == point.time => *last = point,
                _ => aligned.push(point),
            }
        }

        for point in &aligned {
            self.write_point(&archive, *point);
        }

        let intervals: Vec<Timestamp> = aligned.iter().map(|p| p.time).collect();
        self.propagate_from(index, &intervals)
    }

    /// Consolidate the intervals touched in archive `index` down the tiers,
    /// stopping at the first tier where nothing propagated
    fn propagate_from(&mut self, index: usize, intervals: &[Timestamp]) -> Result<()> {
        for lower_index in index + 1..self.archives().len() {
            let lower = self.archive(lower_index);
            let mut lower_intervals: Vec<Timestamp> = intervals
                .iter()
                .map(|&t| lower.interval_for_write(t))
                .collect();
            lower_intervals.sort_unstable();
            lower_intervals.dedup();

            let mut propagated = false;
            for interval in lower_intervals {
                if self.propagate(lower_index - 1, lower_index, interval)? {
                    propagated = true;
                }
            }
            if !propagated {
                break;
            }
        }
        Ok(())
    }

    /// Aggregate the higher-precision points covering one lower interval.
    ///
    /// Writes NaN and returns false when too few of them are known.
    fn propagate(
        &mut self,
        higher_index: usize,
        lower_index: usize,
        lower_interval: Timestamp,
    ) -> Result<bool> {
        let higher = self.archive(higher_index);
        let lower = self.archive(lower_index);

        let higher_base = self.base_interval(&higher);
        let start = if higher_base.is_zero() {
            0
        } else {
            higher.point_index(higher_base, lower_interval)
        };
        let step = higher.seconds_per_point();
        let count = (lower.seconds_per_point().as_secs() / step.as_secs()) as usize;

        let mut known = Vec::with_capacity(count);
        let mut expected = lower_interval;
        for point in self.ring_points(&higher, start, count) {
            if point.time == expected && !point.value.is_nan() {
                known.push(point.value.get());
            }
            expected = expected + step;
        }

        let known_fraction = known.len() as f64 / count as f64;
        let enough = !known.is_empty() && known_fraction >= self.x_files_factor() as f64;
        let value = if enough {
            aggregate(self.aggregation_method(), &known)?
        } else {
            f64::NAN
        };

        trace!(
            higher = higher_index,
            lower = lower_index,
            interval = lower_interval.as_u32(),
            known = known.len(),
            count,
            "propagated"
        );
        self.write_point(
            &lower,
            Point {
                time: lower_interval,
                value: Value(value),
            },
        );
        Ok(enough)
    }
}

/// Clamp `[from, until]` to what a ring of `retention` can hold as of `now`
fn clamp_window(
    from: Timestamp,
    until: Timestamp,
    now: Timestamp,
    retention: Duration,
) -> Option<(Timestamp, Timestamp)> {
    let oldest = now.as_i64() - retention.as_i64();
    if from > now || until.as_i64() < oldest {
        return None;
    }
    let from = from.as_i64().max(oldest);
    let until = until.min(now);
    Some((Timestamp::from_i64_wrapping(from), until))
}

/// Replace slots whose timestamp is not the expected interval with NaN
fn clear_old_points(points: &mut [Point], from_interval: Timestamp, step: Duration) {
    let mut expected = from_interval;
    for point in points.iter_mut() {
        if point.time != expected {
            *point = Point {
                time: expected,
                value: Value::NAN,
            };
        }
        expected = expected + step;
    }
}

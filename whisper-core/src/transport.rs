//! Records for moving fetched data between processes
//!
//! A [`TimeSeries`] is the result of one fetch with its window and step. A
//! [`FileDump`] carries a whole file's header and one series per archive.

use crate::codec::Codec;
use crate::format::Header;
use crate::{Duration, Point, Result, Timestamp, Value};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Points fetched from one archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Start of the returned window
    pub from: Timestamp,
    /// End of the returned window, exclusive
    pub until: Timestamp,
    /// Step of the archive the points came from
    pub step: Duration,
    /// One point per step; NaN where nothing is stored
    pub points: Vec<Point>,
}

impl TimeSeries {
    /// A series with no points
    pub fn empty(from: Timestamp, until: Timestamp, step: Duration) -> Self {
        Self {
            from,
            until,
            step,
            points: Vec::new(),
        }
    }

    /// Build a series from consecutive points at `step`
    pub fn from_points(points: Vec<Point>, step: Duration) -> Option<Self> {
        let from = points.first()?.time;
        let until = points.last()?.time + step;
        Some(Self {
            from,
            until,
            step,
            points,
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.points.iter().map(|p| p.value)
    }

    /// Points that carry data
    pub fn known(&self) -> impl Iterator<Item = &Point> + '_ {
        self.points.iter().filter(|p| !p.value.is_nan())
    }
}

impl Codec for TimeSeries {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        self.from.append_to(dst);
        self.until.append_to(dst);
        self.step.append_to(dst);
        self.points.append_to(dst);
    }

    fn consume(src: &[u8]) -> Result<(&[u8], Self)> {
        let (src, from) = Timestamp::consume(src)?;
        let (src, until) = Timestamp::consume(src)?;
        let (src, step) = Duration::consume(src)?;
        let (src, points) = Vec::<Point>::consume(src)?;
        Ok((
            src,
            Self {
                from,
                until,
                step,
                points,
            },
        ))
    }
}

/// Header plus one series per archive, finest first
#[derive(Debug, Clone, PartialEq)]
pub struct FileDump {
    pub header: Header,
    pub series: Vec<TimeSeries>,
}

impl Codec for FileDump {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        self.header.append_to(dst);
        for series in &self.series {
            series.append_to(dst);
        }
    }

    fn consume(src: &[u8]) -> Result<(&[u8], Self)> {
        let (mut src, header) = Header::consume(src)?;
        let mut series = Vec::with_capacity(header.archives.len());
        for _ in 0..header.archives.len() {
            let (rest, s) = TimeSeries::consume(src)?;
            series.push(s);
            src = rest;
        }
        Ok((src, Self { header, series }))
    }
}

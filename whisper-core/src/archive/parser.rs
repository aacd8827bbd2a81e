//! Retention text parser
//!
//! Grammar: `entry ("," entry)*`, `entry = precision ":" retention`. Both
//! sides are unit-suffixed durations (`1m:2h`). The carbon storage-schemas
//! spelling is accepted too: a bare integer precision is seconds and a bare
//! integer retention is a point count (`60:1440`).

use super::{ArchiveInfo, ArchiveList};
use crate::types::parse_duration;
use crate::{Duration, Result, WhisperError};

/// Right-hand side of an entry
enum Retention {
    Span(Duration),
    Points(u32),
}

/// Parse an archive list such as `"1m:2h,1h:2d,1d:30d"`
pub fn parse_archive_list(s: &str) -> Result<ArchiveList> {
    if s.trim().is_empty() {
        return Err(WhisperError::InvalidArchive("empty archive list".into()));
    }

    let archives = s
        .split(',')
        .map(|entry| parse_entry(entry.trim()))
        .collect::<Result<Vec<_>>>()?;

    ArchiveList::new(archives)
}

fn parse_entry(entry: &str) -> Result<ArchiveInfo> {
    let (precision, retention) = entry.split_once(':').ok_or_else(|| {
        WhisperError::InvalidArchive(format!("{:?}: expected <precision>:<retention>", entry))
    })?;

    let step = match bare_integer(precision)? {
        Some(secs) => i32::try_from(secs).map(Duration::from_secs).map_err(|_| {
            WhisperError::InvalidDuration(format!("{:?}: value out of range", precision))
        })?,
        None => parse_duration(precision)?,
    };
    if !step.is_positive() {
        return Err(WhisperError::InvalidArchive(format!(
            "{:?}: precision must be positive",
            entry
        )));
    }

    let retention = match bare_integer(retention)? {
        Some(points) => Retention::Points(points),
        None => Retention::Span(parse_duration(retention)?),
    };

    let number_of_points = match retention {
        Retention::Points(points) => points,
        Retention::Span(span) => {
            if span.as_secs() % step.as_secs() != 0 {
                return Err(WhisperError::InvalidArchive(format!(
                    "{:?}: retention {} is not a multiple of precision {}",
                    entry, span, step
                )));
            }
            (span.as_secs() / step.as_secs()) as u32
        }
    };

    Ok(ArchiveInfo::new(step, number_of_points))
}

/// A unit-less integer, or `None` when the text carries a unit
fn bare_integer(s: &str) -> Result<Option<u32>> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    if s.len() > 1 && s.starts_with('0') {
        return Err(WhisperError::InvalidDuration(format!(
            "{:?}: redundant leading zero",
            s
        )));
    }
    s.parse()
        .map(Some)
        .map_err(|_| WhisperError::InvalidDuration(format!("{:?}: value out of range", s)))
}

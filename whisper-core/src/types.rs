//! Core types for Whisper

use crate::{Result, WhisperError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Floored-division remainder: the result carries the sign of `y`.
///
/// `floor_mod(-5, 3) == 1` and `floor_mod(5, -3) == -1`, unlike `%`.
///
/// # Panics
///
/// Panics if `y` is zero.
pub fn floor_mod(x: i64, y: i64) -> i64 {
    let r = x % y;
    if r != 0 && ((r < 0) != (y < 0)) {
        r + y
    } else {
        r
    }
}

/// Floored division, rounding toward negative infinity.
///
/// # Panics
///
/// Panics if `y` is zero.
pub fn floor_div(x: i64, y: i64) -> i64 {
    let q = x / y;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        q - 1
    } else {
        q
    }
}

/// Seconds since the Unix epoch, as stored on disk
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u32);

impl Timestamp {
    /// The epoch; a slot holding it has never been written
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create a timestamp from seconds since the epoch
    pub const fn new(secs: u32) -> Self {
        Self(secs)
    }

    /// Seconds since the epoch
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Seconds since the epoch, widened for signed arithmetic
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Whether this is the "never written" placeholder
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Floor to the nearest multiple of `step` at or before this time
    pub fn truncate(self, step: Duration) -> Self {
        let t = self.as_i64();
        Self::from_i64_wrapping(t - floor_mod(t, step.as_i64()))
    }

    /// Convert from a wide value, wrapping like the on-disk u32 does
    pub(crate) fn from_i64_wrapping(secs: i64) -> Self {
        Self(secs as u32)
    }

    /// Convert from a system time, saturating outside the u32 range
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(u32::try_from(d.as_secs()).unwrap_or(u32::MAX)),
            Err(_) => Self::ZERO,
        }
    }

    /// Convert to a UTC date-time
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.as_i64(), 0).single()
    }
}

impl From<u32> for Timestamp {
    fn from(secs: u32) -> Self {
        Self(secs)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp().clamp(0, u32::MAX as i64) as u32)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%SZ")),
            None => write!(f, "{}", self.0),
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.wrapping_add_signed(rhs.0))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp::from_i64_wrapping(self.as_i64() - rhs.as_i64())
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    /// Signed distance, saturating at the i32 bounds
    fn sub(self, rhs: Timestamp) -> Duration {
        let d = self.as_i64() - rhs.as_i64();
        Duration(d.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
    }
}

/// Signed span of seconds
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Duration(i32);

impl Duration {
    pub const ZERO: Duration = Duration(0);
    pub const SECOND: Duration = Duration(1);
    pub const MINUTE: Duration = Duration(60);
    pub const HOUR: Duration = Duration(3600);
    pub const DAY: Duration = Duration(86_400);
    pub const WEEK: Duration = Duration(7 * 86_400);
    pub const YEAR: Duration = Duration(365 * 86_400);

    /// Create a duration from seconds
    pub const fn from_secs(secs: i32) -> Self {
        Self(secs)
    }

    /// Length in seconds
    pub const fn as_secs(self) -> i32 {
        self.0
    }

    /// Length in seconds, widened for intermediate arithmetic
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Whether the span is strictly positive
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Multiply by a point count, failing on i32 overflow
    pub fn checked_mul(self, n: u32) -> Option<Duration> {
        let product = self.as_i64().checked_mul(n as i64)?;
        i32::try_from(product).ok().map(Duration)
    }
}

impl Neg for Duration {
    type Output = Duration;

    fn neg(self) -> Duration {
        Duration(self.0.saturating_neg())
    }
}

fn unit_seconds(unit: char) -> Option<i64> {
    match unit {
        's' => Some(1),
        'm' => Some(Duration::MINUTE.as_i64()),
        'h' => Some(Duration::HOUR.as_i64()),
        'd' => Some(Duration::DAY.as_i64()),
        'w' => Some(Duration::WEEK.as_i64()),
        'y' => Some(Duration::YEAR.as_i64()),
        _ => None,
    }
}

/// Parse `<integer><unit>` such as `10s`, `2h` or `1y`.
///
/// The integer has no sign and no redundant leading zeros; exactly one unit
/// from `s m h d w y` must follow, and the result must fit in an i32.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(digits_end);

    if digits.is_empty() {
        return Err(WhisperError::InvalidDuration(format!(
            "{:?}: missing leading integer",
            s
        )));
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(WhisperError::InvalidDuration(format!(
            "{:?}: redundant leading zero",
            s
        )));
    }

    let mut chars = unit.chars();
    let multiplier = match chars.next() {
        Some(c) => unit_seconds(c).ok_or_else(|| {
            WhisperError::InvalidDuration(format!("{:?}: unknown unit {:?}", s, c))
        })?,
        None => {
            return Err(WhisperError::InvalidDuration(format!(
                "{:?}: missing unit",
                s
            )))
        }
    };
    if chars.next().is_some() {
        return Err(WhisperError::InvalidDuration(format!(
            "{:?}: exactly one unit expected",
            s
        )));
    }

    let overflow = || WhisperError::InvalidDuration(format!("{:?}: value out of range", s));
    let n: i64 = digits.parse().map_err(|_| overflow())?;
    let secs = n
        .checked_mul(multiplier)
        .filter(|v| *v <= i32::MAX as i64)
        .ok_or_else(overflow)?;

    Ok(Duration(secs as i32))
}

impl FromStr for Duration {
    type Err = WhisperError;

    fn from_str(s: &str) -> Result<Self> {
        parse_duration(s)
    }
}

impl fmt::Display for Duration {
    /// Formats with the largest unit that divides the span exactly
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.as_i64();
        if secs == 0 {
            return write!(f, "0s");
        }
        for unit in ['y', 'w', 'd', 'h', 'm'] {
            if let Some(mult) = unit_seconds(unit) {
                if secs % mult == 0 {
                    return write!(f, "{}{}", secs / mult, unit);
                }
            }
        }
        write!(f, "{}s", secs)
    }
}

/// A stored value; NaN means "no data"
#[derive(Debug, Clone, Copy)]
pub struct Value(pub f64);

impl Value {
    /// The "no data" marker
    pub const NAN: Value = Value(f64::NAN);

    /// Whether the value is the "no data" marker
    pub fn is_nan(self) -> bool {
        self.0.is_nan()
    }

    /// Get the raw float
    pub fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for Value {
    /// NaN compares equal to NaN so records with no data round-trip
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 || (self.0.is_nan() && other.0.is_nan())
    }
}

/// NaN travels as `null`, which JSON can represent
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.0.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(Value(value.unwrap_or(f64::NAN)))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value(v)
    }
}

impl From<Value> for f64 {
    fn from(v: Value) -> Self {
        v.0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single data point with timestamp and value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Seconds since the epoch
    pub time: Timestamp,
    /// Value, NaN when unknown
    pub value: Value,
}

impl Point {
    /// Create a new point
    pub fn new(time: impl Into<Timestamp>, value: impl Into<Value>) -> Self {
        Self {
            time: time.into(),
            value: value.into(),
        }
    }
}

/// Sort points chronologically, keeping the input order of equal timestamps
pub fn sort_points(points: &mut [Point]) {
    points.sort_by_key(|p| p.time);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_mod_sign_follows_divisor() {
        assert_eq!(floor_mod(-5, 3), 1);
        assert_eq!(floor_mod(5, -3), -1);
        assert_eq!(floor_mod(5, 3), 2);
        assert_eq!(floor_mod(-5, -3), -2);
        assert_eq!(floor_mod(-6, 3), 0);

        for x in -20..20 {
            for y in [-7i64, -3, -1, 1, 2, 5] {
                let r = floor_mod(x, y);
                assert!(r == 0 || (r > 0) == (y > 0), "floor_mod({x}, {y}) = {r}");
                assert_eq!(floor_div(x, y) * y + r, x);
            }
        }
    }

    #[test]
    fn test_floor_div() {
        assert_eq!(floor_div(-1, 5), -1);
        assert_eq!(floor_div(-5, 5), -1);
        assert_eq!(floor_div(-6, 5), -2);
        assert_eq!(floor_div(7, 5), 1);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::DAY);
        assert_eq!(parse_duration("1w").unwrap(), Duration::WEEK);
        assert_eq!(parse_duration("1y").unwrap(), Duration::YEAR);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_rejects_malformed() {
        for bad in ["", "s", "10", "01s", "00m", "1h30m", "1hh", "-1s", "+1s", "1x", "1 s"] {
            let err = parse_duration(bad).unwrap_err();
            assert!(
                matches!(err, WhisperError::InvalidDuration(_)),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert_eq!(
            parse_duration("2147483647s").unwrap().as_secs(),
            i32::MAX
        );
        assert!(parse_duration("2147483648s").is_err());
        assert!(parse_duration("69y").is_err());
        assert!(parse_duration("99999999999999999999999s").is_err());
    }

    #[test]
    fn test_duration_display() {
        assert_eq!(Duration::from_secs(7200).to_string(), "2h");
        assert_eq!(Duration::from_secs(90).to_string(), "90s");
        assert_eq!(Duration::from_secs(120).to_string(), "2m");
        assert_eq!(Duration::from_secs(30 * 86_400).to_string(), "30d");
        assert_eq!(Duration::from_secs(14 * 86_400).to_string(), "2w");
        assert_eq!(Duration::ZERO.to_string(), "0s");
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::new(1000);
        assert_eq!(t + Duration::MINUTE, Timestamp::new(1060));
        assert_eq!(t - Duration::from_secs(10), Timestamp::new(990));
        assert_eq!(Timestamp::new(990) - t, Duration::from_secs(-10));
        assert_eq!(Timestamp::new(1079).truncate(Duration::MINUTE), Timestamp::new(1020));
        assert_eq!(Timestamp::new(1080).truncate(Duration::MINUTE), Timestamp::new(1080));
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(Timestamp::new(0).to_string(), "1970-01-01T00:00:00Z");
        assert_eq!(Timestamp::new(86_400 + 61).to_string(), "1970-01-02T00:01:01Z");
    }

    #[test]
    fn test_value_nan_equality() {
        assert_eq!(Value::NAN, Value::NAN);
        assert_ne!(Value(1.0), Value::NAN);
        assert_eq!(Value(2.5), Value::from(2.5));
    }

    #[test]
    fn test_value_json_null_for_nan() {
        let point = Point::new(60u32, f64::NAN);
        let json = serde_json::to_string(&point).unwrap();
        assert_eq!(json, r#"{"time":60,"value":null}"#);
        let back: Point = serde_json::from_str(&json).unwrap();
        assert_eq!(back, point);
        assert_eq!(serde_json::to_string(&Value(1.5)).unwrap(), "1.5");
    }

    #[test]
    fn test_sort_points() {
        let mut points = vec![
            Point::new(30, 3.0),
            Point::new(10, 1.0),
            Point::new(20, 2.0),
        ];
        sort_points(&mut points);
        let times: Vec<u32> = points.iter().map(|p| p.time.as_u32()).collect();
        assert_eq!(times, vec![10, 20, 30]);
    }
}

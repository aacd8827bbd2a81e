//! Binary codec shared by file and wire records
//!
//! Every record appends itself big-endian to a growable buffer and consumes
//! itself from the front of a byte slice, handing back the unread rest. A
//! slice that is too short yields [`WhisperError::Truncated`] carrying the
//! number of missing bytes, never a generic format error.

use crate::{Duration, Point, Result, Timestamp, Value, WhisperError};
use bytes::{Buf, BufMut};

/// Symmetric append/consume encoding
pub trait Codec: Sized {
    /// Serialize and append to `dst`
    fn append_to<B: BufMut>(&self, dst: &mut B);

    /// Deserialize from the front of `src`, returning the rest
    fn consume(src: &[u8]) -> Result<(&[u8], Self)>;

    /// Serialize into a fresh buffer
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.append_to(&mut buf);
        buf
    }
}

/// Fail with the shortfall unless `src` holds at least `len` bytes
pub fn ensure_len(src: &[u8], len: usize) -> Result<()> {
    if src.len() < len {
        return Err(WhisperError::Truncated {
            needed: len - src.len(),
        });
    }
    Ok(())
}

impl Codec for Timestamp {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.as_u32());
    }

    fn consume(mut src: &[u8]) -> Result<(&[u8], Self)> {
        ensure_len(src, 4)?;
        let t = Timestamp::new(src.get_u32());
        Ok((src, t))
    }
}

impl Codec for Duration {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_i32(self.as_secs());
    }

    fn consume(mut src: &[u8]) -> Result<(&[u8], Self)> {
        ensure_len(src, 4)?;
        let d = Duration::from_secs(src.get_i32());
        Ok((src, d))
    }
}

impl Codec for Value {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_f64(self.get());
    }

    fn consume(mut src: &[u8]) -> Result<(&[u8], Self)> {
        ensure_len(src, 8)?;
        let v = Value(src.get_f64());
        Ok((src, v))
    }
}

impl Codec for Point {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        self.time.append_to(dst);
        self.value.append_to(dst);
    }

    fn consume(src: &[u8]) -> Result<(&[u8], Self)> {
        ensure_len(src, crate::format::POINT_SIZE)?;
        let (src, time) = Timestamp::consume(src)?;
        let (src, value) = Value::consume(src)?;
        Ok((src, Point { time, value }))
    }
}

/// Length-prefixed sequence: u32 count followed by the elements
impl<T: Codec> Codec for Vec<T> {
    fn append_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.len() as u32);
        for item in self {
            item.append_to(dst);
        }
    }

    fn consume(mut src: &[u8]) -> Result<(&[u8], Self)> {
        ensure_len(src, 4)?;
        let count = src.get_u32() as usize;
        let mut items = Vec::with_capacity(count.min(src.len()));
        for _ in 0..count {
            let (rest, item) = T::consume(src)?;
            items.push(item);
            src = rest;
        }
        Ok((src, items))
    }
}

//! Dirty page tracking for the in-memory file image

use crate::{Result, WhisperError};
use std::ops::Range;

/// Growable set of bit indices
#[derive(Debug, Clone, Default)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    /// Create a set able to hold `len` bits, all clear
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set bit `i`, growing the set if needed
    pub fn set(&mut self, i: usize) {
        if i >= self.len {
            self.grow(i + 1);
        }
        self.words[i / 64] |= 1 << (i % 64);
    }

    /// Set every bit in `range`
    pub fn set_range(&mut self, range: Range<usize>) {
        for i in range {
            self.set(i);
        }
    }

    pub fn test(&self, i: usize) -> bool {
        i < self.len && self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Maximal runs of set bits as half-open ranges, in ascending order
    pub fn ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start: Option<usize> = None;

        for (wi, &word) in self.words.iter().enumerate() {
            let base = wi * 64;
            if word == 0 {
                if let Some(s) = start.take() {
                    ranges.push(s..base);
                }
                continue;
            }
            if word == u64::MAX {
                start.get_or_insert(base);
                continue;
            }
            for bit in 0..64 {
                let i = base + bit;
                if i >= self.len {
                    break;
                }
                if word & (1 << bit) != 0 {
                    start.get_or_insert(i);
                } else if let Some(s) = start.take() {
                    ranges.push(s..i);
                }
            }
        }

        if let Some(s) = start {
            ranges.push(s..self.len);
        }
        ranges
    }

    fn grow(&mut self, len: usize) {
        self.words.resize(len.div_ceil(64), 0);
        self.len = len;
    }
}

/// Reject page sizes that cannot partition a file
pub(crate) fn check_page_size(page_size: usize) -> Result<()> {
    if page_size == 0 {
        return Err(WhisperError::Config("page size must be positive".into()));
    }
    Ok(())
}

/// Pages of a file image modified since the last flush.
///
/// The bit set is only allocated on the first modification.
#[derive(Debug, Clone)]
pub struct DirtyPages {
    page_size: usize,
    page_count: usize,
    bits: Option<BitSet>,
}

impl DirtyPages {
    pub fn new(file_size: usize, page_size: usize) -> Self {
        Self {
            page_size,
            page_count: file_size.div_ceil(page_size),
            bits: None,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Mark every page overlapping `bytes`
    pub fn mark(&mut self, bytes: Range<usize>) {
        if bytes.is_empty() {
            return;
        }
        let first = bytes.start / self.page_size;
        let last = (bytes.end - 1) / self.page_size;
        let bits = self
            .bits
            .get_or_insert_with(|| BitSet::new(self.page_count));
        bits.set_range(first..last + 1);
    }

    pub fn is_dirty(&self) -> bool {
        self.bits.as_ref().map(BitSet::any).unwrap_or(false)
    }

    pub fn is_page_dirty(&self, page: usize) -> bool {
        self.bits.as_ref().map(|b| b.test(page)).unwrap_or(false)
    }

    /// Merged runs of dirty pages
    pub fn page_ranges(&self) -> Vec<Range<usize>> {
        self.bits.as_ref().map(BitSet::ranges).unwrap_or_default()
    }

    /// Merged runs of dirty pages as byte ranges, clipped to `file_size`
    pub fn byte_ranges(&self, file_size: usize) -> Vec<Range<usize>> {
        self.page_ranges()
            .into_iter()
            .map(|r| r.start * self.page_size..(r.end * self.page_size).min(file_size))
            .filter(|r| !r.is_empty())
            .collect()
    }

    pub fn clear(&mut self) {
        if let Some(bits) = &mut self.bits {
            bits.clear_all();
        }
    }
}

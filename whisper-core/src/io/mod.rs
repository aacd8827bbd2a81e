//! Positioned scatter/gather I/O
//!
//! A [`VectoredIo`] backend performs one positioned transfer per call and may
//! move fewer bytes than asked. [`pwritev_full`] and [`preadv_full`] wrap a
//! backend in the retry loop: after each partial transfer the buffer list is
//! advanced past the bytes already moved and the file offset follows, until
//! everything is transferred, a read hits end of file, or a call fails.

mod pool;
mod portable;
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
mod syscall;

pub use pool::{default_pool, BufferPool};
pub use portable::PortableIo;
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub use syscall::SyscallIo;

use crate::config::MAX_IOVECS;
use std::fs::File;
use std::io::{self, ErrorKind, IoSlice, IoSliceMut};
use tracing::trace;

/// Backend selected for this target
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub type NativeIo = SyscallIo;

/// Backend selected for this target
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub type NativeIo = PortableIo;

/// One positioned vectored transfer per call
pub trait VectoredIo {
    /// Write `bufs` in order starting at `offset`; may write only a prefix
    fn pwritev(&self, file: &File, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize>;

    /// Fill `bufs` in order from `offset`; may fill only a prefix, 0 at end of file
    fn preadv(&self, file: &File, bufs: &mut [IoSliceMut<'_>], offset: u64) -> io::Result<usize>;
}

/// Destination for dirty ranges of a file image
pub trait PositionedWrite {
    /// Write all of `bufs` contiguously at `offset`
    fn write_vectored_at(&mut self, bufs: &[&[u8]], offset: u64) -> io::Result<()>;
}

/// Writes through a [`VectoredIo`] backend into a file
pub struct FileWriter<'a, I: VectoredIo + ?Sized> {
    file: &'a File,
    io: &'a I,
}

impl<'a, I: VectoredIo + ?Sized> FileWriter<'a, I> {
    pub fn new(file: &'a File, io: &'a I) -> Self {
        Self { file, io }
    }
}

impl<I: VectoredIo + ?Sized> PositionedWrite for FileWriter<'_, I> {
    fn write_vectored_at(&mut self, bufs: &[&[u8]], offset: u64) -> io::Result<()> {
        pwritev_full(self.io, self.file, bufs, offset).map(|_| ())
    }
}

/// Drop the first `n` bytes from a buffer list
pub fn iovs_adjust<'a>(bufs: &[&'a [u8]], mut n: usize) -> Vec<&'a [u8]> {
    let mut rest = Vec::with_capacity(bufs.len());
    for &b in bufs {
        if n == 0 {
            rest.push(b);
        } else if n >= b.len() {
            n -= b.len();
        } else {
            rest.push(&b[n..]);
            n = 0;
        }
    }
    rest
}

/// [`iovs_adjust`] for buffers being filled
pub fn iovs_adjust_mut<'a>(bufs: Vec<&'a mut [u8]>, mut n: usize) -> Vec<&'a mut [u8]> {
    let mut rest = Vec::with_capacity(bufs.len());
    for b in bufs {
        if n == 0 {
            rest.push(b);
        } else if n >= b.len() {
            n -= b.len();
        } else {
            rest.push(&mut b[n..]);
            n = 0;
        }
    }
    rest
}

/// Write every byte of `bufs` at `offset`, retrying short and interrupted writes
pub fn pwritev_full<I: VectoredIo + ?Sized>(
    io: &I,
    file: &File,
    bufs: &[&[u8]],
    offset: u64,
) -> io::Result<usize> {
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    let mut pending: Vec<&[u8]> = bufs.to_vec();
    let mut written = 0usize;

    while written < total {
        let iovs: Vec<IoSlice<'_>> = pending
            .iter()
            .take(MAX_IOVECS)
            .map(|b| IoSlice::new(b))
            .collect();
        let requested: usize = iovs.iter().map(|s| s.len()).sum();
        let result = io.pwritev(file, &iovs, offset + written as u64);
        drop(iovs);

        match result {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                if n < requested {
                    trace!(written = n, requested, "short vectored write, retrying");
                }
                written += n;
                pending = iovs_adjust(&pending, n);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(written)
}

/// Fill `bufs` from `offset`, retrying short and interrupted reads.
///
/// Returns fewer bytes than requested only when end of file is reached.
pub fn preadv_full<I: VectoredIo + ?Sized>(
    io: &I,
    file: &File,
    bufs: &mut [&mut [u8]],
    offset: u64,
) -> io::Result<usize> {
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    let mut pending: Vec<&mut [u8]> = bufs.iter_mut().map(|b| &mut **b).collect();
    let mut read = 0usize;

    while read < total {
        let mut iovs: Vec<IoSliceMut<'_>> = pending
            .iter_mut()
            .take(MAX_IOVECS)
            .map(|b| IoSliceMut::new(b))
            .collect();
        let result = io.preadv(file, &mut iovs, offset + read as u64);
        drop(iovs);

        match result {
            Ok(0) => break,
            Ok(n) => {
                trace!(read = n, "vectored read");
                read += n;
                pending = iovs_adjust_mut(pending, n);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(read)
}

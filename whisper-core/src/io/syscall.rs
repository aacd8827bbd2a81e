//! `preadv(2)` / `pwritev(2)` backend

use super::VectoredIo;
use crate::config::MAX_IOVECS;
use std::fs::File;
use std::io::{self, ErrorKind, IoSlice, IoSliceMut};
use std::os::unix::io::AsRawFd;

/// Issues one system call per transfer
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallIo;

fn to_off_t(offset: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(offset)
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "file offset out of range"))
}

fn to_result(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl VectoredIo for SyscallIo {
    fn pwritev(&self, file: &File, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize> {
        let offset = to_off_t(offset)?;
        let count = bufs.len().min(MAX_IOVECS) as libc::c_int;
        // SAFETY: IoSlice is ABI compatible with iovec on unix and the
        // slices stay borrowed for the duration of the call.
        let n = unsafe {
            libc::pwritev(
                file.as_raw_fd(),
                bufs.as_ptr() as *const libc::iovec,
                count,
                offset,
            )
        };
        to_result(n)
    }

    fn preadv(&self, file: &File, bufs: &mut [IoSliceMut<'_>], offset: u64) -> io::Result<usize> {
        let offset = to_off_t(offset)?;
        let count = bufs.len().min(MAX_IOVECS) as libc::c_int;
        // SAFETY: IoSliceMut is ABI compatible with iovec on unix and the
        // slices stay exclusively borrowed for the duration of the call.
        let n = unsafe {
            libc::preadv(
                file.as_raw_fd(),
                bufs.as_mut_ptr() as *const libc::iovec,
                count,
                offset,
            )
        };
        to_result(n)
    }
}

//! Buffer-at-a-time backend for targets without vectored positioned I/O

use super::VectoredIo;
use std::fs::File;
use std::io::{self, IoSlice, IoSliceMut};

/// Emulates a vectored transfer with one positioned call per buffer.
///
/// Stops at the first short transfer so the caller sees a prefix, like the
/// system calls. An error after some bytes moved reports the partial count.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableIo;

impl VectoredIo for PortableIo {
    fn pwritev(&self, file: &File, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize> {
        let mut done = 0usize;
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            match write_at(file, buf, offset + done as u64) {
                Ok(n) => {
                    done += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(_) if done > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    fn preadv(&self, file: &File, bufs: &mut [IoSliceMut<'_>], offset: u64) -> io::Result<usize> {
        let mut done = 0usize;
        for buf in bufs.iter_mut() {
            if buf.is_empty() {
                continue;
            }
            match read_at(file, buf, offset + done as u64) {
                Ok(n) => {
                    done += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(_) if done > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

// src/stream/plain.rs

use super::StreamCore;
use crate::error::{Error, Result};
use std::io;

/// Plain TCP session stream backed by a non-blocking socket. EAGAIN maps
/// to `Ok(0)`, which makes the caller yield; end-of-file is a hard error
/// that tears the session down.
pub struct PlainStream {
    pub(crate) core: StreamCore,
}

impl PlainStream {
    pub(crate) fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe { libc::read(self.core.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            )));
        }
        Ok(n as usize)
    }

    pub(crate) fn write_some(&mut self, buf: &[u8]) -> Result<usize> {
        let n = unsafe { libc::write(self.core.fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        if n > 0 {
            self.core.can_write_error = false;
        }
        Ok(n as usize)
    }

    /// Gathered write of `bufs` with the first `skip` logical bytes
    /// already sent.
    pub(crate) fn write_some_vectored(&mut self, bufs: &[&[u8]], skip: usize) -> Result<usize> {
        let mut iov: Vec<libc::iovec> = Vec::with_capacity(bufs.len());
        let mut to_skip = skip;
        for buf in bufs {
            if to_skip >= buf.len() {
                to_skip -= buf.len();
                continue;
            }
            let part = &buf[to_skip..];
            to_skip = 0;
            iov.push(libc::iovec {
                iov_base: part.as_ptr() as *mut libc::c_void,
                iov_len: part.len(),
            });
        }
        if iov.is_empty() {
            return Ok(0);
        }
        let n = unsafe { libc::writev(self.core.fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        if n > 0 {
            self.core.can_write_error = false;
        }
        Ok(n as usize)
    }
}

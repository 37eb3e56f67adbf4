// src/stream/tls.rs

use super::StreamCore;
use crate::error::{Error, Result};
use std::io::{self, Read, Write};
use std::time::Duration;

/// TLS session stream: a rustls server connection pumped over the same
/// non-blocking socket as the plain variant. WANT-read/-write conditions
/// map to `Ok(0)` so the caller yields to the reactor.
pub struct TlsStream {
    pub(crate) core: StreamCore,
    pub(crate) tls: rustls::ServerConnection,
    pub(crate) accept_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
}

impl TlsStream {
    pub(crate) fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.tls.reader().read(buf) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed tls stream",
                    )))
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::Io(e)),
            }

            // no plaintext buffered, pull more records off the socket
            match self.tls.read_tls(&mut FdIo(self.core.fd)) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    )))
                }
                Ok(_) => {
                    self.process_packets()?;
                    self.flush_tls()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    pub(crate) fn write_some(&mut self, buf: &[u8]) -> Result<usize> {
        self.flush_tls()?;
        if self.tls.wants_write() {
            // record buffer still backed up behind the socket
            return Ok(0);
        }
        let n = self.tls.writer().write(buf).map_err(Error::Io)?;
        if n > 0 {
            self.core.can_write_error = false;
        }
        self.flush_tls()?;
        Ok(n)
    }

    /// Vectored write. A first segment that alone reaches the socket write
    /// size (or a lone segment) goes out directly; otherwise the pieces
    /// are coalesced into the reactor's shared write scratch and written
    /// as one segment.
    pub(crate) fn write_some_vectored(&mut self, bufs: &[&[u8]], skip: usize) -> Result<usize> {
        let mut to_skip = skip;
        let mut remaining: Vec<&[u8]> = Vec::with_capacity(bufs.len());
        for buf in bufs {
            if to_skip >= buf.len() {
                to_skip -= buf.len();
                continue;
            }
            remaining.push(&buf[to_skip..]);
            to_skip = 0;
        }
        let Some(first) = remaining.first() else {
            return Ok(0);
        };

        let socket_size = super::socket_buffer_size(self.core.fd, libc::SO_SNDBUF)?;
        if first.len() >= socket_size || remaining.len() == 1 {
            return self.write_some(first);
        }

        let reactor = std::sync::Arc::clone(&self.core.reactor);
        let mut scratch = reactor.write_scratch(socket_size);
        scratch.reset();
        let limit = usize::min(scratch.size(), socket_size);
        let mut filled = 0;
        for piece in &remaining {
            if filled == limit {
                break;
            }
            let take = usize::min(piece.len(), limit - filled);
            scratch.current_mut()[filled..filled + take].copy_from_slice(&piece[..take]);
            filled += take;
        }
        scratch.set_current_size(filled);
        self.write_some(scratch.current())
    }

    /// Advances the accept handshake as far as the socket allows. Returns
    /// true once the handshake is finished, false when it would block.
    pub(crate) fn handshake_step(&mut self) -> Result<bool> {
        loop {
            if !self.tls.is_handshaking() {
                self.flush_tls()?;
                return Ok(true);
            }
            let mut progress = false;
            if self.tls.wants_write() {
                match self.tls.write_tls(&mut FdIo(self.core.fd)) {
                    Ok(n) => progress |= n > 0,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            if self.tls.is_handshaking() && self.tls.wants_read() {
                match self.tls.read_tls(&mut FdIo(self.core.fd)) {
                    Ok(0) => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "peer aborted tls handshake",
                        )))
                    }
                    Ok(_) => {
                        self.process_packets()?;
                        progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            if !progress {
                return Ok(false);
            }
        }
    }

    pub(crate) fn begin_close_notify(&mut self) -> Result<()> {
        if !self.tls.is_handshaking() {
            self.tls.send_close_notify();
            self.flush_tls()?;
        }
        Ok(())
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.tls.wants_write()
    }

    pub(crate) fn flush_tls(&mut self) -> Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut FdIo(self.core.fd)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn process_packets(&mut self) -> Result<()> {
        self.tls.process_new_packets().map_err(|e| {
            Error::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        })?;
        Ok(())
    }
}

/// Raw-fd adaptor for rustls' sans-io record pump.
struct FdIo(libc::c_int);

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

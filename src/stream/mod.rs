// src/stream/mod.rs
//
// The read/write/yield abstraction handlers see. Two variants share one
// cooperative contract: leaf operations return Ok(0) when the underlying
// socket would block, and the async wrappers yield back to the reactor
// until the next readiness edge.

mod plain;
mod tls;

pub(crate) use plain::PlainStream;
pub(crate) use tls::TlsStream;

use crate::codec::Decoder;
use crate::error::{Error, Result};
use crate::http::{BodyFraming, Request, Response, State, END_OF_CHUNKED_STREAM};
use crate::reactor::Reactor;
use crate::session::{SessionShared, Wakeupper, YieldNow};
use crate::util::Buffer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct StreamCore {
    pub(crate) fd: libc::c_int,
    pub(crate) peer: SocketAddr,
    pub(crate) reactor: Arc<Reactor>,
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) wakeupper: Arc<Wakeupper>,
    pub(crate) keep_alive: Duration,
    pub(crate) can_write_error: bool,
    pub(crate) decoder: Decoder,
    pub(crate) carry: Buffer,
}

impl StreamCore {
    fn new(
        fd: libc::c_int,
        peer: SocketAddr,
        reactor: Arc<Reactor>,
        shared: Arc<SessionShared>,
        wakeupper: Arc<Wakeupper>,
    ) -> Self {
        Self {
            fd,
            peer,
            reactor,
            shared,
            wakeupper,
            keep_alive: Duration::ZERO,
            can_write_error: false,
            decoder: Decoder::new(),
            carry: Buffer::new(),
        }
    }
}

pub enum Stream {
    Plain(PlainStream),
    Tls(TlsStream),
}

impl Stream {
    pub(crate) fn plain(
        fd: libc::c_int,
        peer: SocketAddr,
        reactor: Arc<Reactor>,
        shared: Arc<SessionShared>,
        wakeupper: Arc<Wakeupper>,
    ) -> Stream {
        Stream::Plain(PlainStream {
            core: StreamCore::new(fd, peer, reactor, shared, wakeupper),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn tls(
        fd: libc::c_int,
        peer: SocketAddr,
        reactor: Arc<Reactor>,
        shared: Arc<SessionShared>,
        wakeupper: Arc<Wakeupper>,
        config: Arc<rustls::ServerConfig>,
        accept_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Result<Stream> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| Error::Unknown(format!("tls setup failed: {e}")))?;
        Ok(Stream::Tls(TlsStream {
            core: StreamCore::new(fd, peer, reactor, shared, wakeupper),
            tls: conn,
            accept_timeout,
            shutdown_timeout,
        }))
    }

    pub(crate) fn core(&self) -> &StreamCore {
        match self {
            Stream::Plain(s) => &s.core,
            Stream::Tls(s) => &s.core,
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut StreamCore {
        match self {
            Stream::Plain(s) => &mut s.core,
            Stream::Tls(s) => &mut s.core,
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Stream::Plain(s) => s.read_some(buf),
            Stream::Tls(s) => s.read_some(buf),
        }
    }

    fn write_some(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            Stream::Plain(s) => s.write_some(buf),
            Stream::Tls(s) => s.write_some(buf),
        }
    }

    fn write_some_vectored(&mut self, bufs: &[&[u8]], skip: usize) -> Result<usize> {
        match self {
            Stream::Plain(s) => s.write_some_vectored(bufs, skip),
            Stream::Tls(s) => s.write_some_vectored(bufs, skip),
        }
    }

    /// Cooperatively returns to the reactor; resumes on the next readiness
    /// edge, wake-up or cancellation. A cancelled or timed-out session
    /// observes the error here.
    pub async fn yield_now(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.core().shared);
        YieldNow::new(&shared).await
    }

    /// Handle for resuming this session from another thread.
    pub fn wakeupper(&self) -> Arc<Wakeupper> {
        Arc::clone(&self.core().wakeupper)
    }

    /// Seconds the connection is held open after the response; zero closes
    /// it once the current response is done.
    pub fn keep_alive(&self) -> Duration {
        self.core().keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: Duration) {
        self.core_mut().keep_alive = keep_alive;
    }

    pub fn session_timeout(&self) -> Duration {
        self.core().shared.session_timeout()
    }

    /// Arms the reactor-enforced deadline for this session, starting now.
    /// A zero duration disables it.
    pub fn set_session_timeout(&mut self, timeout: Duration) {
        self.core().shared.set_session_timeout(timeout);
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.core().peer
    }

    pub fn is_secured_connection(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    pub fn socket_read_size(&self) -> Result<usize> {
        socket_buffer_size(self.core().fd, libc::SO_RCVBUF)
    }

    pub fn set_socket_read_size(&mut self, size: usize) -> Result<()> {
        set_socket_buffer_size(self.core().fd, libc::SO_RCVBUF, size)
    }

    pub fn socket_write_size(&self) -> Result<usize> {
        socket_buffer_size(self.core().fd, libc::SO_SNDBUF)
    }

    pub fn set_socket_write_size(&mut self, size: usize) -> Result<()> {
        set_socket_buffer_size(self.core().fd, libc::SO_SNDBUF, size)
    }

    pub(crate) fn can_write_error(&self) -> bool {
        self.core().can_write_error
    }

    /// Drives the decoder until the request headers are complete (or the
    /// whole message, for bodyless requests).
    pub(crate) async fn read_headers(&mut self, req: &mut Request) -> Result<()> {
        self.core_mut().decoder = Decoder::new();
        self.drive(req, State::HeadersCompleted).await
    }

    /// Reads the rest of the request: handles `Expect: 100-continue`, then
    /// streams the body into the installed consumer until completion.
    pub async fn read(&mut self, req: &mut Request) -> Result<()> {
        if req.state() == State::Completed {
            return Ok(());
        }
        self.core_mut().can_write_error = true;
        if req.header("Expect") == Some("100-continue") {
            if let BodyFraming::Length(len) = req.content_length() {
                if len > req.max_body_size() {
                    return Err(Error::ExpectationFailed);
                }
            }
            self.write(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        }
        self.drive(req, State::Completed).await
    }

    async fn drive(&mut self, req: &mut Request, target: State) -> Result<()> {
        loop {
            if req.state() >= target {
                return Ok(());
            }

            // parse bytes carried over from a previous fill first
            let peer = self.core().peer;
            {
                let core = self.core_mut();
                if !core.carry.is_empty() {
                    let consumed = core
                        .decoder
                        .advance(req, core.carry.current())
                        .map_err(|e| log_parse_error(peer, e))?;
                    if consumed > 0 {
                        core.can_write_error = true;
                        core.carry.advance(consumed);
                        core.carry.commit();
                    }
                    if req.state() >= target {
                        return Ok(());
                    }
                }
            }

            let reactor = Arc::clone(&self.core().reactor);
            let n = {
                let mut scratch = reactor.read_scratch();
                scratch.reset();
                self.read_some(scratch.current_mut())?
            };
            if n == 0 {
                self.yield_now().await?;
                continue;
            }

            let scratch = reactor.read_scratch();
            let core = self.core_mut();
            core.can_write_error = true;
            let data = &scratch.current()[..n];
            if core.carry.is_empty() {
                let consumed = core
                    .decoder
                    .advance(req, data)
                    .map_err(|e| log_parse_error(peer, e))?;
                if consumed < n {
                    core.carry.append(&data[consumed..]);
                }
            } else {
                core.carry.append(data);
            }
            drop(scratch);
        }
    }

    /// Writes the whole buffer, yielding whenever the socket backs up.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.write_some(&buf[pos..])?;
            if n == 0 {
                self.yield_now().await?;
                continue;
            }
            pos += n;
        }
        Ok(())
    }

    /// Vectored variant of [`write`](Self::write).
    pub async fn write_vectored(&mut self, bufs: &[&[u8]]) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut written = 0;
        while written < total {
            let n = self.write_some_vectored(bufs, written)?;
            if n == 0 {
                self.yield_now().await?;
                continue;
            }
            written += n;
        }
        Ok(())
    }

    /// Serializes and writes `res`, adopting its keep-alive override and
    /// widening the session deadline for large known-length payloads.
    pub async fn write_response(&mut self, res: &Response) -> Result<()> {
        if let Some(keep_alive) = res.keep_alive() {
            self.set_keep_alive(keep_alive);
        }
        if let BodyFraming::Length(len) = res.framing() {
            let needed = Duration::from_secs(10 + len / (512 * 1024));
            if needed > self.session_timeout() {
                self.set_session_timeout(needed);
            }
        }
        let bytes = res.to_bytes(self.keep_alive());
        self.write(&bytes).await
    }

    /// Completes the TLS accept handshake under its deadline; no-op for
    /// plain connections.
    pub(crate) async fn handshake(&mut self) -> Result<()> {
        if let Stream::Tls(t) = self {
            let timeout = t.accept_timeout;
            t.core.shared.set_session_timeout(timeout);
        }
        loop {
            let done = match self {
                Stream::Plain(_) => true,
                Stream::Tls(t) => t.handshake_step()?,
            };
            if done {
                return Ok(());
            }
            self.yield_now().await?;
        }
    }

    /// Orderly connection teardown; errors here are logged and swallowed.
    pub(crate) async fn shutdown(&mut self) {
        if let Stream::Tls(t) = self {
            t.core.shared.set_session_timeout(t.shutdown_timeout);
            if let Err(e) = t.begin_close_notify() {
                log::debug!("{} tls shutdown: {e}", t.core.peer);
            } else {
                for _ in 0..5 {
                    match t.flush_tls() {
                        Ok(()) if !t.wants_write() => break,
                        Ok(()) => {
                            let shared = Arc::clone(&t.core.shared);
                            if YieldNow::new(&shared).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::debug!("{} tls shutdown: {e}", t.core.peer);
                            break;
                        }
                    }
                }
            }
        }
        unsafe { libc::shutdown(self.core().fd, libc::SHUT_RDWR) };
    }
}

fn log_parse_error(peer: SocketAddr, e: Error) -> Error {
    if matches!(e, Error::BadMessage) {
        log::info!("{peer} http parser error");
    }
    e
}

/// Writes one chunked-transfer frame per call and the `0\r\n\r\n`
/// terminator from [`finish`](Self::finish). Wraps a borrowed stream so a
/// handler cannot interleave raw writes mid-chunk.
pub struct ChunkedWriter<'a> {
    stream: &'a mut Stream,
    finished: bool,
}

impl<'a> ChunkedWriter<'a> {
    pub fn new(stream: &'a mut Stream) -> Self {
        Self {
            stream,
            finished: false,
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let header = format!("{:x}\r\n", buf.len());
        self.stream
            .write_vectored(&[header.as_bytes(), buf, b"\r\n"])
            .await
    }

    /// Yields on the wrapped stream, so a handler can wait on a wake-up
    /// mid-body.
    pub async fn yield_now(&mut self) -> Result<()> {
        self.stream.yield_now().await
    }

    /// One chunk whose size is the sum of all pieces.
    pub async fn write_pieces(&mut self, bufs: &[&[u8]]) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Ok(());
        }
        let header = format!("{total:x}\r\n");
        let mut pieces: Vec<&[u8]> = Vec::with_capacity(bufs.len() + 2);
        pieces.push(header.as_bytes());
        pieces.extend_from_slice(bufs);
        pieces.push(b"\r\n");
        self.stream.write_vectored(&pieces).await
    }

    /// Emits the end-of-stream marker. Must be called exactly once.
    pub async fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.stream.write(END_OF_CHUNKED_STREAM).await
    }
}

impl Drop for ChunkedWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::debug!("chunked writer dropped without finish, stream is unterminated");
        }
    }
}

fn socket_buffer_size(fd: libc::c_int, opt: libc::c_int) -> Result<usize> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    // the kernel reports the doubled bookkeeping value
    Ok(value as usize / 2)
}

fn set_socket_buffer_size(fd: libc::c_int, opt: libc::c_int, size: usize) -> Result<()> {
    let value = size as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

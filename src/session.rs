// src/session.rs
//
// A session combines an accepted socket with the future driving its
// request loop. The owning reactor resumes the future on readiness,
// wake-up and timeout; the session's boxed address doubles as the epoll
// and wake-up token.

use crate::error::{Error, Result};
use crate::http::{BodyFraming, Request};
use crate::reactor::Reactor;
use crate::server::Server;
use crate::stream::Stream;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

// Polls granted to a cancelled flow to unwind through its error path
// (error response, TLS close-notify) before the future is discarded.
const CANCEL_POLL_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelKind {
    TimedOut,
    Cancelled,
    PeerClosed,
}

impl CancelKind {
    fn to_error(self) -> Error {
        match self {
            CancelKind::TimedOut => Error::TimedOut,
            CancelKind::Cancelled => Error::Cancelled,
            CancelKind::PeerClosed => Error::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "peer closed connection",
            )),
        }
    }
}

struct TimeoutState {
    duration: Duration,
    deadline: Option<Instant>,
}

/// State shared between the session (read by the reactor) and the stream
/// living inside the session's future.
pub(crate) struct SessionShared {
    timeout: Mutex<TimeoutState>,
    cancel: Mutex<Option<CancelKind>>,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            timeout: Mutex::new(TimeoutState {
                duration: Duration::ZERO,
                deadline: None,
            }),
            cancel: Mutex::new(None),
        }
    }

    pub(crate) fn set_session_timeout(&self, duration: Duration) {
        let mut state = self.timeout.lock().unwrap();
        state.duration = duration;
        state.deadline = (!duration.is_zero()).then(|| Instant::now() + duration);
    }

    pub(crate) fn session_timeout(&self) -> Duration {
        self.timeout.lock().unwrap().duration
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.timeout.lock().unwrap().deadline
    }

    /// Sticky: once set, every subsequent suspension point reports it.
    pub(crate) fn set_cancel(&self, kind: CancelKind) {
        self.cancel.lock().unwrap().get_or_insert(kind);
    }

    pub(crate) fn cancel_kind(&self) -> Option<CancelKind> {
        *self.cancel.lock().unwrap()
    }
}

/// Thread-safe handle that schedules a yielded session for resumption on
/// its reactor. Holds only the session's numeric token, so firing after
/// the session died is tolerated and ignored.
pub struct Wakeupper {
    reactor: Arc<Reactor>,
    token: u64,
}

impl Wakeupper {
    pub(crate) fn new(reactor: Arc<Reactor>, token: u64) -> Self {
        Self { reactor, token }
    }

    pub fn wake_up(&self) {
        self.reactor.wake_token(self.token);
    }
}

impl Wake for Wakeupper {
    fn wake(self: Arc<Self>) {
        self.wake_up();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_up();
    }
}

/// Cooperatively returns to the reactor once; reports any pending
/// cancellation instead of suspending.
pub(crate) struct YieldNow<'a> {
    shared: &'a SessionShared,
    polled: bool,
}

impl<'a> YieldNow<'a> {
    pub(crate) fn new(shared: &'a SessionShared) -> Self {
        Self {
            shared,
            polled: false,
        }
    }
}

impl Future for YieldNow<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(kind) = this.shared.cancel_kind() {
            return Poll::Ready(Err(kind.to_error()));
        }
        if !this.polled {
            this.polled = true;
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

type SessionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct Session {
    sock: libc::c_int,
    peer: SocketAddr,
    order: u32,
    reactor: Arc<Reactor>,
    server: Arc<Server>,
    shared: Arc<SessionShared>,
    fut: Mutex<Option<SessionFuture>>,
    waker: OnceLock<Waker>,
}

impl Session {
    pub(crate) fn sock(&self) -> libc::c_int {
        self.sock
    }

    pub(crate) fn order(&self) -> u32 {
        self.order
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.shared.next_timeout()
    }

    /// Polls the flow once. Returns true when the flow has completed and
    /// the session should be scheduled for deletion. A panicking flow is
    /// discarded instead of taking the reactor thread down.
    pub(crate) fn resume(&self) -> bool {
        let waker = match self.waker.get() {
            Some(waker) => waker.clone(),
            None => return true,
        };
        let mut slot = self.fut.lock().unwrap();
        let Some(fut) = slot.as_mut() else {
            return true;
        };
        let mut cx = Context::from_waker(&waker);
        let poll = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            fut.as_mut().poll(&mut cx)
        }));
        match poll {
            Ok(Poll::Ready(())) => {
                *slot = None;
                true
            }
            Ok(Poll::Pending) => false,
            Err(_) => {
                log::error!("{} session flow panicked, terminating the session", self.peer);
                *slot = None;
                true
            }
        }
    }

    /// Delivers `kind` at the flow's next suspension point and drives the
    /// future to completion.
    pub(crate) fn cancel(&self, kind: CancelKind) {
        self.shared.set_cancel(kind);
        for _ in 0..CANCEL_POLL_LIMIT {
            if self.resume() {
                return;
            }
        }
        log::error!("{} session flow ignored cancellation, discarding it", self.peer);
        *self.fut.lock().unwrap() = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.fut.lock().unwrap().is_some() {
            self.cancel(CancelKind::Cancelled);
        }
        unsafe { libc::close(self.sock) };
        self.server.session_closed(&self.peer);
        log::trace!("{} session destroyed", self.peer);
    }
}

/// Builds a session for an accepted socket and registers it with
/// `reactor`. The boxed session's address becomes its token; the future
/// holding the per-connection flow is installed before registration so
/// the first readiness edge can start it.
pub(crate) fn spawn_session(
    reactor: Arc<Reactor>,
    server: Arc<Server>,
    sock: libc::c_int,
    peer: SocketAddr,
    order: u32,
    secured: bool,
) -> Result<()> {
    let shared = Arc::new(SessionShared::new());
    shared.set_session_timeout(server.headers_timeout());

    let session = Box::new(Session {
        sock,
        peer,
        order,
        reactor: Arc::clone(&reactor),
        server: Arc::clone(&server),
        shared: Arc::clone(&shared),
        fut: Mutex::new(None),
        waker: OnceLock::new(),
    });
    let token = Box::into_raw(session) as u64;
    let session = unsafe { &*(token as *const Session) };

    let wakeupper = Arc::new(Wakeupper::new(Arc::clone(&reactor), token));
    let stream = if secured {
        match server.tls_config() {
            Some(tls) => Stream::tls(
                sock,
                peer,
                Arc::clone(&reactor),
                Arc::clone(&shared),
                Arc::clone(&wakeupper),
                tls,
                server.accept_timeout(),
                server.shutdown_timeout(),
            ),
            None => {
                drop(unsafe { Box::from_raw(token as *mut Session) });
                return Err(Error::Unknown("TLS listener without a TLS context".into()));
            }
        }
    } else {
        Ok(Stream::plain(
            sock,
            peer,
            Arc::clone(&reactor),
            Arc::clone(&shared),
            Arc::clone(&wakeupper),
        ))
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            drop(unsafe { Box::from_raw(token as *mut Session) });
            return Err(e);
        }
    };

    *session.fut.lock().unwrap() = Some(Box::pin(session_flow(stream, Arc::clone(&server))));
    let _ = session.waker.set(Waker::from(wakeupper));

    if let Err(e) = reactor.register_session(token, sock) {
        drop(unsafe { Box::from_raw(token as *mut Session) });
        return Err(e);
    }
    log::trace!("{peer} session registered, order {order}");
    Ok(())
}

/// The per-connection logical flow: TLS accept, then the keep-alive
/// request loop, then a best-effort error response and shutdown.
async fn session_flow(mut stream: Stream, server: Arc<Server>) {
    let peer = stream.peer_address();
    if let Err(e) = stream.handshake().await {
        log::info!("{peer} handshake failed: {e}");
        return;
    }
    stream.set_session_timeout(server.headers_timeout());

    if let Err(e) = run_session(&mut stream, &server).await {
        match &e {
            Error::Status(code) => log::info!("{peer} status code {code}"),
            Error::ErrorResponse(res) => log::info!("{peer} status code {}", res.status()),
            Error::TimedOut | Error::Cancelled => log::info!("{peer} {e}"),
            Error::Io(io) => log::info!("{peer} i/o error: {io}"),
            _ => log::info!("{peer} {e}"),
        }
        if stream.can_write_error() {
            if let Some(res) = e.to_response() {
                // errors always close the connection
                stream.set_keep_alive(Duration::ZERO);
                let _ = stream.write(&res.to_bytes(Duration::ZERO)).await;
            }
        }
    }
    stream.shutdown().await;
}

async fn run_session(stream: &mut Stream, server: &Arc<Server>) -> Result<()> {
    loop {
        let mut req = Request::new();
        stream.read_headers(&mut req).await?;
        stream.set_keep_alive(if req.keep_alive() {
            server.keep_alive_timeout()
        } else {
            Duration::ZERO
        });

        let Some(handler) = server.create_session(&req)? else {
            log::info!(
                "{} no handler for {} {}",
                stream.peer_address(),
                req.method(),
                req.url()
            );
            return Err(Error::NoHandler);
        };

        match req.content_length() {
            BodyFraming::Length(len) => stream.set_session_timeout(Duration::from_secs(
                10 + len / (512 * 1024),
            )),
            // the handler is expected to set a tighter one
            BodyFraming::Chunked => stream.set_session_timeout(Duration::from_secs(5 * 60)),
        }

        handler.call(stream, &mut req).await?;

        stream.set_session_timeout(stream.keep_alive());
        server.count_served_session();
        if stream.keep_alive().is_zero() {
            return Ok(());
        }
    }
}

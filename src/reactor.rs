// src/reactor.rs
//
// A reactor is one event-loop thread owning a bounded set of sessions:
// an epoll handle, an eventfd for external wake-ups, shared read/write
// scratch buffers and the delete-later set. Session tokens are the boxed
// session addresses; the value 1 is reserved for the event fd itself.

use crate::error::{Error, Result};
use crate::session::{CancelKind, Session};
use crate::util::{Buffer, SpinLock};
use std::collections::HashSet;
use std::io;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

const EVENTS_SIZE: usize = 10_000;
const WAKE_TOKEN: u64 = 1;

const SESSION_INTEREST: u32 = (libc::EPOLLIN
    | libc::EPOLLPRI
    | libc::EPOLLOUT
    | libc::EPOLLRDHUP
    | libc::EPOLLERR
    | libc::EPOLLET) as u32;

pub(crate) struct Reactor {
    epfd: libc::c_int,
    event_fd: libc::c_int,
    sessions: Mutex<HashSet<u64>>,
    active_sessions: AtomicUsize,
    delete_later: SpinLock<HashSet<u64>>,
    woken: SpinLock<Vec<u64>>,
    read_scratch: Mutex<Buffer>,
    write_scratch: Mutex<Buffer>,
    workload_balancing: bool,
    quit: AtomicBool,
    loop_thread: OnceLock<ThreadId>,
}

impl Reactor {
    pub(crate) fn new(workload_balancing: bool) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error().into());
        }
        let event_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if event_fd == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, event_fd, &mut event) } == -1 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(event_fd);
                libc::close(epfd);
            }
            return Err(err.into());
        }

        let rmem_max = read_proc_value("/proc/sys/net/core/rmem_max");
        let wmem_max = read_proc_value("/proc/sys/net/core/wmem_max");
        log::trace!("reactor scratch buffers: read {rmem_max}, write {wmem_max}");

        Ok(Self {
            epfd,
            event_fd,
            sessions: Mutex::new(HashSet::new()),
            active_sessions: AtomicUsize::new(0),
            delete_later: SpinLock::new(HashSet::new()),
            woken: SpinLock::new(Vec::new()),
            read_scratch: Mutex::new(Buffer::with_size(rmem_max)),
            write_scratch: Mutex::new(Buffer::with_size(wmem_max)),
            workload_balancing,
            quit: AtomicBool::new(false),
            loop_thread: OnceLock::new(),
        })
    }

    pub(crate) fn start(self: Arc<Self>, index: usize) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("reactor-{index}"))
            .spawn(move || self.run())
    }

    pub(crate) fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Registers a session under its token and arms the full interest
    /// mask, edge-triggered. Callable from any thread.
    pub(crate) fn register_session(&self, token: u64, fd: libc::c_int) -> Result<()> {
        self.sessions.lock().unwrap().insert(token);
        let mut event = libc::epoll_event {
            events: SESSION_INTEREST,
            u64: token,
        };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            let err = io::Error::last_os_error();
            self.sessions.lock().unwrap().remove(&token);
            return Err(err.into());
        }
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Adjusts the interest mask of a registered session.
    #[allow(dead_code)]
    pub(crate) fn update_session(&self, token: u64, fd: libc::c_int, events: u32) -> Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event) } == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn unregister_session(&self, token: u64) {
        if !self.sessions.lock().unwrap().remove(&token) {
            return;
        }
        let session = unsafe { &*(token as *const Session) };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, session.sock(), std::ptr::null_mut()) }
            == -1
        {
            log::debug!("epoll del failed: {}", io::Error::last_os_error());
        }
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Unregisters `token` and queues it for destruction at the end of
    /// the current loop iteration.
    pub(crate) fn delete_later(&self, token: u64) {
        self.unregister_session(token);
        self.delete_later.lock().insert(token);
    }

    /// Wake-up entry point: records the token and signals the event fd.
    /// Safe to call for sessions that no longer exist.
    pub(crate) fn wake_token(&self, token: u64) {
        self.woken.lock().push(token);
        self.write_event_fd(token);
    }

    pub(crate) fn shutdown(&self) {
        self.quit.store(true, Ordering::Release);
        self.write_event_fd(WAKE_TOKEN);
    }

    fn write_event_fd(&self, value: u64) {
        let n = unsafe {
            libc::write(
                self.event_fd,
                &value as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n == -1 {
            log::debug!("event fd write failed: {}", io::Error::last_os_error());
        }
    }

    /// Borrow of the shared read buffer; reactor-thread callers only, for
    /// the duration of a single fill.
    pub(crate) fn read_scratch(&self) -> MutexGuard<'_, Buffer> {
        self.read_scratch.lock().unwrap()
    }

    /// Loan of a write buffer of at least `size` bytes: the shared scratch
    /// when called on the loop thread and it is large enough, otherwise a
    /// private heap buffer.
    pub(crate) fn write_scratch(&self, size: usize) -> WriteScratch<'_> {
        let on_loop_thread = self.loop_thread.get().copied() == Some(thread::current().id());
        if on_loop_thread {
            let guard = self.write_scratch.lock().unwrap();
            if size <= guard.size() {
                return WriteScratch::Shared(guard);
            }
        }
        WriteScratch::Owned(Buffer::with_size(size))
    }

    fn run(&self) {
        let _ = self.loop_thread.set(thread::current().id());
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; EVENTS_SIZE];
        let mut timeout_ms: i32 = -1;

        while !self.quit.load(Ordering::Acquire) {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), EVENTS_SIZE as i32, timeout_ms)
            };
            if n < 0 {
                continue;
            }

            let mut woke = false;
            let mut batch: Vec<(u64, u32)> = Vec::with_capacity(n as usize);
            for event in &events[..n as usize] {
                if event.u64 == WAKE_TOKEN {
                    woke = true;
                } else {
                    batch.push((event.u64, event.events));
                }
            }
            if self.workload_balancing {
                batch.sort_by_key(|(token, _)| unsafe { &*(*token as *const Session) }.order());
            }
            for (token, evs) in batch {
                self.dispatch(token, evs);
            }

            let mut woken_tokens: HashSet<u64> = HashSet::new();
            if woke {
                self.drain_event_fd();
                woken_tokens.extend(mem::take(&mut *self.woken.lock()));
            }

            // Snapshot under the lock, release it, then wake and check
            // deadlines; the acceptor may insert new sessions meanwhile.
            let snapshot: Vec<u64> = self.sessions.lock().unwrap().iter().copied().collect();
            let now = Instant::now();
            timeout_ms = -1;
            for token in snapshot {
                let session = unsafe { &*(token as *const Session) };
                if woken_tokens.contains(&token) && session.resume() {
                    self.delete_later(token);
                    continue;
                }
                match session.next_timeout() {
                    None => {}
                    Some(deadline) if deadline <= now => {
                        session.cancel(CancelKind::TimedOut);
                        self.delete_later(token);
                    }
                    Some(deadline) => {
                        // round up so a deadline never fires early
                        let wait = deadline - now + std::time::Duration::from_millis(50);
                        let wait_ms = i32::try_from(wait.as_millis().max(1000)).unwrap_or(i32::MAX);
                        timeout_ms = if timeout_ms == -1 {
                            wait_ms
                        } else {
                            timeout_ms.min(wait_ms)
                        };
                    }
                }
            }

            self.drain_delete_later();
        }
    }

    fn dispatch(&self, token: u64, evs: u32) {
        if !self.sessions.lock().unwrap().contains(&token) {
            return;
        }
        let session = unsafe { &*(token as *const Session) };
        let hup = (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
        let ready = (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLOUT) as u32;
        if evs & hup != 0 {
            session.cancel(CancelKind::PeerClosed);
            self.delete_later(token);
        } else if evs & ready != 0 {
            if session.resume() {
                self.delete_later(token);
            }
        } else {
            log::warn!("unhandled epoll events {evs:#x}");
            self.delete_later(token);
        }
    }

    fn drain_event_fd(&self) {
        let mut value: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.event_fd,
                    &mut value as *mut u64 as *mut libc::c_void,
                    mem::size_of::<u64>(),
                )
            };
            if n != mem::size_of::<u64>() as isize {
                break;
            }
        }
    }

    fn drain_delete_later(&self) {
        let doomed = mem::take(&mut *self.delete_later.lock());
        for token in doomed {
            drop(unsafe { Box::from_raw(token as *mut Session) });
        }
    }

    /// Destroys every remaining session. Called after the loop thread has
    /// been joined.
    pub(crate) fn drain_sessions(&self) {
        let tokens: Vec<u64> = mem::take(&mut *self.sessions.lock().unwrap())
            .into_iter()
            .collect();
        for token in tokens {
            self.active_sessions.fetch_sub(1, Ordering::Relaxed);
            drop(unsafe { Box::from_raw(token as *mut Session) });
        }
        self.drain_delete_later();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.drain_sessions();
        unsafe {
            libc::close(self.event_fd);
            libc::close(self.epfd);
        }
    }
}

pub(crate) enum WriteScratch<'a> {
    Shared(MutexGuard<'a, Buffer>),
    Owned(Buffer),
}

impl Deref for WriteScratch<'_> {
    type Target = Buffer;
    fn deref(&self) -> &Buffer {
        match self {
            WriteScratch::Shared(guard) => guard,
            WriteScratch::Owned(buf) => buf,
        }
    }
}

impl DerefMut for WriteScratch<'_> {
    fn deref_mut(&mut self) -> &mut Buffer {
        match self {
            WriteScratch::Shared(guard) => guard,
            WriteScratch::Owned(buf) => buf,
        }
    }
}

fn read_proc_value(path: &str) -> usize {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(4 * 1024 * 1024)
}

// src/server/mod.rs
//
// The process-wide server object: listening sockets, the reactor pool,
// the plugin registry, per-peer connection accounting and the accept
// loop. Built exactly once before accepting starts, torn down exactly
// once after the loops stop.

mod status;

use crate::config::{build_tls_config, Config};
use crate::error::{Error, Result};
use crate::http::Request;
use crate::plugin::{Handler, Plugin};
use crate::reactor::Reactor;
use crate::session::spawn_session;
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Process-wide shutdown request, flipped by SIGINT/SIGTERM.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn exit_signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, exit_signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, exit_signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Uptime origin and request counters, shared with the built-in status
/// plugin.
pub(crate) struct Stats {
    start: Instant,
    peak_sessions: AtomicUsize,
    served_sessions: AtomicU64,
    reactors: Vec<Arc<Reactor>>,
}

impl Stats {
    pub(crate) fn active_sessions(&self) -> usize {
        self.reactors.iter().map(|r| r.active_sessions()).sum()
    }

    pub(crate) fn peak_sessions(&self) -> usize {
        self.peak_sessions.load(Ordering::Relaxed)
    }

    pub(crate) fn served_sessions(&self) -> u64 {
        self.served_sessions.load(Ordering::Relaxed)
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.start.elapsed()
    }
}

pub struct ServerBuilder {
    config: Config,
    conf_dir: PathBuf,
    workers: usize,
    user: Option<String>,
    group: Option<String>,
    plugins: Vec<Plugin>,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            conf_dir: PathBuf::new(),
            workers: default_workers(),
            user: None,
            group: None,
            plugins: Vec::new(),
        }
    }

    /// Directory passed to plugin init hooks (and used to resolve
    /// relative TLS certificate paths).
    pub fn conf_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.conf_dir = dir.into();
        self
    }

    /// Number of reactor threads.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// User to drop privileges to after binding, overriding the
    /// configuration file.
    pub fn drop_to_user(mut self, user: Option<String>, group: Option<String>) -> Self {
        self.user = user;
        self.group = group;
        self
    }

    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn build(mut self) -> Result<Arc<Server>> {
        if self.config.http_port < 0 && !self.config.https.enabled {
            return Err(Error::Unknown(
                "no HTTP nor HTTPS ports specified".into(),
            ));
        }

        let tls = if self.config.https.enabled {
            Some(build_tls_config(&self.config.https.ssl, &self.conf_dir)?)
        } else {
            None
        };

        let mut reactors = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            reactors.push(Arc::new(Reactor::new(self.config.workload_balancing)?));
        }
        log::info!("using {} worker threads", self.workers);

        let stats = Arc::new(Stats {
            start: Instant::now(),
            peak_sessions: AtomicUsize::new(0),
            served_sessions: AtomicU64::new(0),
            reactors: reactors.clone(),
        });

        if self.config.server_status {
            self.plugins.push(status::server_status_plugin(Arc::clone(&stats)));
        }

        let mut plugins = Vec::with_capacity(self.plugins.len());
        for plugin in self.plugins {
            if plugin.init(&self.conf_dir) {
                log::info!("plugin {} ready, order {}", plugin.name(), plugin.order());
                plugins.push(plugin);
            } else {
                log::error!("plugin {} failed to initialize, dropping it", plugin.name());
            }
        }
        // stable: equal orders keep registration order
        plugins.sort_by_key(Plugin::order);

        Ok(Arc::new(Server {
            config: self.config,
            user: self.user,
            group: self.group,
            plugins,
            reactors,
            stats,
            tls,
            connections_per_ip: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }))
    }
}

pub struct Server {
    config: Config,
    user: Option<String>,
    group: Option<String>,
    plugins: Vec<Plugin>,
    reactors: Vec<Arc<Reactor>>,
    stats: Arc<Stats>,
    tls: Option<Arc<rustls::ServerConfig>>,
    connections_per_ip: Mutex<HashMap<IpAddr, u32>>,
    shutdown: AtomicBool,
}

struct Listener {
    socket: Socket,
    tls: bool,
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Binds the listening sockets and runs the accept loop until a
    /// shutdown is requested, then tears everything down.
    pub fn run(self: Arc<Self>) -> Result<()> {
        install_signal_handlers();

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error().into());
        }
        let result = accept_loop(&self, epfd);
        unsafe { libc::close(epfd) };
        self.teardown();
        result
    }

    /// Asks the accept loop and the reactors to stop.
    pub fn shutdown(&self) {
        log::info!("shutting down the server");
        self.shutdown.store(true, Ordering::Release);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) || SHUTDOWN.load(Ordering::Acquire)
    }

    fn teardown(&self) {
        for plugin in &self.plugins {
            plugin.destroy();
        }
    }

    fn drop_privileges(&self) -> Result<()> {
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            return Ok(());
        }
        let privileges = &self.config.privileges;
        let user = match (&self.user, privileges.drop) {
            (Some(user), _) => user.clone(),
            (None, true) => privileges.user.clone(),
            (None, false) => return Ok(()),
        };
        if user.is_empty() {
            return Err(Error::Unknown("no user to drop privileges to".into()));
        }
        let (uid, mut gid) = resolve_user(&user)
            .ok_or_else(|| Error::Unknown(format!("can't find user {user:?}")))?;
        let group = self.group.clone().unwrap_or_else(|| privileges.group.clone());
        if !group.is_empty() {
            gid = resolve_group(&group)
                .ok_or_else(|| Error::Unknown(format!("can't find group {group:?}")))?;
        }
        if unsafe { libc::setgid(gid) } != 0 || unsafe { libc::setuid(uid) } != 0 {
            return Err(Error::Unknown("can't drop privileges".into()));
        }
        log::info!("dropped privileges to {user}");
        Ok(())
    }

    /// First plugin (in order) whose probe claims the request wins. A
    /// probe error (e.g. a router 405) aborts the scan.
    pub(crate) fn create_session(&self, req: &Request) -> Result<Option<Handler>> {
        for plugin in &self.plugins {
            if let Some(handler) = plugin.create_session(req)? {
                return Ok(Some(handler));
            }
        }
        Ok(None)
    }

    pub(crate) fn session_closed(&self, peer: &SocketAddr) {
        let mut counts = self.connections_per_ip.lock().unwrap();
        match counts.get_mut(&peer.ip()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(&peer.ip());
            }
            None => log::debug!("{peer} closed with no per-ip accounting entry"),
        }
    }

    pub(crate) fn count_served_session(&self) {
        self.stats.served_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tls_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.tls.clone()
    }

    pub(crate) fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.config.keepalive_timeout)
    }

    pub(crate) fn headers_timeout(&self) -> Duration {
        Duration::from_secs(self.config.headers_timeout)
    }

    pub(crate) fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.config.accept_timeout)
    }

    pub(crate) fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.config.shutdown_timeout)
    }

    pub fn active_sessions(&self) -> usize {
        self.stats.active_sessions()
    }

    pub fn peak_sessions(&self) -> usize {
        self.stats.peak_sessions()
    }

    pub fn served_sessions(&self) -> u64 {
        self.stats.served_sessions()
    }

    pub fn uptime(&self) -> Duration {
        self.stats.uptime()
    }
}

fn accept_loop(server: &Arc<Server>, epfd: libc::c_int) -> Result<()> {
    let backlog = server.config.queued_connections;
    let mut listeners: Vec<Listener> = Vec::new();

    if server.config.http_port >= 0 {
        let port = server.config.http_port as u16;
        for socket in bind_both(port, backlog)? {
            listeners.push(Listener { socket, tls: false });
        }
        log::info!("listening on :{port}");
    }
    if server.tls.is_some() && server.config.https.port >= 0 {
        let port = server.config.https.port as u16;
        for socket in bind_both(port, backlog)? {
            listeners.push(Listener { socket, tls: true });
        }
        log::info!("listening on :{port} (tls)");
    }
    if listeners.is_empty() {
        return Err(Error::Unknown("no listening sockets".into()));
    }
    for listener in &listeners {
        let fd = listener.socket.as_raw_fd();
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error().into());
        }
    }

    server.drop_privileges()?;

    let mut threads: Vec<JoinHandle<()>> = Vec::new();
    for (index, reactor) in server.reactors.iter().enumerate() {
        threads.push(Arc::clone(reactor).start(index).map_err(Error::Io)?);
    }
    log::info!("using {} queued connections", backlog);

    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 64];
    while !server.shutdown_requested() {
        let n = unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, 1000) };
        if n < 0 {
            continue;
        }

        let active = server.stats.active_sessions();
        server.stats.peak_sessions.fetch_max(active, Ordering::Relaxed);

        for event in &events[..n as usize] {
            let evs = event.events;
            if evs & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                return Err(Error::Unknown("listen socket error".into()));
            }
            if evs & (libc::EPOLLIN | libc::EPOLLPRI) as u32 == 0 {
                continue;
            }
            let token = event.u64;
            let Some(listener) = listeners
                .iter()
                .find(|l| l.socket.as_raw_fd() as u64 == token)
            else {
                continue;
            };
            accept_pending(server, listener);
        }
    }

    for reactor in &server.reactors {
        reactor.shutdown();
    }
    for thread in threads {
        let _ = thread.join();
    }
    for reactor in &server.reactors {
        reactor.drain_sessions();
    }
    Ok(())
}

/// Edge-triggered accept: drain the backlog until it would block.
fn accept_pending(server: &Arc<Server>, listener: &Listener) {
    loop {
        if server.shutdown_requested() {
            return;
        }
        let (socket, addr) = match listener.socket.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("accept failed: {e}");
                return;
            }
        };
        let Some(peer) = addr.as_socket() else {
            continue;
        };

        let order = {
            let mut counts = server.connections_per_ip.lock().unwrap();
            let count = counts.entry(peer.ip()).or_insert(0);
            if *count >= server.config.max_connections_per_ip {
                log::debug!("{peer} rejected, per-ip connection cap reached");
                continue;
            }
            let order = *count;
            *count += 1;
            order
        };

        if let Err(e) = socket
            .set_nonblocking(true)
            .and_then(|_| socket.set_tcp_nodelay(true))
        {
            log::warn!("{peer} socket setup failed: {e}");
            server.session_closed(&peer);
            continue;
        }

        // place the session on the least loaded reactor
        let reactor = server
            .reactors
            .iter()
            .min_by_key(|r| r.active_sessions())
            .expect("at least one reactor");

        let fd = socket.into_raw_fd();
        if let Err(e) = spawn_session(
            Arc::clone(reactor),
            Arc::clone(server),
            fd,
            peer,
            order,
            listener.tls,
        ) {
            log::warn!("{peer} can't create session: {e}");
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

/// Binds the IPv4 socket and, when the host supports it, the v6-only
/// IPv6 socket for `port`.
fn bind_both(port: u16, backlog: u32) -> Result<Vec<Socket>> {
    let mut sockets = vec![bind_listener(Domain::IPV4, port, backlog)?];
    match bind_listener(Domain::IPV6, port, backlog) {
        Ok(socket) => sockets.push(socket),
        Err(e) => log::warn!("ipv6 bind on :{port} failed: {e}"),
    }
    Ok(sockets)
}

fn bind_listener(domain: Domain, port: u16, backlog: u32) -> Result<Socket> {
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = if domain == Domain::IPV6 {
        socket.set_only_v6(true)?;
        (std::net::Ipv6Addr::UNSPECIFIED, port).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, port).into()
    };
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn resolve_user(name: &str) -> Option<(libc::uid_t, libc::gid_t)> {
    let name = CString::new(name).ok()?;
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    unsafe { Some(((*pw).pw_uid, (*pw).pw_gid)) }
}

fn resolve_group(name: &str) -> Option<libc::gid_t> {
    let name = CString::new(name).ok()?;
    let gr = unsafe { libc::getgrnam(name.as_ptr()) };
    if gr.is_null() {
        return None;
    }
    unsafe { Some((*gr).gr_gid) }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("plugins", &self.plugins.len())
            .field("reactors", &self.reactors.len())
            .finish()
    }
}

//! The server supervisor: topology selection, worker spawning,
//! load-balanced accept dispatch, and the graceful shutdown sequence.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::balancer::{Balancer, WorkerHandle};
use crate::config::{Config, MAX_TCP_BUFFER_CAP};
use crate::connection::Conn;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::handler::EventHandler;
use crate::metrics;
use crate::poller::Poller;
use crate::socket::{Listener, set_keep_alive, sockaddr_to_socket_addr};

/// Shared supervisor state. Handlers receive `&Server` in their boot and
/// shutdown hooks; embedders reach it through [`ServerHandle::server`].
pub struct Server {
    config: Config,
    handler: Arc<dyn EventHandler>,
    /// Set once during startup, before the first accept.
    balancer: OnceLock<Balancer>,
    /// The shared listener in reactor mode; reuseport workers own theirs.
    listener: Option<Arc<Listener>>,
    main_poller: OnceLock<Arc<Poller>>,
    shutdown_flag: Mutex<bool>,
    shutdown_cond: Condvar,
    shutdown_once: AtomicBool,
    in_shutdown: AtomicBool,
    local_addr: SocketAddr,
}

impl Server {
    /// The address the server is listening on, with any ephemeral port
    /// resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of event-loop workers (the main reactor not included).
    pub fn num_event_loops(&self) -> usize {
        self.balancer.get().map_or(0, |b| b.len())
    }

    /// Currently open connections across all workers.
    pub fn count_connections(&self) -> i32 {
        self.balancer.get().map_or(0, |b| {
            b.iter().map(|w| w.conn_count.load(Ordering::Acquire)).sum()
        })
    }

    /// Whether the shutdown sequence has fully completed.
    pub fn is_in_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.handler)
    }

    /// First shutdown request wins; later calls are no-ops.
    pub(crate) fn signal_shutdown(&self) {
        if !self.shutdown_once.swap(true, Ordering::AcqRel) {
            let mut flag = self
                .shutdown_flag
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *flag = true;
            self.shutdown_cond.notify_all();
        }
    }

    fn wait_for_shutdown(&self) {
        let mut flag = self
            .shutdown_flag
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while !*flag {
            flag = self
                .shutdown_cond
                .wait(flag)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Main-reactor accept: take one connection off the listener and hand
    /// it to the balancer's pick as an urgent registration task.
    pub(crate) fn accept_and_dispatch(&self, listener_fd: RawFd) -> Result<(), Error> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addr_len =
            std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                listener_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            error!("accept on main reactor failed: {err}");
            return Err(Error::AcceptSocket);
        }

        let keep_alive = self.config.tcp_keep_alive.as_secs();
        if keep_alive > 0
            && let Err(err) = set_keep_alive(fd, keep_alive)
        {
            warn!("set keep-alive on fd {fd} failed: {err}");
        }

        let remote = sockaddr_to_socket_addr(&storage)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        let Some(balancer) = self.balancer.get() else {
            unsafe {
                libc::close(fd);
            }
            return Ok(());
        };
        let worker = balancer.next(&remote);
        let conn = Conn::new(fd, self.local_addr, remote, Arc::clone(&worker.poller));
        metrics::CONNECTIONS_ACCEPTED.increment();

        if let Err(err) = worker
            .poller
            .add_urgent_task(Box::new(move |el| el.register(conn)))
        {
            warn!(
                "waking event-loop({}) for fd {fd} failed: {err}",
                worker.index
            );
        }
        Ok(())
    }
}

/// Handle returned by [`run`]. Dropping it leaves the server running;
/// use [`stop`](ServerHandle::stop) or [`wait`](ServerHandle::wait).
pub struct ServerHandle {
    server: Arc<Server>,
    supervisor: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Request graceful shutdown and wait for it to complete, polling on
    /// a one-second ticker up to `timeout`.
    ///
    /// Returns [`Error::ServerInShutdown`] when the server has already
    /// shut down, and a timed-out I/O error when the deadline passes
    /// first (workers keep winding down in the background).
    pub fn stop(&self, timeout: Duration) -> Result<(), Error> {
        if self.server.is_in_shutdown() {
            return Err(Error::ServerInShutdown);
        }
        self.server.signal_shutdown();

        let deadline = Instant::now() + timeout;
        loop {
            if self.server.is_in_shutdown() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Io(io::ErrorKind::TimedOut.into()));
            }
            thread::sleep(Duration::from_secs(1).min(deadline - now));
        }
    }

    /// Block until the shutdown sequence has fully completed.
    pub fn wait(mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
    }
}

/// Start a server on `addr` and return a handle to it.
///
/// The topology comes from `config`: one SO_REUSEPORT listener per worker
/// when `reuse_port` is set, otherwise a main reactor that accepts and
/// fans connections out to sub-workers.
pub fn run<H: EventHandler>(
    handler: H,
    addr: &str,
    mut config: Config,
) -> Result<ServerHandle, Error> {
    config.validate()?;
    // Fixed in this revision.
    config.read_buffer_cap = MAX_TCP_BUFFER_CAP;
    config.write_buffer_cap = MAX_TCP_BUFFER_CAP;

    let addr = resolve_ipv4(addr)?;
    let listener = Listener::bind(addr, &config)?;
    let local_addr = listener.local_addr();

    let num_event_loop = if config.num_event_loop > 0 {
        config.num_event_loop
    } else if config.multicore {
        num_cpus()
    } else {
        1
    };

    let reuse_port = config.reuse_port;
    let (shared_listener, worker_listener) = if reuse_port {
        (None, Some(listener))
    } else {
        (Some(Arc::new(listener)), None)
    };

    let server = Arc::new(Server {
        config,
        handler: Arc::new(handler),
        balancer: OnceLock::new(),
        listener: shared_listener,
        main_poller: OnceLock::new(),
        shutdown_flag: Mutex::new(false),
        shutdown_cond: Condvar::new(),
        shutdown_once: AtomicBool::new(false),
        in_shutdown: AtomicBool::new(false),
        local_addr,
    });

    if let Err(err) = server.handler().on_boot(&server) {
        error!("server on_boot error: {err}");
        return Err(err);
    }

    let (workers, main_worker) = match worker_listener {
        Some(listener) => (
            activate_event_loops(&server, listener, num_event_loop)?,
            None,
        ),
        None => {
            let (workers, main_worker) = activate_reactors(&server, num_event_loop)?;
            (workers, Some(main_worker))
        }
    };

    let supervisor = {
        let server = Arc::clone(&server);
        thread::Builder::new()
            .name("eventline-supervisor".to_string())
            .spawn(move || stop_sequence(&server, workers, main_worker))
    };
    let supervisor = match supervisor {
        Ok(handle) => handle,
        Err(err) => {
            // No supervisor means nobody will ever tear the workers down;
            // poison them now and give up.
            server.signal_shutdown();
            poison_workers(&server);
            return Err(Error::Io(err));
        }
    };

    Ok(ServerHandle {
        server,
        supervisor: Some(supervisor),
    })
}

/// Reuseport topology: every worker owns a listener and accepts for
/// itself.
fn activate_event_loops(
    server: &Arc<Server>,
    first_listener: Listener,
    num_event_loop: usize,
) -> Result<Vec<JoinHandle<()>>, Error> {
    let mut balancer = Balancer::new(server.config.lb);
    let mut loops: Vec<EventLoop> = Vec::with_capacity(num_event_loop);
    let mut first = Some(first_listener);

    for i in 0..num_event_loop {
        let result = (|| {
            let listener = match first.take() {
                Some(l) => l,
                // Bind the resolved address so every worker shares the
                // port the first bind actually got.
                None => Listener::bind(server.local_addr, &server.config)?,
            };
            let poller = Arc::new(Poller::new()?);
            poller.add_read(listener.fd()).map_err(Error::Io)?;
            Ok::<_, Error>((listener, poller))
        })();

        let (listener, poller) = match result {
            Ok(parts) => parts,
            Err(err) => {
                for el in &loops {
                    el.poller.close();
                }
                return Err(err);
            }
        };

        let conn_count = Arc::new(AtomicI32::new(0));
        balancer.register(WorkerHandle {
            index: 0,
            poller: Arc::clone(&poller),
            conn_count: Arc::clone(&conn_count),
        });
        loops.push(EventLoop::new(
            i as i32,
            poller,
            Some(listener),
            Arc::clone(server),
            conn_count,
        ));
    }

    let _ = server.balancer.set(balancer);
    spawn_workers(server, loops, EventLoop::run)
}

/// Reactor topology: sub-workers handle I/O only; one extra main reactor
/// accepts on the shared listener.
fn activate_reactors(
    server: &Arc<Server>,
    num_event_loop: usize,
) -> Result<(Vec<JoinHandle<()>>, JoinHandle<()>), Error> {
    let Some(listener) = server.listener.as_ref() else {
        return Err(Error::Io(io::Error::other("reactor topology has no listener")));
    };

    let mut balancer = Balancer::new(server.config.lb);
    let mut loops: Vec<EventLoop> = Vec::with_capacity(num_event_loop);

    for i in 0..num_event_loop {
        let poller = match Poller::new() {
            Ok(p) => Arc::new(p),
            Err(err) => {
                for el in &loops {
                    el.poller.close();
                }
                return Err(err);
            }
        };
        let conn_count = Arc::new(AtomicI32::new(0));
        balancer.register(WorkerHandle {
            index: 0,
            poller: Arc::clone(&poller),
            conn_count: Arc::clone(&conn_count),
        });
        loops.push(EventLoop::new(
            i as i32,
            poller,
            None,
            Arc::clone(server),
            conn_count,
        ));
    }

    let main_poller = (|| {
        let poller = Arc::new(Poller::new()?);
        poller.add_read(listener.fd()).map_err(Error::Io)?;
        Ok::<_, Error>(poller)
    })();
    let main_poller = match main_poller {
        Ok(p) => p,
        Err(err) => {
            for el in &loops {
                el.poller.close();
            }
            return Err(err);
        }
    };

    let _ = server.balancer.set(balancer);
    let _ = server.main_poller.set(Arc::clone(&main_poller));

    let workers = spawn_workers(server, loops, EventLoop::run_sub_reactor)?;

    let mut main_loop = EventLoop::new(
        -1,
        main_poller,
        None,
        Arc::clone(server),
        Arc::new(AtomicI32::new(0)),
    );
    let pin = server.config.lock_os_thread;
    let main_worker = thread::Builder::new()
        .name("eventline-main-reactor".to_string())
        .spawn(move || {
            if pin {
                pin_to_core(0);
            }
            main_loop.run_main_reactor();
        });
    match main_worker {
        Ok(handle) => Ok((workers, handle)),
        Err(err) => {
            server.signal_shutdown();
            poison_workers(server);
            Err(Error::Io(err))
        }
    }
}

fn spawn_workers(
    server: &Arc<Server>,
    loops: Vec<EventLoop>,
    worker_fn: fn(&mut EventLoop),
) -> Result<Vec<JoinHandle<()>>, Error> {
    let pin = server.config.lock_os_thread;
    let cpus = num_cpus();
    let mut handles = Vec::with_capacity(loops.len());

    for (i, mut el) in loops.into_iter().enumerate() {
        let spawned = thread::Builder::new()
            .name(format!("eventline-worker-{i}"))
            .spawn(move || {
                if pin {
                    pin_to_core(i % cpus);
                }
                worker_fn(&mut el);
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                server.signal_shutdown();
                poison_workers(server);
                return Err(Error::Io(err));
            }
        }
    }
    Ok(handles)
}

fn poison_workers(server: &Server) {
    if let Some(balancer) = server.balancer.get() {
        for worker in balancer.iter() {
            if let Err(err) = worker
                .poller
                .add_urgent_task(Box::new(|_| Err(Error::ServerShutdown)))
            {
                warn!(
                    "failed to deliver shutdown task to event-loop({}): {err}",
                    worker.index
                );
            }
        }
    }
}

/// The supervisor thread: parks until a shutdown is signalled, then tears
/// everything down in order.
fn stop_sequence(
    server: &Arc<Server>,
    workers: Vec<JoinHandle<()>>,
    main_worker: Option<JoinHandle<()>>,
) {
    server.wait_for_shutdown();

    server.handler().on_shutdown(server);

    poison_workers(server);

    // The reactor topology also has a listener and a main reactor of its
    // own to unwind.
    if let Some(listener) = &server.listener {
        listener.close();
    }
    if let Some(main_poller) = server.main_poller.get()
        && let Err(err) =
            main_poller.add_urgent_task(Box::new(|_| Err(Error::ServerShutdown)))
    {
        warn!("failed to deliver shutdown task to main reactor: {err}");
    }

    for handle in workers {
        let _ = handle.join();
    }
    if let Some(handle) = main_worker {
        let _ = handle.join();
    }

    if let Some(balancer) = server.balancer.get() {
        for worker in balancer.iter() {
            worker.poller.close();
        }
    }
    if let Some(main_poller) = server.main_poller.get() {
        main_poller.close();
    }

    server.in_shutdown.store(true, Ordering::Release);
}

fn resolve_ipv4(addr: &str) -> Result<SocketAddr, Error> {
    let mut addrs = addr.to_socket_addrs().map_err(Error::Io)?;
    addrs.find(|a| a.is_ipv4()).ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no IPv4 address to listen on",
        ))
    })
}

fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(
                "pinning to core {core} failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigBuilder, Lb};
    use crate::handler::Action;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    impl EventHandler for Echo {
        fn on_open(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            (Some(b"ack\n".to_vec()), Action::None)
        }

        fn on_traffic(&self, conn: &mut Conn) -> Action {
            let mut buf = [0u8; 4096];
            while let Ok(n) = conn.read(&mut buf) {
                if conn.write(&buf[..n]).is_err() {
                    return Action::Close;
                }
            }
            Action::None
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        cond()
    }

    #[test]
    fn echo_round_trip() {
        let handle = run(Echo, "127.0.0.1:0", Config::default()).unwrap();
        let server = handle.server();

        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(b"hello\n").unwrap();

        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ack\nhello\n");

        assert_eq!(server.count_connections(), 1);
        drop(stream);
        assert!(wait_until(Duration::from_secs(5), || {
            server.count_connections() == 0
        }));

        handle.stop(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn reuseport_topology_echoes() {
        let config = ConfigBuilder::new()
            .reuse_port(true)
            .num_event_loop(2)
            .build()
            .unwrap();
        let handle = run(Echo, "127.0.0.1:0", config).unwrap();
        assert_eq!(handle.server().num_event_loops(), 2);

        for _ in 0..4 {
            let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ack\nping");
        }

        handle.stop(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn stop_is_once_only() {
        struct Noop;
        impl EventHandler for Noop {}

        let handle = run(Noop, "127.0.0.1:0", Config::default()).unwrap();
        handle.stop(Duration::from_secs(10)).unwrap();
        assert!(matches!(
            handle.stop(Duration::from_secs(1)),
            Err(Error::ServerInShutdown)
        ));
    }

    #[test]
    fn close_directive_flushes_and_fires_on_close_once() {
        struct CloseOnTraffic {
            closes: Arc<AtomicUsize>,
            close_errors: Arc<AtomicUsize>,
        }

        impl EventHandler for CloseOnTraffic {
            fn on_traffic(&self, conn: &mut Conn) -> Action {
                let mut buf = [0u8; 128];
                while conn.read(&mut buf).is_ok() {}
                let _ = conn.write(b"bye");
                Action::Close
            }

            fn on_close(&self, _conn: &mut Conn, err: Option<&io::Error>) {
                self.closes.fetch_add(1, Ordering::AcqRel);
                if err.is_some() {
                    self.close_errors.fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        let closes = Arc::new(AtomicUsize::new(0));
        let close_errors = Arc::new(AtomicUsize::new(0));
        let handler = CloseOnTraffic {
            closes: Arc::clone(&closes),
            close_errors: Arc::clone(&close_errors),
        };

        let handle = run(handler, "127.0.0.1:0", Config::default()).unwrap();
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(b"anything").unwrap();

        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");

        assert!(wait_until(Duration::from_secs(5), || {
            closes.load(Ordering::Acquire) == 1
        }));
        assert_eq!(close_errors.load(Ordering::Acquire), 0);

        handle.stop(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn shutdown_directive_stops_the_server() {
        struct ShutdownOnTraffic;
        impl EventHandler for ShutdownOnTraffic {
            fn on_traffic(&self, _conn: &mut Conn) -> Action {
                Action::Shutdown
            }
        }

        let handle = run(ShutdownOnTraffic, "127.0.0.1:0", Config::default()).unwrap();
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        stream.write_all(b"x").unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            handle.server().is_in_shutdown()
        }));
        assert!(matches!(
            handle.stop(Duration::from_secs(1)),
            Err(Error::ServerInShutdown)
        ));
        handle.wait();
    }

    #[test]
    fn backpressure_preserves_byte_order() {
        const BLOCK: usize = 64 * 1024;
        const BLOCKS: usize = 160;

        struct Blaster;
        impl EventHandler for Blaster {
            fn on_open(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
                for block in 0..BLOCKS {
                    let chunk = vec![block as u8; BLOCK];
                    if conn.write(&chunk).is_err() {
                        return (None, Action::Close);
                    }
                }
                (None, Action::None)
            }
        }

        let handle = run(Blaster, "127.0.0.1:0", Config::default()).unwrap();
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        // Let the server run into the socket's send buffer before the
        // first byte is consumed.
        thread::sleep(Duration::from_millis(300));

        let mut total = 0usize;
        let mut buf = vec![0u8; BLOCK];
        while total < BLOCK * BLOCKS {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "stream ended early at {total} bytes");
            for (i, &byte) in buf[..n].iter().enumerate() {
                let expected = ((total + i) / BLOCK) as u8;
                assert_eq!(byte, expected, "corrupt byte at offset {}", total + i);
            }
            total += n;
        }
        assert_eq!(total, BLOCK * BLOCKS);

        drop(stream);
        handle.stop(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn least_connections_config_serves() {
        let config = ConfigBuilder::new()
            .num_event_loop(2)
            .load_balancing(Lb::LeastConnections)
            .build()
            .unwrap();
        let handle = run(Echo, "127.0.0.1:0", config).unwrap();

        let mut streams: Vec<TcpStream> = (0..4)
            .map(|_| TcpStream::connect(handle.local_addr()).unwrap())
            .collect();
        for stream in &mut streams {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ack\n");
        }
        assert!(wait_until(Duration::from_secs(5), || {
            handle.server().count_connections() == 4
        }));

        drop(streams);
        handle.stop(Duration::from_secs(10)).unwrap();
    }
}

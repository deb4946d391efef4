//! The per-worker event loop.
//!
//! A worker owns its poller, its FD→connection map, and one shared read
//! slab; nothing here is touched from another thread except through the
//! poller's task queues. Three loop flavours share the same connection
//! state machine: `run` (reuseport: accept + I/O on one thread),
//! `run_sub_reactor` (I/O only), and `run_main_reactor` (accept only).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Buf;
use log::{debug, error, warn};

use crate::connection::Conn;
use crate::error::Error;
use crate::handler::{Action, EventHandler};
use crate::metrics;
use crate::poller::{IN_EVENTS, OUT_EVENTS, PollEvent, Poller};
use crate::server::Server;
use crate::socket::{Listener, set_keep_alive, sockaddr_to_socket_addr};

pub(crate) struct EventLoop {
    /// Position in the balancer's worker list; -1 for the main reactor.
    index: i32,
    pub(crate) poller: Arc<Poller>,
    /// Owned listener in reuseport mode; the reactor topology keeps the
    /// listener on the supervisor instead.
    listener: Option<Listener>,
    /// Shared read slab, loaned to one connection at a time.
    read_buf: Vec<u8>,
    connections: HashMap<RawFd, Conn>,
    /// Shared with the load balancer for least-connections selection.
    conn_count: Arc<AtomicI32>,
    server: Arc<Server>,
    handler: Arc<dyn EventHandler>,
}

impl EventLoop {
    pub(crate) fn new(
        index: i32,
        poller: Arc<Poller>,
        listener: Option<Listener>,
        server: Arc<Server>,
        conn_count: Arc<AtomicI32>,
    ) -> Self {
        let handler = server.handler();
        let read_buffer_cap = server.config().read_buffer_cap;
        EventLoop {
            index,
            poller,
            listener,
            read_buf: vec![0; read_buffer_cap],
            connections: HashMap::new(),
            conn_count,
            server,
            handler,
        }
    }

    /// Reuseport worker: the kernel spreads connections across the
    /// per-worker listeners, so this loop both accepts and handles I/O.
    pub(crate) fn run(&mut self) {
        let poller = Arc::clone(&self.poller);
        let result = poller.polling(|event| match event {
            PollEvent::Io { fd, events } => {
                if self.connections.contains_key(&fd) {
                    self.handle_conn_event(fd, events)
                } else {
                    self.accept(fd)
                }
            }
            PollEvent::Task(task) => task(self),
        });

        self.log_exit(result);
        self.close_all_connections();
        if let Some(listener) = &self.listener {
            listener.close();
        }
        self.server.signal_shutdown();
    }

    /// Sub-reactor: connections arrive as registration tasks from the
    /// main reactor; readiness on anything not in the map is ignored.
    pub(crate) fn run_sub_reactor(&mut self) {
        let poller = Arc::clone(&self.poller);
        let result = poller.polling(|event| match event {
            PollEvent::Io { fd, events } => {
                if self.connections.contains_key(&fd) {
                    self.handle_conn_event(fd, events)
                } else {
                    Ok(())
                }
            }
            PollEvent::Task(task) => task(self),
        });

        self.log_exit(result);
        self.close_all_connections();
        self.server.signal_shutdown();
    }

    /// Main reactor: every readiness event is the listener; accept and
    /// dispatch to a sub-worker.
    pub(crate) fn run_main_reactor(&mut self) {
        let poller = Arc::clone(&self.poller);
        let server = Arc::clone(&self.server);
        let result = poller.polling(|event| match event {
            PollEvent::Io { fd, .. } => server.accept_and_dispatch(fd),
            PollEvent::Task(task) => task(self),
        });

        self.log_exit(result);
        self.server.signal_shutdown();
    }

    fn log_exit(&self, result: Result<(), Error>) {
        match result {
            Err(Error::ServerShutdown) => {
                debug!("event-loop({}) exiting for shutdown", self.index)
            }
            Err(err) => error!("event-loop({}) exiting due to error: {err}", self.index),
            Ok(()) => {}
        }
    }

    /// Dispatch readiness for a registered connection.
    ///
    /// Writability is always handled before readability. When a peer
    /// resets a connection that still has buffered output, the error
    /// event arrives alongside readability; flushing first is the only
    /// ordering that gets those bytes out before the close path runs.
    /// Do not reorder.
    fn handle_conn_event(&mut self, fd: RawFd, events: u32) -> Result<(), Error> {
        if events & OUT_EVENTS != 0 {
            let pending = self
                .connections
                .get(&fd)
                .is_some_and(|c| !c.send_buffer.is_empty());
            if pending {
                self.write(fd)?;
            }
        }
        if events & IN_EVENTS != 0 && self.connections.contains_key(&fd) {
            return self.read(fd);
        }
        Ok(())
    }

    /// Accept one connection on this worker's own listener.
    fn accept(&mut self, listener_fd: RawFd) -> Result<(), Error> {
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
            error!("accept on event-loop({}) failed: {err}", self.index);
            return Err(Error::Io(err));
        }

        let keep_alive = self.server.config().tcp_keep_alive.as_secs();
        if keep_alive > 0
            && let Err(err) = set_keep_alive(fd, keep_alive)
        {
            warn!("set keep-alive on fd {fd} failed: {err}");
        }

        let remote = sockaddr_to_socket_addr(&storage)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let local = self
            .listener
            .as_ref()
            .map(|l| l.local_addr())
            .unwrap_or_else(|| self.server.local_addr());

        let conn = Conn::new(fd, local, remote, Arc::clone(&self.poller));
        metrics::CONNECTIONS_ACCEPTED.increment();
        self.register(conn)
    }

    /// Put a freshly accepted connection under this worker's control.
    /// Runs inline in reuseport mode and as an urgent task in reactor
    /// mode.
    pub(crate) fn register(&mut self, conn: Conn) -> Result<(), Error> {
        let fd = conn.fd;
        if let Err(err) = self.poller.add_read(fd) {
            error!("registering fd {fd} with event-loop({}) failed: {err}", self.index);
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Io(err));
        }
        self.connections.insert(fd, conn);
        self.open(fd)
    }

    fn open(&mut self, fd: RawFd) -> Result<(), Error> {
        let handler = Arc::clone(&self.handler);
        let poller = Arc::clone(&self.poller);

        let (flush_result, needs_write_interest, action);
        {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            conn.opened = true;
            self.conn_count.fetch_add(1, Ordering::AcqRel);
            metrics::CONNECTIONS_ACTIVE.increment();

            let (greeting, a) = handler.on_open(conn);
            action = a;
            flush_result = match greeting {
                Some(buf) => conn.flush_initial(&buf),
                None => Ok(()),
            };
            needs_write_interest = !conn.send_buffer.is_empty();
        }

        if let Err(err) = flush_result {
            warn!("initial write on fd {fd} failed: {err}");
            return self.close_connection(fd, Some(err));
        }
        if needs_write_interest
            && let Err(err) = poller.mod_read_write(fd)
        {
            return self.close_connection(fd, Some(err));
        }
        if let Some(err) = self.take_scheduled_close(fd) {
            return self.close_connection(fd, err);
        }
        self.handle_action(fd, action)
    }

    fn read(&mut self, fd: RawFd) -> Result<(), Error> {
        let n = unsafe {
            libc::read(
                fd,
                self.read_buf.as_mut_ptr() as *mut libc::c_void,
                self.read_buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            warn!("read on fd {fd} failed: {err}");
            return self.close_connection(fd, Some(err));
        }
        if n == 0 {
            // Orderly close from the peer surfaces as a zero-length read.
            let err = io::Error::from_raw_os_error(libc::ECONNRESET);
            return self.close_connection(fd, Some(err));
        }
        let n = n as usize;
        metrics::BYTES_RECEIVED.add(n as u64);

        let handler = Arc::clone(&self.handler);
        let action;
        {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            let slab = std::mem::take(&mut self.read_buf);
            conn.begin_traffic(slab, n);
            action = handler.on_traffic(conn);
            // Unconsumed bytes only survive when the connection does.
            self.read_buf = conn.end_traffic(action == Action::None);
        }

        if let Some(err) = self.take_scheduled_close(fd) {
            return self.close_connection(fd, err);
        }
        self.handle_action(fd, action)
    }

    fn write(&mut self, fd: RawFd) -> Result<(), Error> {
        let poller = Arc::clone(&self.poller);
        let mut hard_error = None;
        let mut drained = false;
        {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            let n = unsafe {
                libc::write(
                    fd,
                    conn.send_buffer.as_ptr() as *const libc::c_void,
                    conn.send_buffer.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    return Ok(());
                }
                warn!("write on fd {fd} failed: {err}");
                hard_error = Some(err);
            } else {
                let n = n as usize;
                metrics::BYTES_SENT.add(n as u64);
                conn.send_buffer.advance(n);
                drained = conn.send_buffer.is_empty();
            }
        }

        if let Some(err) = hard_error {
            return self.close_connection(fd, Some(err));
        }
        if drained
            && let Err(err) = poller.mod_read(fd)
        {
            // Spurious write readiness is the only cost of staying armed.
            warn!("disarming write interest on fd {fd} failed: {err}");
        }
        Ok(())
    }

    fn handle_action(&mut self, fd: RawFd, action: Action) -> Result<(), Error> {
        match action {
            Action::None => Ok(()),
            Action::Close => self.close_connection(fd, None),
            Action::Shutdown => Err(Error::ServerShutdown),
        }
    }

    /// A hard write error inside a user callback defers the close until
    /// the callback returns; collect the recorded cause here.
    fn take_scheduled_close(&mut self, fd: RawFd) -> Option<Option<io::Error>> {
        let conn = self.connections.get_mut(&fd)?;
        if !conn.close_scheduled {
            return None;
        }
        Some(conn.pending_error.take())
    }

    pub(crate) fn close_connection(
        &mut self,
        fd: RawFd,
        err: Option<io::Error>,
    ) -> Result<(), Error> {
        if !self.connections.get(&fd).is_some_and(|c| c.opened) {
            return Ok(());
        }
        let Some(mut conn) = self.connections.remove(&fd) else {
            return Ok(());
        };

        // Best-effort flush of whatever was still queued for the peer.
        if !conn.send_buffer.is_empty() {
            let n = unsafe {
                libc::write(
                    fd,
                    conn.send_buffer.as_ptr() as *const libc::c_void,
                    conn.send_buffer.len(),
                )
            };
            if n < 0 {
                debug!(
                    "final flush on fd {fd} failed: {}",
                    io::Error::last_os_error()
                );
            } else {
                metrics::BYTES_SENT.add(n as u64);
                conn.send_buffer.advance(n as usize);
            }
        }

        if let Err(e) = self.poller.delete(fd) {
            warn!(
                "failed to delete fd {fd} from poller in event-loop({}): {e}",
                self.index
            );
        }
        if unsafe { libc::close(fd) } < 0 {
            warn!(
                "failed to close fd {fd} in event-loop({}): {}",
                self.index,
                io::Error::last_os_error()
            );
        }

        self.conn_count.fetch_sub(1, Ordering::AcqRel);
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();

        self.handler.on_close(&mut conn, err.as_ref());
        conn.release();
        Ok(())
    }

    fn close_all_connections(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            let _ = self.close_connection(fd, None);
        }
    }
}

//! Per-socket connection state.
//!
//! A `Conn` is owned exclusively by the worker that registered it; user
//! callbacks receive `&mut Conn` on that worker's thread. Inbound bytes
//! flow through two tiers: the worker's shared read slab, loaned to the
//! connection for the duration of one `on_traffic` call, and the
//! connection's own receive buffer holding whatever earlier callbacks
//! left unconsumed. Outbound bytes that the socket would not take are
//! parked in the send buffer until write-readiness fires.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::poller::Poller;

pub struct Conn {
    pub(crate) fd: RawFd,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    /// Poller of the owning worker, for re-arming write interest from
    /// inside a user callback.
    poller: Arc<Poller>,
    /// The worker's read slab while on loan, empty otherwise.
    scratch: Vec<u8>,
    scratch_pos: usize,
    scratch_len: usize,
    /// Bytes received but not yet consumed by the handler.
    pub(crate) recv_buffer: BytesMut,
    /// Bytes waiting for the socket to accept them.
    pub(crate) send_buffer: BytesMut,
    context: Option<Box<dyn Any + Send>>,
    pub(crate) opened: bool,
    /// Set when a write hit a hard error inside a callback; the worker
    /// closes the connection once the callback returns.
    pub(crate) close_scheduled: bool,
    pub(crate) pending_error: Option<io::Error>,
}

impl Conn {
    pub(crate) fn new(
        fd: RawFd,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        poller: Arc<Poller>,
    ) -> Self {
        Conn {
            fd,
            local_addr,
            remote_addr,
            poller,
            scratch: Vec::new(),
            scratch_pos: 0,
            scratch_len: 0,
            recv_buffer: BytesMut::new(),
            send_buffer: BytesMut::new(),
            context: None,
            opened: false,
            close_scheduled: false,
            pending_error: None,
        }
    }

    /// Address of the listener this connection arrived on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Attach an arbitrary per-connection value.
    pub fn set_context<C: Any + Send>(&mut self, context: C) {
        self.context = Some(Box::new(context));
    }

    /// Borrow the per-connection value, if one of type `C` is attached.
    pub fn context<C: Any + Send>(&self) -> Option<&C> {
        self.context.as_ref()?.downcast_ref()
    }

    /// Mutably borrow the per-connection value.
    pub fn context_mut<C: Any + Send>(&mut self) -> Option<&mut C> {
        self.context.as_mut()?.downcast_mut()
    }

    /// Copy up to `dst.len()` received bytes into `dst`, draining the
    /// receive buffer before the bytes of the current `on_traffic` call.
    ///
    /// Returns the number of bytes copied, or `UnexpectedEof` when
    /// nothing is available and `dst` is non-empty.
    pub fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;

        if !self.recv_buffer.is_empty() {
            n = self.recv_buffer.len().min(dst.len());
            dst[..n].copy_from_slice(&self.recv_buffer[..n]);
            self.recv_buffer.advance(n);
            if n == dst.len() {
                return Ok(n);
            }
        }

        let avail = self.scratch_len - self.scratch_pos;
        let m = avail.min(dst.len() - n);
        if m > 0 {
            dst[n..n + m]
                .copy_from_slice(&self.scratch[self.scratch_pos..self.scratch_pos + m]);
            self.scratch_pos += m;
            n += m;
        }

        if n == 0 && !dst.is_empty() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(n)
    }

    /// Queue `data` for the peer.
    ///
    /// Writes directly to the socket when nothing is already buffered;
    /// anything the socket does not take is parked in the send buffer and
    /// write interest is armed. A hard write error schedules the
    /// connection for closing and is returned to the caller.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        // A non-empty send buffer means the socket already pushed back;
        // writing now would only reorder bytes.
        if !self.send_buffer.is_empty() {
            self.send_buffer.extend_from_slice(data);
            return Ok(data.len());
        }

        match sys_write(self.fd, data) {
            Ok(n) if n < data.len() => {
                self.send_buffer.extend_from_slice(&data[n..]);
                self.arm_write_interest()?;
                Ok(data.len())
            }
            Ok(n) => Ok(n),
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                self.send_buffer.extend_from_slice(data);
                self.arm_write_interest()?;
                Ok(data.len())
            }
            Err(err) => {
                self.close_scheduled = true;
                self.pending_error = Some(io::Error::new(err.kind(), err.to_string()));
                Err(err)
            }
        }
    }

    fn arm_write_interest(&mut self) -> io::Result<()> {
        self.poller.mod_read_write(self.fd)
    }

    /// Write the greeting returned by `on_open`, buffering whatever the
    /// socket will not take yet. Write interest is armed by the worker
    /// afterwards.
    pub(crate) fn flush_initial(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if !self.send_buffer.is_empty() {
            self.send_buffer.extend_from_slice(buf);
            return Ok(());
        }
        match sys_write(self.fd, buf) {
            Ok(n) => {
                if n < buf.len() {
                    self.send_buffer.extend_from_slice(&buf[n..]);
                }
                Ok(())
            }
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                self.send_buffer.extend_from_slice(buf);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Loan the worker's read slab to this connection; `len` bytes of it
    /// are fresh.
    pub(crate) fn begin_traffic(&mut self, slab: Vec<u8>, len: usize) {
        self.scratch = slab;
        self.scratch_pos = 0;
        self.scratch_len = len;
    }

    /// Return the slab to the worker. With `keep_unread`, the tail the
    /// handler did not consume moves into the receive buffer first.
    pub(crate) fn end_traffic(&mut self, keep_unread: bool) -> Vec<u8> {
        if keep_unread && self.scratch_pos < self.scratch_len {
            self.recv_buffer
                .extend_from_slice(&self.scratch[self.scratch_pos..self.scratch_len]);
        }
        self.scratch_pos = 0;
        self.scratch_len = 0;
        std::mem::take(&mut self.scratch)
    }

    /// Drop everything the connection owns. The FD itself is closed by
    /// the worker.
    pub(crate) fn release(&mut self) {
        self.opened = false;
        self.recv_buffer = BytesMut::new();
        self.send_buffer = BytesMut::new();
        self.context = None;
        self.pending_error = None;
    }
}

fn sys_write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> (Conn, RawFd) {
        let poller = Arc::new(Poller::new().unwrap());
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        (Conn::new(fds[0], addr, addr, poller), fds[1])
    }

    #[test]
    fn read_drains_receive_buffer_before_scratch() {
        let (mut conn, peer) = test_conn();
        conn.recv_buffer.extend_from_slice(b"old");
        conn.begin_traffic(b"newbytes".to_vec(), 3);

        let mut dst = [0u8; 8];
        let n = conn.read(&mut dst).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&dst[..6], b"oldnew");

        let err = conn.read(&mut dst).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        unsafe {
            libc::close(conn.fd);
            libc::close(peer);
        }
    }

    #[test]
    fn partial_reads_keep_position() {
        let (mut conn, peer) = test_conn();
        conn.begin_traffic(b"abcdef".to_vec(), 6);

        let mut dst = [0u8; 2];
        assert_eq!(conn.read(&mut dst).unwrap(), 2);
        assert_eq!(&dst, b"ab");
        assert_eq!(conn.read(&mut dst).unwrap(), 2);
        assert_eq!(&dst, b"cd");

        // The unconsumed tail survives into the receive buffer.
        let slab = conn.end_traffic(true);
        assert_eq!(slab, b"abcdef");
        assert_eq!(&conn.recv_buffer[..], b"ef");
        unsafe {
            libc::close(conn.fd);
            libc::close(peer);
        }
    }

    #[test]
    fn end_traffic_can_discard_unread() {
        let (mut conn, peer) = test_conn();
        conn.begin_traffic(b"abcdef".to_vec(), 6);
        conn.end_traffic(false);
        assert!(conn.recv_buffer.is_empty());
        unsafe {
            libc::close(conn.fd);
            libc::close(peer);
        }
    }

    #[test]
    fn write_appends_when_send_buffer_pending() {
        let (mut conn, peer) = test_conn();
        conn.send_buffer.extend_from_slice(b"queued");
        assert_eq!(conn.write(b"-more").unwrap(), 5);
        assert_eq!(&conn.send_buffer[..], b"queued-more");
        unsafe {
            libc::close(conn.fd);
            libc::close(peer);
        }
    }

    #[test]
    fn write_goes_straight_to_socket_when_unbuffered() {
        let (mut conn, peer) = test_conn();
        assert_eq!(conn.write(b"hello").unwrap(), 5);
        assert!(conn.send_buffer.is_empty());

        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut libc::c_void, 16) };
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
        unsafe {
            libc::close(conn.fd);
            libc::close(peer);
        }
    }

    #[test]
    fn context_round_trip() {
        let (mut conn, peer) = test_conn();
        conn.set_context(42u64);
        assert_eq!(conn.context::<u64>(), Some(&42));
        assert_eq!(conn.context::<String>(), None);
        *conn.context_mut::<u64>().unwrap() = 7;
        assert_eq!(conn.context::<u64>(), Some(&7));
        conn.release();
        assert_eq!(conn.context::<u64>(), None);
        unsafe {
            libc::close(conn.fd);
            libc::close(peer);
        }
    }
}

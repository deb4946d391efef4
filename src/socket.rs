//! Raw socket plumbing: listener setup, sockaddr conversion, socket
//! options. IPv4 TCP only.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::config::Config;
use crate::error::Error;

/// A listening TCP socket. Close is once-only: the supervisor and an
/// exiting worker may both try.
pub(crate) struct Listener {
    fd: RawFd,
    addr: SocketAddr,
    closed: AtomicBool,
}

impl Listener {
    /// Create a non-blocking IPv4 listen socket bound to `addr`, with the
    /// socket options `config` asks for applied before `bind`.
    pub(crate) fn bind(addr: SocketAddr, config: &Config) -> Result<Self, Error> {
        let SocketAddr::V4(_) = addr else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only IPv4 listen addresses are supported",
            )));
        };

        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::IPPROTO_TCP,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let result = Self::setup(fd, addr, config);
        if let Err(e) = result {
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }

        // Re-read the bound address so an ephemeral-port request (`:0`)
        // reports the port the kernel actually picked.
        let addr = local_addr_of(fd)?;
        Ok(Listener {
            fd,
            addr,
            closed: AtomicBool::new(false),
        })
    }

    fn setup(fd: RawFd, addr: SocketAddr, config: &Config) -> Result<(), Error> {
        if config.reuse_port {
            set_reuse_port(fd)?;
        }
        if config.reuse_addr {
            set_reuse_addr(fd)?;
        }
        if config.tcp_no_delay {
            set_no_delay(fd)?;
        }
        if config.socket_recv_buffer > 0 {
            set_recv_buffer(fd, config.socket_recv_buffer)?;
        }
        if config.socket_send_buffer > 0 {
            set_send_buffer(fd, config.socket_send_buffer)?;
        }

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let addr_len = socket_addr_to_sockaddr(&addr, &mut storage);
        let ret = unsafe {
            libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len)
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let ret = unsafe { libc::listen(fd, listener_backlog()) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.fd);
            }
            debug!("listener on {} closed", self.addr);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listen backlog: the kernel's somaxconn if readable, SOMAXCONN otherwise.
fn listener_backlog() -> libc::c_int {
    match std::fs::read_to_string("/proc/sys/net/core/somaxconn") {
        Ok(s) => match s.split_whitespace().next().and_then(|f| f.parse().ok()) {
            Some(0) | None => libc::SOMAXCONN,
            Some(n) => n,
        },
        Err(_) => libc::SOMAXCONN,
    }
}

/// Fill `storage` from a Rust `SocketAddr`, returning the sockaddr length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: &SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Convert a `sockaddr_storage` filled by accept4/getsockname back into a
/// Rust `SocketAddr`.
pub(crate) fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

fn local_addr_of(fd: RawFd) -> Result<SocketAddr, Error> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    sockaddr_to_socket_addr(&storage).ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported socket address family",
        ))
    })
}

fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    opt: libc::c_int,
    value: libc::c_int,
) -> Result<(), Error> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Enable SO_KEEPALIVE with both the idle period and the probe interval
/// set to `secs` whole seconds.
pub(crate) fn set_keep_alive(fd: RawFd, secs: u64) -> Result<(), Error> {
    if secs == 0 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "keep-alive period must be positive",
        )));
    }
    let secs = secs as libc::c_int;
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, secs)?;
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, secs)
}

pub(crate) fn set_no_delay(fd: RawFd) -> Result<(), Error> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

pub(crate) fn set_reuse_port(fd: RawFd) -> Result<(), Error> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
}

pub(crate) fn set_reuse_addr(fd: RawFd) -> Result<(), Error> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

pub(crate) fn set_recv_buffer(fd: RawFd, size: usize) -> Result<(), Error> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int)
}

pub(crate) fn set_send_buffer(fd: RawFd, size: usize) -> Result<(), Error> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_is_positive() {
        assert!(listener_backlog() > 0);
    }

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(&addr, &mut storage);
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn bind_ephemeral_resolves_port() {
        let config = Config::default();
        let listener =
            Listener::bind("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[test]
    fn rejects_ipv6() {
        let config = Config::default();
        let result = Listener::bind("[::1]:0".parse().unwrap(), &config);
        assert!(result.is_err());
    }
}

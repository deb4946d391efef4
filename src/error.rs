use std::io;

use thiserror::Error;

/// Errors returned by the eventline runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Raw syscall or I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Sentinel that unwinds every event loop during graceful shutdown.
    #[error("server is going to be shutdown")]
    ServerShutdown,
    /// The server has already completed (or is completing) a shutdown.
    #[error("server is in shutdown")]
    ServerInShutdown,
    /// Accepting a new connection failed on the main reactor.
    #[error("accept a new connection error")]
    AcceptSocket,
    /// Thread pinning was requested with an unreasonable event-loop count.
    #[error("too many event-loops under lock_os_thread mode")]
    TooManyEventLoopThreads,
}

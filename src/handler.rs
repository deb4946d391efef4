use std::io;

use crate::connection::Conn;
use crate::error::Error;
use crate::server::Server;

/// Directive a connection callback hands back to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep the connection as-is.
    #[default]
    None = 0,
    /// Close this connection after flushing buffered output.
    Close = 1,
    /// Shut the whole server down.
    Shutdown = 2,
}

/// The application-facing callback surface.
///
/// One handler instance is shared by every worker, so implementations
/// must be `Send + Sync`; per-connection state belongs in the
/// connection's [context slot](Conn::set_context). All connection
/// callbacks run on the worker thread that owns the connection, so calls
/// for a given connection are never concurrent.
pub trait EventHandler: Send + Sync + 'static {
    /// Called once before any connection is accepted. Returning an error
    /// aborts startup.
    fn on_boot(&self, _server: &Server) -> Result<(), Error> {
        Ok(())
    }

    /// Called once after the shutdown signal, before workers are joined.
    fn on_shutdown(&self, _server: &Server) {}

    /// Called when a connection is registered with its worker. Any bytes
    /// returned are written to the peer immediately.
    fn on_open(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// Called after each successful non-zero read. The freshly read bytes
    /// are available through [`Conn::read`] until this returns; whatever
    /// is left unconsumed is kept for the next callback.
    fn on_traffic(&self, _conn: &mut Conn) -> Action {
        Action::None
    }

    /// Called exactly once per connection, after its FD has been closed.
    /// `err` carries the error that tore the connection down, if any.
    fn on_close(&self, _conn: &mut Conn, _err: Option<&io::Error>) {}
}

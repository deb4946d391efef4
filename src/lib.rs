//! eventline — epoll-native event-driven TCP server library for Linux.
//!
//! eventline runs one event loop per worker thread. Each worker owns an
//! epoll instance, every connection assigned to it, and a shared read
//! slab; user callbacks run on the owning worker, so per-connection code
//! never needs a lock. Two topologies are supported: one `SO_REUSEPORT`
//! listener per worker with kernel-side load spreading, or a main/sub
//! reactor split where a single acceptor hands connections to workers
//! through a lock-free task queue and an eventfd wake.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use eventline::{Action, Config, Conn, EventHandler, run};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_open(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
//!         (Some(b"ack\n".to_vec()), Action::None)
//!     }
//!
//!     fn on_traffic(&self, conn: &mut Conn) -> Action {
//!         let mut buf = [0u8; 4096];
//!         while let Ok(n) = conn.read(&mut buf) {
//!             if conn.write(&buf[..n]).is_err() {
//!                 return Action::Close;
//!             }
//!         }
//!         Action::None
//!     }
//! }
//!
//! fn main() -> Result<(), eventline::Error> {
//!     let handle = run(Echo, "127.0.0.1:7878", Config::default())?;
//!     handle.wait();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. Requires epoll, eventfd, and accept4; listen addresses
//! are IPv4.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod balancer;
pub(crate) mod event_loop;
pub(crate) mod metrics;
pub(crate) mod poller;
pub(crate) mod queue;
pub(crate) mod socket;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod server;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Directive a connection callback hands back to its worker.
pub use handler::Action;
/// The application-facing callback surface.
pub use handler::EventHandler;

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Connection-to-worker assignment strategy.
pub use config::Lb;
/// Hard cap on read/write buffering granularity.
pub use config::MAX_TCP_BUFFER_CAP;

/// A single accepted TCP connection.
pub use connection::Conn;
/// Runtime errors.
pub use error::Error;

/// Start a server and get a handle to it.
pub use server::run;
/// Shared supervisor state, passed to boot and shutdown hooks.
pub use server::Server;
/// Handle for stopping a running server or waiting on it.
pub use server::ServerHandle;

use std::time::Duration;

use crate::error::Error;

/// Hard cap on the per-worker read slab and per-connection write
/// buffering granularity.
pub const MAX_TCP_BUFFER_CAP: usize = 64 * 1024;

/// Connection-to-worker assignment strategy for the main/sub reactor
/// topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lb {
    /// Cycle through workers in registration order.
    #[default]
    RoundRobin,
    /// Pick the worker with the fewest open connections.
    LeastConnections,
    /// CRC32 of the peer address, so a given peer lands on a stable worker.
    SourceAddrHash,
}

/// Runtime configuration.
#[derive(Clone)]
pub struct Config {
    /// TCP keep-alive period. Zero disables keep-alive; otherwise both
    /// the idle time and the probe interval are set to this many whole
    /// seconds on every accepted socket.
    pub tcp_keep_alive: Duration,
    /// Pin each worker thread to a CPU core.
    pub lock_os_thread: bool,
    /// Bind one SO_REUSEPORT listener per worker and let the kernel
    /// spread incoming connections. When unset, one main reactor accepts
    /// and hands connections to sub-workers.
    pub reuse_port: bool,
    /// Default the worker count to the number of CPUs.
    pub multicore: bool,
    /// Explicit worker count. Overrides `multicore` when non-zero.
    pub num_event_loop: usize,
    /// Set SO_REUSEADDR on listen sockets.
    pub reuse_addr: bool,
    /// Set TCP_NODELAY on listen sockets.
    pub tcp_no_delay: bool,
    /// Per-worker read slab size. Clamped to [`MAX_TCP_BUFFER_CAP`] at
    /// startup in this revision.
    pub read_buffer_cap: usize,
    /// Write buffering granularity. Clamped like `read_buffer_cap`.
    pub write_buffer_cap: usize,
    /// SO_RCVBUF for listen sockets when non-zero.
    pub socket_recv_buffer: usize,
    /// SO_SNDBUF for listen sockets when non-zero.
    pub socket_send_buffer: usize,
    /// Load-balancing strategy for the reactor topology.
    pub lb: Lb,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_keep_alive: Duration::ZERO,
            lock_os_thread: false,
            reuse_port: false,
            multicore: false,
            num_event_loop: 0,
            reuse_addr: false,
            tcp_no_delay: false,
            read_buffer_cap: MAX_TCP_BUFFER_CAP,
            write_buffer_cap: MAX_TCP_BUFFER_CAP,
            socket_recv_buffer: 0,
            socket_send_buffer: 0,
            lb: Lb::RoundRobin,
        }
    }
}

impl Config {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.lock_os_thread && self.num_event_loop > 10_000 {
            return Err(Error::TooManyEventLoopThreads);
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()`
/// validation.
///
/// # Example
///
/// ```rust
/// use eventline::{ConfigBuilder, Lb};
///
/// let config = ConfigBuilder::new()
///     .num_event_loop(4)
///     .reuse_port(true)
///     .tcp_no_delay(true)
///     .load_balancing(Lb::LeastConnections)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Worker settings ──────────────────────────────────────────────

    /// Set the explicit worker count. Overrides `multicore`.
    pub fn num_event_loop(mut self, n: usize) -> Self {
        self.config.num_event_loop = n;
        self
    }

    /// Default the worker count to the number of CPUs.
    pub fn multicore(mut self, enable: bool) -> Self {
        self.config.multicore = enable;
        self
    }

    /// Pin each worker thread to a CPU core.
    pub fn lock_os_thread(mut self, enable: bool) -> Self {
        self.config.lock_os_thread = enable;
        self
    }

    /// Set the load-balancing strategy for the reactor topology.
    pub fn load_balancing(mut self, lb: Lb) -> Self {
        self.config.lb = lb;
        self
    }

    // ── Socket settings ──────────────────────────────────────────────

    /// Select the SO_REUSEPORT topology.
    pub fn reuse_port(mut self, enable: bool) -> Self {
        self.config.reuse_port = enable;
        self
    }

    /// Set SO_REUSEADDR on listen sockets.
    pub fn reuse_addr(mut self, enable: bool) -> Self {
        self.config.reuse_addr = enable;
        self
    }

    /// Set TCP_NODELAY on listen sockets.
    pub fn tcp_no_delay(mut self, enable: bool) -> Self {
        self.config.tcp_no_delay = enable;
        self
    }

    /// Set the TCP keep-alive period (whole seconds; zero disables).
    pub fn tcp_keep_alive(mut self, period: Duration) -> Self {
        self.config.tcp_keep_alive = period;
        self
    }

    /// Set SO_RCVBUF on listen sockets.
    pub fn socket_recv_buffer(mut self, size: usize) -> Self {
        self.config.socket_recv_buffer = size;
        self
    }

    /// Set SO_SNDBUF on listen sockets.
    pub fn socket_send_buffer(mut self, size: usize) -> Self {
        self.config.socket_send_buffer = size;
        self
    }

    // ── Buffer settings ──────────────────────────────────────────────

    /// Set the per-worker read slab size.
    pub fn read_buffer_cap(mut self, cap: usize) -> Self {
        self.config.read_buffer_cap = cap;
        self
    }

    /// Set the write buffering granularity.
    pub fn write_buffer_cap(mut self, cap: usize) -> Self {
        self.config.write_buffer_cap = cap;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_round_trip() {
        let config = ConfigBuilder::new()
            .num_event_loop(3)
            .multicore(true)
            .reuse_port(true)
            .tcp_no_delay(true)
            .tcp_keep_alive(Duration::from_secs(30))
            .load_balancing(Lb::SourceAddrHash)
            .build()
            .unwrap();
        assert_eq!(config.num_event_loop, 3);
        assert!(config.multicore);
        assert!(config.reuse_port);
        assert!(config.tcp_no_delay);
        assert_eq!(config.tcp_keep_alive, Duration::from_secs(30));
        assert_eq!(config.lb, Lb::SourceAddrHash);
    }

    #[test]
    fn pinning_guard_rejects_huge_loop_counts() {
        let result = ConfigBuilder::new()
            .lock_os_thread(true)
            .num_event_loop(10_001)
            .build();
        assert!(matches!(result, Err(Error::TooManyEventLoopThreads)));

        assert!(
            ConfigBuilder::new()
                .lock_os_thread(true)
                .num_event_loop(10_000)
                .build()
                .is_ok()
        );
    }
}

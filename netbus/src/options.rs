//! Bus configuration: the knobs an operator would otherwise reach for process-wide
//! configuration keys (`cluster.public.host`, `cluster.public.port`, ...) to set.
//!
//! Mirrors the teacher's `SocketOptions` builder: a plain `Clone` struct with a `Default` impl
//! and `with_*` methods returning `Self`, so construction reads as a chain of overrides from a
//! sane baseline.

use std::net::SocketAddr;
use std::time::Duration;

/// Default interval between liveness pings sent on an idle outbound connection.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
/// Default time to wait for a pong (any inbound byte) before declaring a connection dead.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(20);
/// Default read buffer size, matching the teacher's `DEFAULT_READ_BUF_SIZE`.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;
/// Default write buffer size, matching the teacher's `DEFAULT_WRITE_BUF_SIZE`.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8192;

/// Configuration for a running [`crate::EventBus`].
///
/// # Examples
///
/// ```
/// use netbus::BusOptions;
/// use std::time::Duration;
///
/// let opts = BusOptions::default()
///     .with_ping_interval(Duration::from_secs(5))
///     .with_pong_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Address the inbound server binds to.
    pub bind_addr: SocketAddr,

    /// Advertised host override (the in-process equivalent of `cluster.public.host`).
    ///
    /// `None` means advertise the bind address's own host.
    pub public_host: Option<String>,

    /// Advertised port override (the in-process equivalent of `cluster.public.port`).
    ///
    /// `None` means advertise the actual bound port.
    pub public_port: Option<u16>,

    /// Interval between liveness pings on an outbound connection.
    pub ping_interval: Duration,

    /// How long to wait for a pong after a ping before declaring the connection dead.
    pub pong_timeout: Duration,

    /// Default reply timeout used by `send` when no explicit timeout is given.
    ///
    /// `Duration::ZERO` means "no timeout" (wait indefinitely for a reply).
    pub default_reply_timeout: Duration,

    /// Read buffer size, in bytes, used by per-connection frame readers.
    pub read_buffer_size: usize,

    /// Write buffer size, in bytes, used to size the initial frame-encoding allocation.
    pub write_buffer_size: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("valid default bind addr"),
            public_host: None,
            public_port: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            default_reply_timeout: Duration::ZERO,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

impl BusOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    #[must_use]
    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_public_port(mut self, port: u16) -> Self {
        self.public_port = Some(port);
        self
    }

    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_default_reply_timeout(mut self, timeout: Duration) -> Self {
        self.default_reply_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_buffer_sizes(mut self, read_size: usize, write_size: usize) -> Self {
        self.read_buffer_size = read_size;
        self.write_buffer_size = write_size;
        self
    }
}

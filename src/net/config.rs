use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::logger::{Logger, NoOpLogger};
use crate::mixed_buffer::DEFAULT_WRITE_RING_SIZE;
use crate::ring_buffer::DEFAULT_RING_LIMIT;
use crate::task_queue::DEFAULT_TASK_QUEUE_CAP;

/// Transport the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Policy for distributing accepted connections across event loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalance {
    RoundRobin,
    LeastConnections,
}

/// Configuration for a [`crate::net::Server`].
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub addr: SocketAddr,
    /// TCP or UDP.
    pub protocol: Protocol,
    /// Number of event loops; 0 means one per available core.
    pub event_loops: usize,
    /// How accepted connections are spread across loops.
    pub load_balance: LoadBalance,
    /// Enable TCP_NODELAY on accepted sockets.
    pub no_delay: bool,
    /// SO_KEEPALIVE setting for accepted sockets.
    pub keep_alive: Option<Duration>,
    /// Growth limit for a connection's inbound ring; a peer that outruns it
    /// is closed.
    pub read_buffer_limit: usize,
    /// Ring capacity of the outbound buffer's small-burst fast path.
    pub write_ring_size: usize,
    /// Total cap on buffered outbound bytes per connection; 0 = unbounded.
    pub write_buffer_limit: usize,
    /// Bound of each loop's cross-thread task channel.
    pub task_queue_cap: usize,
    /// Enable the periodic tick callback.
    pub ticker: bool,
    /// Logger for engine events.
    pub logger: Arc<dyn Logger>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".parse().unwrap(),
            protocol: Protocol::Tcp,
            event_loops: 0,
            load_balance: LoadBalance::RoundRobin,
            no_delay: true,
            keep_alive: Some(Duration::from_secs(60)),
            read_buffer_limit: DEFAULT_RING_LIMIT,
            write_ring_size: DEFAULT_WRITE_RING_SIZE,
            write_buffer_limit: 0,
            task_queue_cap: DEFAULT_TASK_QUEUE_CAP,
            ticker: false,
            logger: Arc::new(NoOpLogger),
        }
    }
}

/// Builder for [`ServerConfig`].
pub struct ServerConfigBuilder {
    addr: Option<SocketAddr>,
    protocol: Option<Protocol>,
    event_loops: Option<usize>,
    load_balance: Option<LoadBalance>,
    no_delay: Option<bool>,
    keep_alive: Option<Option<Duration>>,
    read_buffer_limit: Option<usize>,
    write_ring_size: Option<usize>,
    write_buffer_limit: Option<usize>,
    task_queue_cap: Option<usize>,
    ticker: Option<bool>,
    logger: Option<Arc<dyn Logger>>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            addr: None,
            protocol: None,
            event_loops: None,
            load_balance: None,
            no_delay: None,
            keep_alive: None,
            read_buffer_limit: None,
            write_ring_size: None,
            write_buffer_limit: None,
            task_queue_cap: None,
            ticker: None,
            logger: None,
        }
    }

    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn event_loops(mut self, n: usize) -> Self {
        self.event_loops = Some(n);
        self
    }

    pub fn load_balance(mut self, policy: LoadBalance) -> Self {
        self.load_balance = Some(policy);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn keep_alive(mut self, duration: Option<Duration>) -> Self {
        self.keep_alive = Some(duration);
        self
    }

    pub fn read_buffer_limit(mut self, limit: usize) -> Self {
        self.read_buffer_limit = Some(limit);
        self
    }

    pub fn write_ring_size(mut self, size: usize) -> Self {
        self.write_ring_size = Some(size);
        self
    }

    pub fn write_buffer_limit(mut self, limit: usize) -> Self {
        self.write_buffer_limit = Some(limit);
        self
    }

    pub fn task_queue_cap(mut self, cap: usize) -> Self {
        self.task_queue_cap = Some(cap);
        self
    }

    pub fn ticker(mut self, enabled: bool) -> Self {
        self.ticker = Some(enabled);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            addr: self.addr.unwrap_or(default.addr),
            protocol: self.protocol.unwrap_or(default.protocol),
            event_loops: self.event_loops.unwrap_or(default.event_loops),
            load_balance: self.load_balance.unwrap_or(default.load_balance),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            read_buffer_limit: self.read_buffer_limit.unwrap_or(default.read_buffer_limit),
            write_ring_size: self.write_ring_size.unwrap_or(default.write_ring_size),
            write_buffer_limit: self.write_buffer_limit.unwrap_or(default.write_buffer_limit),
            task_queue_cap: self.task_queue_cap.unwrap_or(default.task_queue_cap),
            ticker: self.ticker.unwrap_or(default.ticker),
            logger: self.logger.unwrap_or(default.logger),
        }
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! millrace: an event-driven TCP/UDP server framework.
//!
//! A fixed pool of event loops, each pinned to one OS thread, services
//! hundreds of thousands of connections with edge-triggered readiness
//! notifications, ring-buffered inbound data, a hybrid ring+list outbound
//! buffer with scatter/gather flushing, and a bounded two-priority task
//! channel for cross-thread work submission.
//!
//! Applications implement [`EventHandler`] and react to decoded frames;
//! framing is pluggable through [`Codec`]. Within a loop everything is
//! strictly sequential, so handler code needs no locks for per-connection
//! state. Foreign threads interact through [`ConnHandle`].
//!
//! # Example
//!
//! ```rust,no_run
//! use millrace::{Action, Conn, EventHandler, Server, ServerConfig};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
//!         (Some(frame.to_vec()), Action::None)
//!     }
//! }
//!
//! fn main() -> millrace::Result<()> {
//!     let config = ServerConfig::builder()
//!         .addr("127.0.0.1:7878".parse().unwrap())
//!         .build();
//!     Server::new(config, Echo)?.run()
//! }
//! ```

pub mod buffer_pool;
pub mod codec;
pub mod conn;
pub mod error;
pub mod event;
pub mod handler;
pub mod logger;
pub mod mixed_buffer;
pub mod net;
pub mod poll;
pub mod reactor;
pub mod ring_buffer;
pub mod sg_io;
pub mod task_queue;

pub use buffer_pool::{PooledRing, PooledSegment, RingPool, SegmentPool};
pub use codec::{Codec, Passthrough};
pub use conn::{Conn, ConnHandle};
pub use error::{Error, Result};
pub use handler::{Action, EventHandler, ServerInfo};
pub use logger::{LogLevel, Logger, NoOpLogger};
pub use mixed_buffer::MixedBuffer;
pub use net::{LoadBalance, Protocol, Server, ServerConfig};
pub use reactor::{Reactor, ShutdownHandle};
pub use ring_buffer::RingBuffer;
pub use task_queue::{TaskPriority, TaskQueue};

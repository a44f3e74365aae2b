//! Server orchestration: configuration, the acceptor, and the loop pool.
//!
//! The acceptor owns the listening socket and nothing else. Every accepted
//! connection is handed to exactly one event loop through that loop's task
//! channel and serviced there for its whole lifetime; the acceptor never
//! touches it again.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     User Application                     │
//! │        EventHandler callbacks  ·  ConnHandle ops         │
//! └────────────▲──────────────────────────────▲──────────────┘
//!              │ react / on_opened / ...      │ async_write / wake / close
//! ┌────────────┴──────────┐      ┌────────────┴─────────────┐
//! │       Acceptor        │─────▶│  Event loops (1 thread   │
//! │  accept → pick loop   │ task │  each): poller, conns,   │
//! │  → submit + wake      │      │  buffers, task channel   │
//! └────────────┬──────────┘      └────────────┬─────────────┘
//!              │ accept(2)                    │ epoll / kqueue
//! ┌────────────┴──────────────────────────────┴──────────────┐
//! │                     Operating System                     │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod server;

pub use config::{LoadBalance, Protocol, ServerConfig, ServerConfigBuilder};
pub use server::Server;

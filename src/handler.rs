use std::net::SocketAddr;
use std::time::Duration;

use crate::conn::Conn;
use crate::error::Error;

/// Verdict returned by handler hooks; bubbles up through the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep going.
    #[default]
    None,
    /// Close the triggering connection.
    Close,
    /// Terminate this loop and, through the server, all loops.
    Shutdown,
}

/// Facts about the running server, handed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub local_addr: SocketAddr,
    pub event_loops: usize,
}

/// The application callback set.
///
/// Every hook runs on the owning loop's thread and must not block; the loop
/// is strictly sequential, so a stalled callback stalls every connection on
/// that loop. All hooks except [`EventHandler::react`] have no-op defaults.
pub trait EventHandler: Send + Sync + 'static {
    /// Called once, before any accept.
    fn on_init_complete(&self, info: &ServerInfo) -> Action {
        let _ = info;
        Action::None
    }

    /// Called once, after the last loop stops.
    fn on_shutdown(&self, info: &ServerInfo) {
        let _ = info;
    }

    /// Called when a connection is accepted and registered. Returned bytes
    /// are written immediately, before any `react`.
    fn on_opened(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        let _ = conn;
        (None, Action::None)
    }

    /// Called exactly once per opened connection, with the close cause when
    /// there is one.
    fn on_closed(&self, conn: &mut Conn, err: Option<&Error>) -> Action {
        let _ = (conn, err);
        Action::None
    }

    /// Instrumentation hook fired just before bytes are handed to the kernel
    /// or buffered.
    fn pre_write(&self, conn: &mut Conn) {
        let _ = conn;
    }

    /// Instrumentation hook fired after a write attempt with the byte count
    /// accepted by kernel or buffer.
    fn after_write(&self, conn: &mut Conn, bytes: usize) {
        let _ = (conn, bytes);
    }

    /// The primary callback: one decoded frame in, optional response out.
    /// A [`Conn::handle`]-initiated wake delivers an empty frame.
    fn react(&self, frame: &[u8], conn: &mut Conn) -> (Option<Vec<u8>>, Action);

    /// Periodic callback; returning a non-zero delay schedules the next
    /// tick, a zero delay stops the ticker.
    fn tick(&self) -> (Duration, Action) {
        (Duration::ZERO, Action::None)
    }
}

use mio::{event::Event, Token};
use std::fmt;

/// Snapshot of a single readiness event, detached from the poller's event
/// buffer so the loop can mutate its own state while dispatching a batch.
#[derive(Clone, Copy)]
pub struct PollEvent {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

impl fmt::Debug for PollEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollEvent")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("error", &self.error)
            .finish()
    }
}

impl PollEvent {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }
}

impl From<&Event> for PollEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            // A half-closed peer must still drive the read path so buffered
            // bytes are drained and EOF is observed as a zero-length read.
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }
}

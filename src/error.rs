use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
///
/// Transient I/O conditions (`EAGAIN`, `EINTR`) are absorbed inside the loop and
/// never appear here.
#[derive(Debug)]
pub enum Error {
    /// Underlying socket or poller failure.
    Io(io::Error),
    /// The task channel for the owning loop is at capacity.
    QueueFull,
    /// A buffer write would exceed the configured growth limit.
    BufferOverflow { requested: usize, limit: usize },
    /// The codec reported a framing error; fatal to the connection.
    Codec(String),
    /// The owning event loop terminated; all of its connections are closed.
    LoopTerminated,
    /// The operation does not apply to this transport.
    Unsupported(&'static str),
    Configuration(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::QueueFull => write!(f, "task queue is full"),
            Error::BufferOverflow { requested, limit } => {
                write!(f, "buffer overflow: {} bytes requested, limit {}", requested, limit)
            }
            Error::Codec(msg) => write!(f, "codec error: {}", msg),
            Error::LoopTerminated => write!(f, "event loop terminated"),
            Error::Unsupported(what) => write!(f, "unsupported operation: {}", what),
            Error::Configuration(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

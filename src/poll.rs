use mio::{event::Source, Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Token reserved for the wake fd; connection tokens start above it.
pub const WAKE_TOKEN: Token = Token(0);

/// Thin wrapper over the OS readiness facility (epoll on Linux, kqueue on
/// BSD/macOS). Registrations are edge-triggered; consumers must drain a ready
/// source until `WouldBlock` before the next event for it can fire.
///
/// The poller is owned by a single loop thread. The only thread-safe entry
/// point is [`Waker`], obtained via [`Poller::waker`], whose `wake()` is a
/// single-byte write on an internal event fd registered at [`WAKE_TOKEN`].
pub struct Poller {
    poll: Poll,
    waker: Arc<Waker>,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Poller { poll, waker })
    }

    /// Adds a source with the given interest mask.
    pub fn register<S>(&self, src: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        src.register(self.poll.registry(), token, interest)?;
        Ok(())
    }

    /// Changes the interest mask of an already-registered source, notably
    /// `Read` <-> `Read+Write` as the outbound buffer fills and drains.
    pub fn reregister<S>(&self, src: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        src.reregister(self.poll.registry(), token, interest)?;
        Ok(())
    }

    /// Removes a source. On Linux closing the fd removes it implicitly, but
    /// explicit deregistration keeps the registry honest on every platform.
    pub fn deregister<S>(&self, src: &mut S) -> Result<()>
    where
        S: Source + ?Sized,
    {
        src.deregister(self.poll.registry())?;
        Ok(())
    }

    /// Blocks until readiness, wake-up, or `timeout`. Interrupted waits are
    /// retried internally; any other failure is fatal to the owning loop.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        loop {
            match self.poll.poll(events, timeout) {
                Ok(()) => return Ok(events.iter().count()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Shared wake handle for foreign threads.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Causes a concurrent [`Poller::poll`] to return promptly with a
    /// [`WAKE_TOKEN`] event.
    pub fn wake(&self) -> Result<()> {
        self.waker.wake()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_poll_times_out() {
        let mut poller = Poller::new().unwrap();
        let mut events = Events::with_capacity(16);
        let n = poller
            .poll(&mut events, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_wake_breaks_poll() {
        let mut poller = Poller::new().unwrap();
        let waker = poller.waker();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let start = Instant::now();
        let mut events = Events::with_capacity(16);
        let n = poller.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(n >= 1);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(events.iter().any(|e| e.token() == WAKE_TOKEN));
        handle.join().unwrap();
    }

    #[test]
    fn test_register_reregister_deregister() {
        let poller = Poller::new().unwrap();
        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let token = Token(7);

        poller.register(&mut listener, token, Interest::READABLE).unwrap();
        poller
            .reregister(&mut listener, token, Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        poller.deregister(&mut listener).unwrap();
    }

    #[test]
    fn test_readiness_event_for_listener() {
        let mut poller = Poller::new().unwrap();
        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let token = Token(3);
        poller.register(&mut listener, token, Interest::READABLE).unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        let mut events = Events::with_capacity(16);
        let n = poller.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(n >= 1);
        assert!(events.iter().any(|e| e.token() == token && e.is_readable()));
    }
}

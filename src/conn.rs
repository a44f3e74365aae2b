use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Token, Waker};
use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::buffer_pool::{ring_pool, segment_pool, PooledRing, PooledSegment};
use crate::error::{Error, Result};
use crate::mixed_buffer::MixedBuffer;
use crate::sg_io;
use crate::task_queue::TaskQueue;

pub(crate) enum Transport {
    Tcp(TcpStream),
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

/// A single TCP or UDP endpoint, owned by exactly one event loop for its
/// entire lifetime.
///
/// Everything on `Conn` itself is loop-thread only; foreign threads interact
/// through the [`ConnHandle`] minted by [`Conn::handle`], which marshals work
/// onto the owning loop via its task channel.
///
/// The inbound buffer is a pooled ring; a logical read that spans the ring's
/// wrap point is linearized into a pooled transit scratch buffer, which is
/// invalidated by any discard and released whenever the ring drains empty.
pub struct Conn {
    pub(crate) token: Token,
    pub(crate) transport: Transport,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    pub(crate) opened: bool,
    pub(crate) closing: bool,
    pub(crate) interest: Interest,
    pub(crate) inbound: Option<PooledRing>,
    transit: Option<PooledSegment>,
    pub(crate) outbound: Option<MixedBuffer>,
    ctx: Option<Box<dyn Any + Send>>,
    tasks: Option<Arc<TaskQueue>>,
    waker: Option<Arc<Waker>>,
}

impl Conn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_tcp(
        stream: TcpStream,
        token: Token,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        read_buffer_limit: usize,
        write_ring_size: usize,
        write_buffer_limit: usize,
        tasks: Arc<TaskQueue>,
        waker: Arc<Waker>,
    ) -> Self {
        Conn {
            token,
            transport: Transport::Tcp(stream),
            local_addr,
            remote_addr,
            opened: false,
            closing: false,
            interest: Interest::READABLE,
            inbound: Some(ring_pool().acquire(read_buffer_limit)),
            transit: None,
            outbound: Some(MixedBuffer::new(write_ring_size, write_buffer_limit)),
            ctx: None,
            tasks: Some(tasks),
            waker: Some(waker),
        }
    }

    /// Transient per-datagram view; no buffers, no registration of its own.
    pub(crate) fn new_udp(
        socket: Arc<UdpSocket>,
        token: Token,
        local_addr: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        Conn {
            token,
            transport: Transport::Udp { socket, peer },
            local_addr,
            remote_addr: peer,
            opened: true,
            closing: false,
            interest: Interest::READABLE,
            inbound: None,
            transit: None,
            outbound: None,
            ctx: None,
            tasks: None,
            waker: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// True between a successful `on_opened` and the start of close.
    pub fn is_open(&self) -> bool {
        self.opened && !self.closing
    }

    pub fn context(&self) -> Option<&(dyn Any + Send)> {
        self.ctx.as_deref()
    }

    pub fn set_context(&mut self, ctx: Box<dyn Any + Send>) {
        self.ctx = Some(ctx);
    }

    pub fn take_context(&mut self) -> Option<Box<dyn Any + Send>> {
        self.ctx.take()
    }

    /// All buffered inbound bytes as one contiguous slice. When the content
    /// wraps the ring it is linearized into the transit scratch buffer; the
    /// returned slice is valid until the next discard or write.
    pub fn read(&mut self) -> &[u8] {
        match &self.inbound {
            None => &[],
            Some(ring) if ring.is_empty() => &[],
            Some(ring) if !ring.wraps() => ring.peek_all().0,
            Some(ring) => {
                let transit = self.transit.get_or_insert_with(|| segment_pool().acquire());
                let (head, tail) = ring.peek_all();
                transit.clear();
                transit.extend_from_slice(head);
                transit.extend_from_slice(tail);
                transit.as_slice()
            }
        }
    }

    /// Up to `n` buffered inbound bytes without consuming them. Returns the
    /// number of bytes actually available alongside the slice; `n == 0` or
    /// `n` beyond the buffer length yields everything buffered.
    pub fn read_n(&mut self, n: usize) -> (usize, &[u8]) {
        let len = self.buffer_len();
        if n == 0 || len <= n {
            let bytes = self.read();
            return (len, bytes);
        }
        match &self.inbound {
            None => (0, &[]),
            Some(ring) => {
                let (head, tail) = ring.peek(n);
                if tail.is_empty() {
                    return (n, head);
                }
                let transit = self.transit.get_or_insert_with(|| segment_pool().acquire());
                transit.clear();
                transit.extend_from_slice(head);
                transit.extend_from_slice(tail);
                (n, transit.as_slice())
            }
        }
    }

    /// Consumes `n` bytes from the front of the inbound buffer; returns the
    /// number actually consumed. Invalidates any outstanding `read` slice.
    pub fn shift_n(&mut self, n: usize) -> usize {
        let discarded = match self.inbound.as_deref_mut() {
            Some(ring) => ring.discard(n),
            None => 0,
        };
        if self.inbound.as_deref().map_or(true, |r| r.is_empty()) {
            // Empty ring: return the scratch to its pool to cap idle memory.
            self.transit = None;
        } else if let Some(transit) = self.transit.as_deref_mut() {
            transit.clear();
        }
        discarded
    }

    pub fn buffer_len(&self) -> usize {
        self.inbound.as_deref().map_or(0, |r| r.len())
    }

    pub fn reset_buffer(&mut self) {
        if let Some(ring) = self.inbound.as_deref_mut() {
            ring.reset();
        }
        self.transit = None;
    }

    /// Sends one datagram straight to the peer. UDP only.
    pub fn send_to(&self, buf: &[u8]) -> Result<usize> {
        match &self.transport {
            Transport::Udp { socket, peer } => {
                Ok(sg_io::send_to(socket.as_raw_fd(), buf, peer)?)
            }
            Transport::Tcp(_) => Err(Error::Unsupported("send_to on a TCP connection")),
        }
    }

    /// Mints a thread-safe handle for this connection.
    pub fn handle(&self) -> ConnHandle {
        match &self.transport {
            Transport::Tcp(_) => ConnHandle {
                kind: HandleKind::Tcp {
                    token: self.token,
                    tasks: Arc::clone(self.tasks.as_ref().expect("TCP conn without task queue")),
                    waker: Arc::clone(self.waker.as_ref().expect("TCP conn without waker")),
                },
            },
            Transport::Udp { socket, peer } => ConnHandle {
                kind: HandleKind::Udp {
                    fd: socket.as_raw_fd(),
                    peer: *peer,
                },
            },
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        match &self.transport {
            Transport::Tcp(stream) => stream.as_raw_fd(),
            Transport::Udp { socket, .. } => socket.as_raw_fd(),
        }
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.transport {
            Transport::Tcp(stream) => Some(stream),
            Transport::Udp { .. } => None,
        }
    }

    /// Drops buffer state back into the pools at close.
    pub(crate) fn release(&mut self) {
        self.opened = false;
        self.inbound = None;
        self.transit = None;
        if let Some(outbound) = self.outbound.as_mut() {
            outbound.release();
        }
        self.ctx = None;
    }
}

enum HandleKind {
    Tcp {
        token: Token,
        tasks: Arc<TaskQueue>,
        waker: Arc<Waker>,
    },
    Udp {
        fd: RawFd,
        peer: SocketAddr,
    },
}

impl Clone for HandleKind {
    fn clone(&self) -> Self {
        match self {
            HandleKind::Tcp { token, tasks, waker } => HandleKind::Tcp {
                token: *token,
                tasks: Arc::clone(tasks),
                waker: Arc::clone(waker),
            },
            HandleKind::Udp { fd, peer } => HandleKind::Udp { fd: *fd, peer: *peer },
        }
    }
}

/// Thread-safe view of a connection.
///
/// `async_write`, `wake`, and `close` marshal work onto the owning loop
/// through its bounded task channel and return immediately; `send_to` fires a
/// datagram directly. Operations on a connection that has since closed are
/// silently dropped by the loop.
#[derive(Clone)]
pub struct ConnHandle {
    kind: HandleKind,
}

impl ConnHandle {
    /// Queues `buf` for ordered delivery on the owning loop. Bytes from one
    /// producer thread are written in that thread's submission order.
    pub fn async_write(&self, buf: Vec<u8>) -> Result<()> {
        match &self.kind {
            HandleKind::Tcp { token, tasks, waker } => {
                let token = *token;
                let needs_wake =
                    tasks.submit(Box::new(move |reactor| reactor.conn_write(token, buf)))?;
                if needs_wake {
                    waker.wake()?;
                }
                Ok(())
            }
            HandleKind::Udp { .. } => Err(Error::Unsupported("async_write on a UDP connection")),
        }
    }

    /// Schedules an urgent `react` invocation with an empty frame, enabling
    /// pure cross-thread signalling.
    pub fn wake(&self) -> Result<()> {
        match &self.kind {
            HandleKind::Tcp { token, tasks, waker } => {
                let token = *token;
                let needs_wake =
                    tasks.submit_urgent(Box::new(move |reactor| reactor.wake_conn(token)))?;
                if needs_wake {
                    waker.wake()?;
                }
                Ok(())
            }
            HandleKind::Udp { .. } => Err(Error::Unsupported("wake on a UDP connection")),
        }
    }

    /// Requests close on the owning loop. Pending outbound data is flushed
    /// before the socket is torn down; close is idempotent.
    pub fn close(&self) -> Result<()> {
        match &self.kind {
            HandleKind::Tcp { token, tasks, waker } => {
                let token = *token;
                let needs_wake = tasks.submit(Box::new(move |reactor| {
                    reactor.request_close(token);
                    Ok(())
                }))?;
                if needs_wake {
                    waker.wake()?;
                }
                Ok(())
            }
            HandleKind::Udp { .. } => Err(Error::Unsupported("close on a UDP connection")),
        }
    }

    /// Sends one datagram to this connection's peer. UDP only; safe from any
    /// thread because datagram sends are atomic.
    pub fn send_to(&self, buf: &[u8]) -> Result<usize> {
        match &self.kind {
            HandleKind::Udp { fd, peer } => Ok(sg_io::send_to(*fd, buf, peer)?),
            HandleKind::Tcp { .. } => Err(Error::Unsupported("send_to on a TCP connection")),
        }
    }
}

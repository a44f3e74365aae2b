use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Interest, Token, Waker};
use std::collections::HashMap;
use std::io::{self, IoSlice, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::codec::Codec;
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::event::PollEvent;
use crate::handler::{Action, EventHandler};
use crate::logger::LogLevel;
use crate::net::config::ServerConfig;
use crate::poll::{Poller, WAKE_TOKEN};
use crate::sg_io;
use crate::task_queue::TaskQueue;

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Token reserved for a loop-owned UDP socket.
pub(crate) const UDP_TOKEN: Token = Token(1);

const FIRST_CONN_TOKEN: usize = 2;
const READ_OVERFLOW: usize = 4096;
const MAX_READ_CHUNK: usize = 64 * 1024;
const UDP_DATAGRAM_MAX: usize = 64 * 1024;

/// Cooperative stop shared by every loop, the acceptor, and foreign threads.
/// Tripping it wakes every subscribed poller exactly once.
pub struct ShutdownSignal {
    flag: AtomicBool,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ShutdownSignal {
            flag: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn subscribe(&self, waker: Arc<Waker>) {
        self.wakers.lock().unwrap().push(waker);
        // A subscriber arriving after the trigger still gets its wake.
        if self.is_shut_down() {
            if let Some(waker) = self.wakers.lock().unwrap().last() {
                let _ = waker.wake();
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            for waker in self.wakers.lock().unwrap().iter() {
                let _ = waker.wake();
            }
        }
    }
}

/// Thread-safe handle that stops the server and all of its loops.
#[derive(Clone)]
pub struct ShutdownHandle {
    signal: Arc<ShutdownSignal>,
}

impl ShutdownHandle {
    pub(crate) fn new(signal: Arc<ShutdownSignal>) -> Self {
        ShutdownHandle { signal }
    }

    pub fn shutdown(&self) {
        self.signal.trigger();
    }
}

/// One event loop: a poller, a task channel, and the connections registered
/// against it, serviced strictly sequentially on a single thread.
pub struct Reactor {
    id: usize,
    poller: Poller,
    events: Events,
    batch: Vec<PollEvent>,
    conns: HashMap<Token, Conn>,
    tasks: Arc<TaskQueue>,
    waker: Arc<Waker>,
    handler: Arc<dyn EventHandler>,
    codec: Arc<dyn Codec>,
    config: Arc<ServerConfig>,
    next_token: usize,
    conn_count: Arc<AtomicUsize>,
    shutdown: Arc<ShutdownSignal>,
    scratch: Vec<u8>,
    next_tick: Option<Instant>,
    udp: Option<Arc<UdpSocket>>,
}

/// Result of draining a socket into the inbound ring.
enum DrainOutcome {
    Open,
    PeerClosed,
    Failed(Error),
}

impl Reactor {
    pub(crate) fn new(
        id: usize,
        config: Arc<ServerConfig>,
        handler: Arc<dyn EventHandler>,
        codec: Arc<dyn Codec>,
        shutdown: Arc<ShutdownSignal>,
        enable_tick: bool,
    ) -> Result<Self> {
        let poller = Poller::new()?;
        let waker = poller.waker();
        shutdown.subscribe(Arc::clone(&waker));

        Ok(Reactor {
            id,
            poller,
            events: Events::with_capacity(DEFAULT_EVENTS_CAPACITY),
            batch: Vec::with_capacity(DEFAULT_EVENTS_CAPACITY),
            conns: HashMap::new(),
            tasks: Arc::new(TaskQueue::new(config.task_queue_cap)),
            waker,
            handler,
            codec,
            next_token: FIRST_CONN_TOKEN,
            conn_count: Arc::new(AtomicUsize::new(0)),
            shutdown,
            scratch: vec![0; MAX_READ_CHUNK + READ_OVERFLOW],
            next_tick: enable_tick.then(Instant::now),
            udp: None,
            config,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn tasks(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.tasks)
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub(crate) fn conn_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.conn_count)
    }

    /// Takes ownership of a loop-wide UDP socket; every datagram on it is
    /// dispatched through `react` with a transient connection view.
    pub(crate) fn attach_udp(&mut self, mut socket: UdpSocket) -> Result<()> {
        self.poller.register(&mut socket, UDP_TOKEN, Interest::READABLE)?;
        self.udp = Some(Arc::new(socket));
        Ok(())
    }

    /// Runs the loop until shutdown or a fatal poller error. On either exit
    /// path every remaining connection is closed; a fatal exit additionally
    /// trips the shared shutdown signal so sibling loops stop too.
    pub fn run(&mut self) -> Result<()> {
        let result = self.cycle();
        self.teardown(result.is_err());
        if result.is_err() {
            self.shutdown.trigger();
        }
        result
    }

    fn cycle(&mut self) -> Result<()> {
        loop {
            if self.shutdown.is_shut_down() {
                return Ok(());
            }

            let timeout = self
                .next_tick
                .map(|t| t.saturating_duration_since(Instant::now()));
            self.poller.poll(&mut self.events, timeout)?;

            self.batch.clear();
            self.batch.extend(self.events.iter().map(PollEvent::from));
            for i in 0..self.batch.len() {
                let ev = self.batch[i];
                self.dispatch(ev);
            }

            self.run_tasks();
            self.maybe_tick();
        }
    }

    fn dispatch(&mut self, ev: PollEvent) {
        let token = ev.token();
        if token == WAKE_TOKEN {
            // Wake event; the task drain below this dispatch pass picks the
            // submitted work up.
            return;
        }
        if token == UDP_TOKEN && self.udp.is_some() {
            self.handle_udp_read();
            return;
        }

        if ev.is_error() {
            self.close_now(
                token,
                Some(Error::Io(io::Error::other("socket error reported by poller"))),
            );
            return;
        }
        if ev.is_readable() {
            self.handle_read(token);
        }
        if ev.is_writable() {
            self.handle_write(token);
        }
    }

    fn handle_read(&mut self, token: Token) {
        let handler = Arc::clone(&self.handler);
        let codec = Arc::clone(&self.codec);

        let drain = {
            let conn = match self.conns.get_mut(&token) {
                Some(conn) if !conn.closing => conn,
                _ => return,
            };
            drain_socket(&mut self.scratch, conn)
        };
        match drain {
            DrainOutcome::Open => {}
            DrainOutcome::PeerClosed => {
                self.close_now(token, None);
                return;
            }
            DrainOutcome::Failed(e) => {
                self.close_now(token, Some(e));
                return;
            }
        }

        // Consume as many complete frames as the inbound buffer holds.
        loop {
            let decoded = match self.conns.get_mut(&token) {
                Some(conn) if !conn.closing => codec.decode(conn),
                _ => return,
            };
            match decoded {
                Ok(Some(frame)) => {
                    let (out, action) = match self.conns.get_mut(&token) {
                        Some(conn) => handler.react(&frame, conn),
                        None => return,
                    };
                    if let Some(out) = out {
                        if let Err(e) = self.conn_write(token, out) {
                            self.config
                                .logger
                                .log(LogLevel::Warn, &format!("response write failed: {}", e));
                        }
                    }
                    match action {
                        Action::None => {}
                        Action::Close => {
                            self.request_close(token);
                            return;
                        }
                        Action::Shutdown => {
                            self.shutdown.trigger();
                            return;
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    self.close_now(token, Some(e));
                    return;
                }
            }
        }
    }

    fn handle_write(&mut self, token: Token) {
        let handler = Arc::clone(&self.handler);
        let flushed = {
            let conn = match self.conns.get_mut(&token) {
                Some(conn) => conn,
                None => return,
            };
            flush_outbound(handler.as_ref(), conn)
        };
        match flushed {
            Ok(true) => {
                let closing = self.conns.get(&token).map_or(false, |c| c.closing);
                if closing {
                    self.close_now(token, None);
                } else if let Err(e) = self.rearm(token, Interest::READABLE) {
                    self.close_now(token, Some(e));
                }
            }
            Ok(false) => {}
            Err(e) => self.close_now(token, Some(e)),
        }
    }

    fn rearm(&mut self, token: Token, interest: Interest) -> Result<()> {
        let poller = &self.poller;
        if let Some(conn) = self.conns.get_mut(&token) {
            if conn.interest != interest {
                conn.interest = interest;
                if let Some(stream) = conn.stream_mut() {
                    poller.reregister(stream, token, interest)?;
                }
            }
        }
        Ok(())
    }

    /// Registers a freshly accepted stream, fires `on_opened`, and performs
    /// the immediate write it may request.
    pub(crate) fn attach_tcp(&mut self, mut stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let local = stream.local_addr()?;
        let token = self.alloc_token();
        self.poller.register(&mut stream, token, Interest::READABLE)?;

        let mut conn = Conn::new_tcp(
            stream,
            token,
            local,
            remote,
            self.config.read_buffer_limit,
            self.config.write_ring_size,
            self.config.write_buffer_limit,
            Arc::clone(&self.tasks),
            Arc::clone(&self.waker),
        );

        let handler = Arc::clone(&self.handler);
        let (out, action) = handler.on_opened(&mut conn);
        conn.opened = true;
        self.conns.insert(token, conn);
        self.conn_count.fetch_add(1, Ordering::Relaxed);

        if let Some(out) = out {
            if !out.is_empty() {
                let write_result = {
                    let poller = &self.poller;
                    match self.conns.get_mut(&token) {
                        // The greeting is written raw: framing only applies to
                        // `react` responses and `async_write` payloads.
                        Some(conn) => write_or_buffer(poller, handler.as_ref(), conn, &out),
                        None => Ok(()),
                    }
                };
                if let Err(e) = write_result {
                    match e {
                        Error::BufferOverflow { .. } => self
                            .config
                            .logger
                            .log(LogLevel::Warn, &format!("greeting dropped: {}", e)),
                        e => {
                            self.close_now(token, Some(e));
                            return Ok(());
                        }
                    }
                }
            }
        }

        match action {
            Action::None => {}
            Action::Close => self.request_close(token),
            Action::Shutdown => self.shutdown.trigger(),
        }
        Ok(())
    }

    fn alloc_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1);
            if self.next_token < FIRST_CONN_TOKEN {
                self.next_token = FIRST_CONN_TOKEN;
            }
            if !self.conns.contains_key(&token) {
                return token;
            }
        }
    }

    /// The ordered write path shared by `react` responses and `async_write`.
    /// Hard I/O failures close the connection here; resource exhaustion is
    /// returned to the caller and the connection continues.
    pub(crate) fn conn_write(&mut self, token: Token, buf: Vec<u8>) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let codec = Arc::clone(&self.codec);

        let result = {
            let poller = &self.poller;
            match self.conns.get_mut(&token) {
                Some(conn) if conn.opened && !conn.closing => {
                    match codec.encode(conn, &buf) {
                        Ok(packet) => write_or_buffer(poller, handler.as_ref(), conn, &packet),
                        Err(e) => Err(e),
                    }
                }
                // The connection went away first; async writers race close by
                // design, so this is a silent no-op.
                _ => return Ok(()),
            }
        };

        match result {
            Ok(()) => Ok(()),
            err @ Err(Error::BufferOverflow { .. }) | err @ Err(Error::Codec(_)) => err,
            Err(e) => {
                self.close_now(token, Some(e));
                Ok(())
            }
        }
    }

    /// Urgent cross-thread signal: `react` with an empty frame.
    pub(crate) fn wake_conn(&mut self, token: Token) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let (out, action) = match self.conns.get_mut(&token) {
            Some(conn) if conn.opened && !conn.closing => handler.react(&[], conn),
            _ => return Ok(()),
        };
        if let Some(out) = out {
            self.conn_write(token, out)?;
        }
        match action {
            Action::None => {}
            Action::Close => self.request_close(token),
            Action::Shutdown => self.shutdown.trigger(),
        }
        Ok(())
    }

    /// Begins an orderly close: pending outbound bytes are flushed first,
    /// then the connection is finalized. Idempotent.
    pub(crate) fn request_close(&mut self, token: Token) {
        let pending = {
            let conn = match self.conns.get_mut(&token) {
                Some(conn) => conn,
                None => return,
            };
            if conn.closing {
                return;
            }
            conn.outbound.as_ref().map_or(false, |o| !o.is_empty())
        };

        if !pending {
            self.close_now(token, None);
            return;
        }

        let armed = {
            let poller = &self.poller;
            match self.conns.get_mut(&token) {
                Some(conn) => {
                    conn.closing = true;
                    arm_write(poller, conn)
                }
                None => Ok(()),
            }
        };
        if let Err(e) = armed {
            self.close_now(token, Some(e));
        }
    }

    /// Finalizes a close: fires `on_closed` (iff the open callback fired),
    /// deregisters, returns pooled buffers, and drops the fd.
    pub(crate) fn close_now(&mut self, token: Token, err: Option<Error>) {
        let mut conn = match self.conns.remove(&token) {
            Some(conn) => conn,
            None => return,
        };

        let mut action = Action::None;
        if conn.opened {
            let handler = Arc::clone(&self.handler);
            action = handler.on_closed(&mut conn, err.as_ref());
        }

        if let Some(stream) = conn.stream_mut() {
            if let Err(e) = self.poller.deregister(stream) {
                self.config
                    .logger
                    .log(LogLevel::Debug, &format!("deregister failed: {}", e));
            }
        }
        conn.release();
        self.conn_count.fetch_sub(1, Ordering::Relaxed);
        drop(conn);

        if action == Action::Shutdown {
            self.shutdown.trigger();
        }
    }

    fn run_tasks(&mut self) {
        let tasks = Arc::clone(&self.tasks);
        tasks.begin_drain();
        while let Some(task) = tasks.pop() {
            if let Err(e) = task(self) {
                self.config
                    .logger
                    .log(LogLevel::Warn, &format!("loop {} task failed: {}", self.id, e));
            }
            if self.shutdown.is_shut_down() {
                return;
            }
        }
    }

    fn maybe_tick(&mut self) {
        let deadline = match self.next_tick {
            Some(deadline) => deadline,
            None => return,
        };
        if Instant::now() < deadline {
            return;
        }
        let (delay, action) = self.handler.tick();
        self.next_tick = if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        };
        if action == Action::Shutdown {
            self.shutdown.trigger();
        }
    }

    fn handle_udp_read(&mut self) {
        let socket = match &self.udp {
            Some(socket) => Arc::clone(socket),
            None => return,
        };
        let handler = Arc::clone(&self.handler);
        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        if self.scratch.len() < UDP_DATAGRAM_MAX {
            self.scratch.resize(UDP_DATAGRAM_MAX, 0);
        }

        loop {
            match socket.recv_from(&mut self.scratch) {
                Ok((n, peer)) => {
                    let mut conn = Conn::new_udp(Arc::clone(&socket), UDP_TOKEN, local, peer);
                    let (out, action) = handler.react(&self.scratch[..n], &mut conn);
                    if let Some(out) = out {
                        handler.pre_write(&mut conn);
                        match conn.send_to(&out) {
                            Ok(sent) => handler.after_write(&mut conn, sent),
                            Err(e) => self
                                .config
                                .logger
                                .log(LogLevel::Warn, &format!("udp reply to {} failed: {}", peer, e)),
                        }
                    }
                    if action == Action::Shutdown {
                        self.shutdown.trigger();
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.config
                        .logger
                        .log(LogLevel::Error, &format!("udp recv failed: {}", e));
                    return;
                }
            }
        }
    }

    fn teardown(&mut self, terminated: bool) {
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            let err = terminated.then_some(Error::LoopTerminated);
            self.close_now(token, err);
        }
    }
}

/// Reads the socket into the inbound ring until `WouldBlock` or a short read.
/// The scratch target is sized to the ring's remaining allowance plus one
/// page, so a peer that outruns the ring's growth limit is detected here.
fn drain_socket(scratch: &mut Vec<u8>, conn: &mut Conn) -> DrainOutcome {
    loop {
        let allowance = match conn.inbound.as_deref() {
            Some(ring) => ring.allowance(),
            None => return DrainOutcome::Open,
        };
        let want = allowance.min(MAX_READ_CHUNK) + READ_OVERFLOW;
        if scratch.len() < want {
            scratch.resize(want, 0);
        }

        let read = match conn.stream_mut() {
            Some(stream) => stream.read(&mut scratch[..want]),
            None => return DrainOutcome::Open,
        };
        match read {
            Ok(0) => return DrainOutcome::PeerClosed,
            Ok(n) => {
                let appended = match conn.inbound.as_deref_mut() {
                    Some(ring) => ring.write(&scratch[..n]),
                    None => Ok(0),
                };
                if let Err(e) = appended {
                    return DrainOutcome::Failed(e);
                }
                if n < want {
                    return DrainOutcome::Open;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return DrainOutcome::Open,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return DrainOutcome::Failed(e.into()),
        }
    }
}

/// Flushes the outbound buffer with gathered writes, at most `IOV_MAX`
/// segments per syscall, until it drains or the kernel pushes back.
/// `Ok(true)` means the buffer fully drained.
fn flush_outbound(handler: &dyn EventHandler, conn: &mut Conn) -> Result<bool> {
    if conn.outbound.as_ref().map_or(true, |o| o.is_empty()) {
        return Ok(true);
    }

    handler.pre_write(conn);
    let fd = conn.raw_fd();
    let mut total = 0usize;
    let result = loop {
        let (attempted, written) = {
            let outbound = match conn.outbound.as_ref() {
                Some(outbound) if !outbound.is_empty() => outbound,
                _ => break Ok(true),
            };
            // A deep backlog can hold more segments than one writev accepts;
            // under edge-triggered readiness the loop must keep going until
            // the socket itself refuses, or the tail would never flush.
            let slices = outbound.peek();
            let take = slices.len().min(sg_io::IOV_MAX);
            let iovecs: Vec<IoSlice<'_>> =
                slices[..take].iter().map(|s| IoSlice::new(s)).collect();
            let attempted: usize = slices[..take].iter().map(|s| s.len()).sum();
            (attempted, sg_io::writev(fd, &iovecs))
        };
        match written {
            Ok(n) => {
                if let Some(outbound) = conn.outbound.as_mut() {
                    outbound.discard(n);
                }
                total += n;
                if n < attempted {
                    // Socket buffer is full; the next writable edge resumes.
                    break Ok(false);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(false),
            Err(e) => break Err(e.into()),
        }
    };
    if total > 0 {
        handler.after_write(conn, total);
    }
    result
}

/// The synchronous ordered write path: append when data is already pending
/// (a direct syscall would reorder), otherwise write directly and buffer
/// whatever the kernel refused, arming write interest for the remainder.
fn write_or_buffer(
    poller: &Poller,
    handler: &dyn EventHandler,
    conn: &mut Conn,
    packet: &[u8],
) -> Result<()> {
    if packet.is_empty() {
        return Ok(());
    }
    handler.pre_write(conn);

    let pending = conn.outbound.as_ref().map_or(false, |o| !o.is_empty());
    if pending {
        if let Some(outbound) = conn.outbound.as_mut() {
            outbound.write(packet)?;
        }
        handler.after_write(conn, packet.len());
        return Ok(());
    }

    let fd = conn.raw_fd();
    match sg_io::writev(fd, &[IoSlice::new(packet)]) {
        Ok(n) if n == packet.len() => {
            handler.after_write(conn, n);
            Ok(())
        }
        Ok(n) => {
            if let Some(outbound) = conn.outbound.as_mut() {
                outbound.write(&packet[n..])?;
            }
            arm_write(poller, conn)?;
            handler.after_write(conn, packet.len());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            if let Some(outbound) = conn.outbound.as_mut() {
                outbound.write(packet)?;
            }
            arm_write(poller, conn)?;
            handler.after_write(conn, packet.len());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn arm_write(poller: &Poller, conn: &mut Conn) -> Result<()> {
    let interest = Interest::READABLE | Interest::WRITABLE;
    if conn.interest != interest {
        conn.interest = interest;
        let token = conn.token;
        if let Some(stream) = conn.stream_mut() {
            poller.reregister(stream, token, interest)?;
        }
    }
    Ok(())
}

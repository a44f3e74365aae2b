use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::Builder;

use crate::codec::{Codec, Passthrough};
use crate::error::{Error, Result};
use crate::handler::{Action, EventHandler, ServerInfo};
use crate::logger::LogLevel;
use crate::net::config::{LoadBalance, Protocol, ServerConfig};
use crate::poll::Poller;
use crate::reactor::{Reactor, ShutdownHandle, ShutdownSignal};
use crate::sg_io;
use crate::task_queue::TaskQueue;

const LISTENER_TOKEN: Token = Token(1);

/// Producer-side view of one event loop, held by the acceptor.
struct LoopHandle {
    tasks: Arc<TaskQueue>,
    waker: Arc<Waker>,
    conn_count: Arc<AtomicUsize>,
}

/// A fixed pool of event loops behind one listening socket.
///
/// The acceptor runs on the thread calling [`Server::run`]; it performs no
/// I/O besides `accept`, hands each accepted socket to exactly one loop
/// through that loop's task channel, and never touches a connection again.
pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn EventHandler>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    reactors: Option<Vec<Reactor>>,
    loops: Vec<LoopHandle>,
    shutdown: Arc<ShutdownSignal>,
    next_loop: usize,
}

impl Server {
    /// Builds a server with the default passthrough codec.
    pub fn new<H>(config: ServerConfig, handler: H) -> Result<Self>
    where
        H: EventHandler,
    {
        Self::with_codec(config, handler, Passthrough)
    }

    pub fn with_codec<H, C>(config: ServerConfig, handler: H, codec: C) -> Result<Self>
    where
        H: EventHandler,
        C: Codec,
    {
        let config = Arc::new(config);
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        let codec: Arc<dyn Codec> = Arc::new(codec);
        let shutdown = ShutdownSignal::new();

        let event_loops = match config.protocol {
            // One unconnected UDP socket cannot usefully fan out without
            // SO_REUSEPORT; it lives on a single loop.
            Protocol::Udp => 1,
            Protocol::Tcp if config.event_loops == 0 => default_loop_count(),
            Protocol::Tcp => config.event_loops,
        };

        let mut reactors = Vec::with_capacity(event_loops);
        for id in 0..event_loops {
            reactors.push(Reactor::new(
                id,
                Arc::clone(&config),
                Arc::clone(&handler),
                Arc::clone(&codec),
                Arc::clone(&shutdown),
                config.ticker && id == 0,
            )?);
        }

        let (listener, local_addr) = match config.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(config.addr)?;
                let local_addr = listener.local_addr()?;
                (Some(listener), local_addr)
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(config.addr)?;
                let local_addr = socket.local_addr()?;
                reactors[0].attach_udp(socket)?;
                (None, local_addr)
            }
        };

        let loops = reactors
            .iter()
            .map(|reactor| LoopHandle {
                tasks: reactor.tasks(),
                waker: reactor.waker(),
                conn_count: reactor.conn_count(),
            })
            .collect();

        Ok(Server {
            config,
            handler,
            listener,
            local_addr,
            reactors: Some(reactors),
            loops,
            shutdown,
            next_loop: 0,
        })
    }

    /// The bound address; useful when configured with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently attached across all loops.
    pub fn connection_count(&self) -> usize {
        self.loops
            .iter()
            .map(|l| l.conn_count.load(Ordering::Relaxed))
            .sum()
    }

    /// Thread-safe handle that stops this server and all of its loops.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(Arc::clone(&self.shutdown))
    }

    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// Spawns the loop threads and runs the acceptor on the calling thread.
    /// Blocks until shutdown, then joins every loop and fires `on_shutdown`.
    pub fn run(&mut self) -> Result<()> {
        let info = ServerInfo {
            local_addr: self.local_addr,
            event_loops: self.loops.len(),
        };
        if self.handler.on_init_complete(&info) == Action::Shutdown {
            self.shutdown.trigger();
            self.handler.on_shutdown(&info);
            return Ok(());
        }

        let reactors = self
            .reactors
            .take()
            .ok_or_else(|| Error::Configuration("server already ran".into()))?;

        let mut threads = Vec::with_capacity(reactors.len());
        for mut reactor in reactors {
            let logger = Arc::clone(&self.config.logger);
            let thread = Builder::new()
                .name(format!("millrace-loop-{}", reactor.id()))
                .spawn(move || {
                    if let Err(e) = reactor.run() {
                        logger.log(LogLevel::Error, &format!("event loop terminated: {}", e));
                    }
                })?;
            threads.push(thread);
        }

        let accept_result = self.accept_loop();

        self.shutdown.trigger();
        for thread in threads {
            let _ = thread.join();
        }
        self.handler.on_shutdown(&info);
        accept_result
    }

    fn accept_loop(&mut self) -> Result<()> {
        let mut poller = Poller::new()?;
        self.shutdown.subscribe(poller.waker());
        let mut events = Events::with_capacity(64);

        let mut listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                // UDP mode: the socket lives on loop 0, nothing to accept.
                // Park until shutdown wakes us.
                while !self.shutdown.is_shut_down() {
                    poller.poll(&mut events, None)?;
                }
                return Ok(());
            }
        };
        poller.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        while !self.shutdown.is_shut_down() {
            poller.poll(&mut events, None)?;
            if !events.iter().any(|e| e.token() == LISTENER_TOKEN) {
                continue;
            }
            loop {
                match listener.accept() {
                    Ok((stream, remote)) => self.dispatch_conn(stream, remote),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.config
                            .logger
                            .log(LogLevel::Error, &format!("accept failed: {}", e));
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch_conn(&mut self, stream: TcpStream, remote: SocketAddr) {
        if self.config.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                self.config
                    .logger
                    .log(LogLevel::Warn, &format!("set_nodelay failed for {}: {}", remote, e));
            }
        }
        if let Some(keep_alive) = self.config.keep_alive {
            if let Err(e) = sg_io::set_keep_alive(stream.as_raw_fd(), keep_alive.as_secs() as u32) {
                self.config
                    .logger
                    .log(LogLevel::Warn, &format!("keepalive failed for {}: {}", remote, e));
            }
        }

        let idx = self.pick_loop();
        let target = &self.loops[idx];
        let submitted = target
            .tasks
            .submit(Box::new(move |reactor| reactor.attach_tcp(stream, remote)));
        match submitted {
            Ok(true) => {
                if let Err(e) = target.waker.wake() {
                    self.config
                        .logger
                        .log(LogLevel::Error, &format!("loop wake failed: {}", e));
                }
            }
            Ok(false) => {}
            Err(e) => {
                // Dropping the stream closes the socket; the peer sees a reset.
                self.config
                    .logger
                    .log(LogLevel::Warn, &format!("connection from {} dropped: {}", remote, e));
            }
        }
    }

    fn pick_loop(&mut self) -> usize {
        match self.config.load_balance {
            LoadBalance::RoundRobin => {
                let idx = self.next_loop;
                self.next_loop = (self.next_loop + 1) % self.loops.len();
                idx
            }
            LoadBalance::LeastConnections => self
                .loops
                .iter()
                .enumerate()
                .min_by_key(|(_, l)| l.conn_count.load(Ordering::Relaxed))
                .map(|(idx, _)| idx)
                .unwrap_or(0),
        }
    }
}

fn default_loop_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

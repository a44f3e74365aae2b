use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use millrace::{
    Action, Conn, EventHandler, MixedBuffer, RingBuffer, Server, ServerConfig, ShutdownHandle,
};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;

#[derive(Clone, Default)]
struct BenchEcho;

impl EventHandler for BenchEcho {
    fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (Some(frame.to_vec()), Action::None)
    }
}

struct ServerHandle {
    shutdown: ShutdownHandle,
    addr: std::net::SocketAddr,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    fn start() -> Self {
        let config = ServerConfig::builder()
            .addr("127.0.0.1:0".parse().unwrap())
            .event_loops(2)
            .build();
        let mut server = Server::new(config, BenchEcho).unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let thread = thread::spawn(move || {
            let _ = server.run();
        });
        ServerHandle {
            shutdown,
            addr,
            thread: Some(thread),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn bench_echo_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("echo_round_trip");

    for msg_size in [128usize, 1024, 4096] {
        group.throughput(Throughput::Bytes(msg_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(msg_size), &msg_size, |b, &size| {
            let server = ServerHandle::start();
            let mut client = TcpStream::connect(server.addr).unwrap();
            client.set_nodelay(true).unwrap();
            let payload = vec![0x5au8; size];
            let mut back = vec![0u8; size];

            b.iter(|| {
                client.write_all(&payload).unwrap();
                client.read_exact(&mut back).unwrap();
                black_box(&back);
            });
        });
    }
    group.finish();
}

fn bench_ring_buffer_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");
    group.throughput(Throughput::Bytes(4096));

    group.bench_function("write_peek_discard_4k", |b| {
        let mut ring = RingBuffer::with_capacity(64 * 1024);
        let data = vec![7u8; 4096];
        b.iter(|| {
            ring.write(&data).unwrap();
            let (head, tail) = ring.peek_all();
            black_box((head.len(), tail.len()));
            ring.discard(4096);
        });
    });
    group.finish();
}

fn bench_mixed_buffer_escalation(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_buffer");
    group.throughput(Throughput::Bytes(64 * 1024));

    group.bench_function("spill_and_drain_64k", |b| {
        let data = vec![3u8; 8 * 1024];
        b.iter(|| {
            let mut buf = MixedBuffer::new(16 * 1024, 0);
            for _ in 0..8 {
                buf.write(&data).unwrap();
            }
            let total: usize = buf.peek().iter().map(|s| s.len()).sum();
            buf.discard(total);
            black_box(buf.is_empty());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_echo_round_trip,
    bench_ring_buffer_ops,
    bench_mixed_buffer_escalation
);
criterion_main!(benches);

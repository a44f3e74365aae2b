use millrace::{Action, Conn, EventHandler, LogLevel, Logger, Result, Server, ServerConfig};
use std::sync::Arc;

/// Echoes every frame back to its sender.
#[derive(Clone, Default)]
struct EchoHandler;

impl EventHandler for EchoHandler {
    fn on_opened(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        println!("[INFO] client connected: {}", conn.remote_addr());
        (None, Action::None)
    }

    fn on_closed(&self, conn: &mut Conn, err: Option<&millrace::Error>) -> Action {
        match err {
            Some(e) => println!("[INFO] client {} closed: {}", conn.remote_addr(), e),
            None => println!("[INFO] client {} disconnected", conn.remote_addr()),
        }
        Action::None
    }

    fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (Some(frame.to_vec()), Action::None)
    }
}

struct StdoutLogger;

impl Logger for StdoutLogger {
    fn log(&self, level: LogLevel, message: &str) {
        println!("[{:?}] {}", level, message);
    }
}

fn main() -> Result<()> {
    let config = ServerConfig::builder()
        .addr("127.0.0.1:7878".parse().unwrap())
        .logger(Arc::new(StdoutLogger))
        .build();

    println!("[INFO] echo server listening on {}", config.addr);
    Server::new(config, EchoHandler)?.run()
}

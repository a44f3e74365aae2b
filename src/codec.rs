use crate::conn::Conn;
use crate::error::Result;

/// Per-connection framer.
///
/// `decode` runs on the loop thread from the read path and may only inspect
/// the inbound side of the connection (`read`, `read_n`, `shift_n`,
/// `buffer_len`); it must not touch outbound state. Returning `Ok(None)`
/// means "need more data" and ends the decode loop without error; returning
/// `Err` is fatal to the connection.
///
/// `encode` runs on the loop thread just before bytes are enqueued to the
/// outbound buffer.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, conn: &mut Conn, buf: &[u8]) -> Result<Vec<u8>>;

    fn decode(&self, conn: &mut Conn) -> Result<Option<Vec<u8>>>;
}

/// Default codec: every read burst is one frame, writes pass through
/// unframed.
#[derive(Default, Clone)]
pub struct Passthrough;

impl Codec for Passthrough {
    fn encode(&self, _conn: &mut Conn, buf: &[u8]) -> Result<Vec<u8>> {
        Ok(buf.to_vec())
    }

    fn decode(&self, conn: &mut Conn) -> Result<Option<Vec<u8>>> {
        if conn.buffer_len() == 0 {
            return Ok(None);
        }
        let frame = conn.read().to_vec();
        conn.shift_n(frame.len());
        Ok(Some(frame))
    }
}

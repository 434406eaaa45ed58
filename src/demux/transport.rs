//! The physical transport under the demultiplexer, and the framing used by
//! the socket layer: every message is a 4-byte little-endian length prefix
//! followed by exactly that many payload bytes.

use std::io::{Read, Write};

use crate::channel::DuplexChannel;
use crate::core::Result;

/// A framed, bidirectional byte transport. One transport carries every
/// logical channel of a demultiplexer.
pub trait Transport: Send + Sync {
    fn send_frame(&self, frame: &[u8]) -> Result<()>;

    /// Block until the next frame arrives. Fails with `Disconnected` once the
    /// peer is gone.
    fn recv_frame(&self) -> Result<Vec<u8>>;

    /// Tear the transport down, waking any blocked `recv_frame`.
    fn close(&self);
}

/// In-process transport endpoint: a pair of these stands in for a socket.
pub type InMemoryTransport = DuplexChannel<Vec<u8>, Vec<u8>>;

impl Transport for InMemoryTransport {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.send(frame.to_vec())
    }

    fn recv_frame(&self) -> Result<Vec<u8>> {
        self.recv()
    }

    fn close(&self) {
        self.disconnect();
    }
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Read one length-prefixed frame.
pub fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

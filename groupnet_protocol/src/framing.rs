// Length-delimited message framing over TCP.
//
// Wire format: a 4-byte big-endian length prefix followed by that many bytes
// of JSON-serialized message. Two styles of access are provided:
//
// - `write_message` / `read_message`: blocking helpers over any
//   `Write`/`Read`. The relay's per-connection threads use these; a partial
//   read or write simply blocks inside `read_exact`/`write_all`.
// - `encode_frame` + `FrameBuffer`: for non-blocking sockets. The sender
//   keeps encoded bytes in its own buffer and retries whatever the socket
//   did not accept; the receiver appends whatever arrived to a
//   `FrameBuffer` and pulls out frames only once they are complete.
//
// A `MAX_MESSAGE_SIZE` constant (16 MB) protects against unbounded allocation
// from malformed or malicious length prefixes.

use std::io::{self, Read, Write};

use serde::Serialize;

/// Maximum allowed message size (16 MB). Protects against unbounded allocation
/// from malformed length prefixes.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Write a length-delimited message: 4-byte big-endian length, then payload.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-delimited message: 4-byte big-endian length, then payload.
///
/// Returns `UnexpectedEof` if the stream closes cleanly before or during a
/// message. Returns `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf)?;
    let len = checked_len(len_buf)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Prefix `msg` with its length, producing the exact bytes to put on the wire.
pub fn encode_frame(msg: &[u8]) -> io::Result<Vec<u8>> {
    let len = msg.len();
    let len_prefix = match u32::try_from(len) {
        Ok(n) if n <= MAX_MESSAGE_SIZE => n.to_be_bytes(),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
            ));
        }
    };
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + len);
    frame.extend_from_slice(&len_prefix);
    frame.extend_from_slice(msg);
    Ok(frame)
}

/// Serialize `msg` to JSON and frame it.
pub fn encode_message<T: Serialize>(msg: &T) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    encode_frame(&json)
}

fn checked_len(len_buf: [u8; LENGTH_PREFIX_SIZE]) -> io::Result<usize> {
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    Ok(len as usize)
}

/// Reassembly buffer for frames arriving in arbitrary pieces.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pop the next complete frame payload, or `None` if the declared length
    /// has not fully arrived yet. Leftover bytes stay buffered.
    ///
    /// Returns `InvalidData` if the declared length exceeds
    /// `MAX_MESSAGE_SIZE`; the buffer is unusable after that.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len = checked_len([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])?;
        let end = LENGTH_PREFIX_SIZE + len;
        if self.buf.len() < end {
            return Ok(None);
        }
        let frame = self.buf[LENGTH_PREFIX_SIZE..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(frame))
    }
}

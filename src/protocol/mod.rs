//! Wire protocol: length-prefixed typed messages, big-endian integers,
//! inline sub-streams for bulk payloads, one request/response in flight
//! per connection at a time.

pub mod messages;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

pub use messages::Message;

/// Both sides must agree on this before any other message is exchanged.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("wrong protocol version: peer sent {0}, expected {PROTOCOL_VERSION}")]
    WrongVersion(u32),
    #[error("unexpected reply: expected {expected}, got message type {got}")]
    UnexpectedReply { expected: &'static str, got: u8 },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("frame exceeds maximum size: {0} bytes")]
    OverSizeFrame(u32),
    #[error("sub-stream not fully consumed before next request")]
    SubStreamNotConsumed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Frames larger than this are rejected outright as a malformed/hostile
/// peer rather than risking an unbounded allocation.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read one `{u32 length, u8 type, body}` frame's raw body bytes (the
/// length field counts the whole frame including itself and the type
/// byte). Message-specific decoding happens in [`messages`].
pub fn read_frame<R: Read>(input: &mut R) -> Result<(u8, Vec<u8>), ProtocolError> {
    let total_len = input.read_u32::<BigEndian>()?;
    if total_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::OverSizeFrame(total_len));
    }
    if total_len < 5 {
        return Err(ProtocolError::Malformed(format!(
            "frame length {total_len} too short to contain a type byte"
        )));
    }
    let msg_type = input.read_u8()?;
    let body_len = total_len as usize - 5;
    let mut body = vec![0u8; body_len];
    input.read_exact(&mut body)?;
    Ok((msg_type, body))
}

pub fn write_frame<W: Write>(out: &mut W, msg_type: u8, body: &[u8]) -> Result<(), ProtocolError> {
    let total_len = 5 + body.len();
    if total_len > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::OverSizeFrame(total_len as u32));
    }
    out.write_u32::<BigEndian>(total_len as u32)?;
    out.write_u8(msg_type)?;
    out.write_all(body)?;
    Ok(())
}

/// A sub-stream attached after certain messages: a sequence of
/// `{u32 len, bytes}` chunks terminated by a zero-length chunk. Bulk
/// payloads (encoded objects, directories) ride here rather than in the
/// framed message body so they can be arbitrarily large.
pub struct SubStreamWriter<'a, W: Write> {
    out: &'a mut W,
}

impl<'a, W: Write> SubStreamWriter<'a, W> {
    pub fn new(out: &'a mut W) -> Self {
        Self { out }
    }

    pub fn write_from<R: Read>(&mut self, mut source: R, chunk_size: usize) -> Result<(), ProtocolError> {
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.out.write_u32::<BigEndian>(n as u32)?;
            self.out.write_all(&buf[..n])?;
        }
        self.out.write_u32::<BigEndian>(0)?;
        Ok(())
    }
}

/// Reads a sub-stream's chunks through as plain [`Read`], terminating at
/// the zero-length chunk. Tracks whether it was fully drained so the
/// caller can enforce "no partial sub-stream consumption before the next
/// request" (see [`ProtocolError::SubStreamNotConsumed`]).
pub struct SubStreamReader<'a, R: Read> {
    input: &'a mut R,
    current: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<'a, R: Read> SubStreamReader<'a, R> {
    pub fn new(input: &'a mut R) -> Self {
        Self {
            input,
            current: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume and discard the remainder without copying it anywhere
    /// useful — used when a caller needs to resynchronise the connection
    /// after deciding not to read a sub-stream's payload.
    pub fn drain(&mut self) -> io::Result<()> {
        let mut sink = io::sink();
        io::copy(self, &mut sink)?;
        Ok(())
    }
}

impl<'a, R: Read> Read for SubStreamReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            let chunk_len = self.input.read_u32::<BigEndian>()?;
            if chunk_len == 0 {
                self.finished = true;
                return Ok(0);
            }
            self.current = vec![0u8; chunk_len as usize];
            self.input.read_exact(&mut self.current)?;
            self.pos = 0;
        }
    }
}

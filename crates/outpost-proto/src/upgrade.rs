//! Frames of the executable upgrade handshake
//!
//! The handshake runs on a dedicated transport, one request and one reply at
//! a time:
//!
//! ```text
//! server                         agent
//!   READY            ──►
//!                    ◄──  PATH + executable path
//!   SIZE + u64       ──►
//!   CHUNK + u64 + data ──►
//!                    ◄──  ACK + u64 received      (per chunk)
//!                    ◄──  DONE
//!                    ◄──  STARTED
//! ```
//!
//! Any failure on the agent side is reported as `ERROR + message`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::{CodecError, Frame};

/// Size of each executable chunk sent by the server (1MB)
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Server to agent
pub mod request {
    pub const READY: u8 = 0x00;
    pub const SIZE: u8 = 0x01;
    pub const CHUNK: u8 = 0x02;
}

/// Agent to server
pub mod reply {
    pub const PATH: u8 = 0x00;
    pub const ACK: u8 = 0x00;
    pub const DONE: u8 = 0x01;
    pub const STARTED: u8 = 0x02;
    pub const ERROR: u8 = 0x99;
}

pub fn ready() -> Frame {
    Frame::bare(request::READY)
}

pub fn size(total: u64) -> Frame {
    Frame::new(request::SIZE, Bytes::copy_from_slice(&total.to_le_bytes()))
}

pub fn chunk(offset: u64, data: &[u8]) -> Frame {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u64_le(offset);
    buf.put_slice(data);
    Frame::new(request::CHUNK, buf.freeze())
}

pub fn path(path: &str) -> Frame {
    Frame::new(reply::PATH, Bytes::copy_from_slice(path.as_bytes()))
}

pub fn ack(received: u64) -> Frame {
    Frame::new(reply::ACK, Bytes::copy_from_slice(&received.to_le_bytes()))
}

pub fn done() -> Frame {
    Frame::bare(reply::DONE)
}

pub fn started() -> Frame {
    Frame::bare(reply::STARTED)
}

pub fn error(message: impl AsRef<str>) -> Frame {
    Frame::new(reply::ERROR, Bytes::copy_from_slice(message.as_ref().as_bytes()))
}

/// The u64 carried by size and ack frames
pub fn parse_u64(frame: &Frame) -> Result<u64, CodecError> {
    if frame.payload.len() < 8 {
        return Err(CodecError::TooShort {
            opcode: frame.opcode,
            need: 8,
            got: frame.payload.len(),
        });
    }
    Ok((&frame.payload[..8]).get_u64_le())
}

/// Offset and data of a chunk frame
pub fn parse_chunk(frame: &Frame) -> Result<(u64, Bytes), CodecError> {
    let offset = parse_u64(frame)?;
    Ok((offset, frame.payload.slice(8..)))
}

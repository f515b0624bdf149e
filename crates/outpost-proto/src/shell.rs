//! Frames of a shell exec session
//!
//! A shell session runs on its own transport and is not multiplexed, so the
//! leading byte is interpreted by direction rather than by the channel opcode
//! table.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{CodecError, Frame};

/// Frames sent by the agent
pub mod output {
    pub const EXIT: u8 = 0x00;
    pub const STDOUT: u8 = 0x01;
    pub const STDERR: u8 = 0x02;
    pub const DEBUG: u8 = 0x03;
}

/// Frames sent to the agent
pub mod input {
    pub const STDIN: u8 = 0x00;
    pub const CLOSE_STDIN: u8 = 0x01;
    pub const SIGNAL: u8 = 0x02;
}

/// Exit code reported when the process status is unknown
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Signals an operator may deliver to a running command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Signal {
    Interrupt = 0x02,
    Kill = 0x09,
    User1 = 0x1e,
    User2 = 0x1f,
}

impl TryFrom<u32> for Signal {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(Signal::Interrupt),
            0x09 => Ok(Signal::Kill),
            0x1e => Ok(Signal::User1),
            0x1f => Ok(Signal::User2),
            other => Err(other),
        }
    }
}

pub fn exit(code: i32) -> Frame {
    Frame::new(output::EXIT, Bytes::copy_from_slice(&code.to_le_bytes()))
}

pub fn stdout(data: &[u8]) -> Frame {
    Frame::new(output::STDOUT, Bytes::copy_from_slice(data))
}

pub fn stderr(data: &[u8]) -> Frame {
    Frame::new(output::STDERR, Bytes::copy_from_slice(data))
}

pub fn debug(message: impl AsRef<str>) -> Frame {
    Frame::new(output::DEBUG, Bytes::copy_from_slice(message.as_ref().as_bytes()))
}

pub fn stdin(data: &[u8]) -> Frame {
    Frame::new(input::STDIN, Bytes::copy_from_slice(data))
}

pub fn close_stdin() -> Frame {
    Frame::bare(input::CLOSE_STDIN)
}

pub fn signal(signal: Signal) -> Frame {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32_le(signal as u32);
    Frame::new(input::SIGNAL, buf.freeze())
}

/// Exit code carried by an exit frame
pub fn parse_exit(frame: &Frame) -> Result<i32, CodecError> {
    let bytes: [u8; 4] = frame
        .payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(CodecError::TooShort {
            opcode: frame.opcode,
            need: 4,
            got: frame.payload.len(),
        })?;
    Ok(i32::from_le_bytes(bytes))
}

/// Raw signal number carried by a signal frame
pub fn parse_signal(frame: &Frame) -> Result<u32, CodecError> {
    let bytes: [u8; 4] = frame
        .payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(CodecError::TooShort {
            opcode: frame.opcode,
            need: 4,
            got: frame.payload.len(),
        })?;
    Ok(u32::from_le_bytes(bytes))
}

//! Wire frames exchanged over a tunnel transport
//!
//! Every frame is a single opcode byte followed by an opcode-specific payload.
//! All multi-byte integers are little-endian. Frames that address a logical
//! channel carry the channel id as the first four payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::messages::{FileInfo, ProxyHttpRequest, ProxyHttpResponse, StartPtyRequest};

/// Logical channel identifier
pub type ChannelId = u32;

/// Payload of the liveness probe sent as a diagnostic frame
pub const PING_PAYLOAD: &[u8] = b"hi";

/// Dial-result code for a successfully opened channel
pub const DIAL_OK: u8 = 0x00;

/// Dial-result code for a refused or failed channel
pub const DIAL_FAILED: u8 = 0x01;

/// WebSocket message-type tags carried as the first byte of WebSocket channel data
pub mod ws_tag {
    pub const TEXT: u8 = 0x01;
    pub const BINARY: u8 = 0x02;
    pub const CLOSE: u8 = 0x08;
    pub const PING: u8 = 0x09;
    pub const PONG: u8 = 0x0a;
}

/// Opcodes of the multiplexed session protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    PtyData = 0x00,
    PtyStart = 0x01,
    PtyClose = 0x02,
    PtyResize = 0x03,
    FileWrite = 0x10,
    FileStat = 0x11,
    FileRead = 0x12,
    TcpOpen = 0x20,
    ChannelData = 0x21,
    ChannelClose = 0x22,
    HttpOpen = 0x23,
    Diagnostic = 0xFF,
}

impl Opcode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Opcode::PtyData),
            0x01 => Ok(Opcode::PtyStart),
            0x02 => Ok(Opcode::PtyClose),
            0x03 => Ok(Opcode::PtyResize),
            0x10 => Ok(Opcode::FileWrite),
            0x11 => Ok(Opcode::FileStat),
            0x12 => Ok(Opcode::FileRead),
            0x20 => Ok(Opcode::TcpOpen),
            0x21 => Ok(Opcode::ChannelData),
            0x22 => Ok(Opcode::ChannelClose),
            0x23 => Ok(Opcode::HttpOpen),
            0xFF => Ok(Opcode::Diagnostic),
            _ => Err(CodecError::UnknownOpcode(value)),
        }
    }
}

/// Frame codec errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,

    #[error("frame 0x{opcode:02x} too short: need {need} payload bytes, got {got}")]
    TooShort { opcode: u8, need: usize, got: usize },

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("invalid length field in frame 0x{0:02x}")]
    InvalidLength(u8),

    #[error("invalid utf-8 text in frame 0x{0:02x}")]
    Utf8(u8),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::Serialization(e.to_string())
    }
}

/// One discrete message on a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Bytes,
}

/// Request to open a TCP channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOpen {
    pub id: ChannelId,
    pub port: u16,
    pub address: String,
}

/// Outcome of a TCP channel open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpDialResult {
    pub id: ChannelId,
    pub code: u8,
    pub message: String,
}

/// Data addressed to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub id: ChannelId,
    pub data: Bytes,
}

/// Request to open an HTTP or WebSocket channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOpen {
    pub id: ChannelId,
    pub request: ProxyHttpRequest,
}

/// Outcome of an HTTP or WebSocket channel open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpDialResult {
    pub id: ChannelId,
    pub response: ProxyHttpResponse,
}

/// Terminal geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtyResize {
    pub cols: u16,
    pub rows: u16,
    pub width: u16,
    pub height: u16,
}

/// A chunk to write into a file. Empty `data` truncates the file to `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWriteChunk {
    pub offset: i64,
    pub path: String,
    pub data: Bytes,
}

/// Acknowledgement of a written chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWriteAck {
    pub offset: i64,
    pub path: String,
}

/// Request for a byte range of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadRequest {
    pub offset: i64,
    pub length: i64,
    pub path: String,
}

/// Bytes read from a file; may be shorter than requested at end of file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub offset: i64,
    pub path: String,
    pub data: Bytes,
}

impl Frame {
    pub fn new(opcode: impl Into<u8>, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: opcode.into(),
            payload: payload.into(),
        }
    }

    /// Frame consisting of the opcode alone
    pub fn bare(opcode: impl Into<u8>) -> Self {
        Self::new(opcode, Bytes::new())
    }

    pub fn kind(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode).ok()
    }

    pub fn is(&self, opcode: Opcode) -> bool {
        self.opcode == opcode.as_u8()
    }

    /// Encoded size in bytes
    pub fn len(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        buf.put_u8(self.opcode);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode frame from bytes
    pub fn decode(data: Bytes) -> Result<Self, CodecError> {
        if data.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(Self {
            opcode: data[0],
            payload: data.slice(1..),
        })
    }

    fn require(&self, need: usize) -> Result<(), CodecError> {
        if self.payload.len() < need {
            return Err(CodecError::TooShort {
                opcode: self.opcode,
                need,
                got: self.payload.len(),
            });
        }
        Ok(())
    }

    fn utf8(&self, bytes: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Utf8(self.opcode))
    }

    /// Channel id carried in the first four payload bytes
    pub fn channel_id(&self) -> Result<ChannelId, CodecError> {
        self.require(4)?;
        Ok((&self.payload[..4]).get_u32_le())
    }

    /// Payload as lossy UTF-8 text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    // ---- diagnostics

    pub fn diagnostic(message: impl AsRef<str>) -> Self {
        Self::new(
            Opcode::Diagnostic,
            Bytes::copy_from_slice(message.as_ref().as_bytes()),
        )
    }

    pub fn ping() -> Self {
        Self::new(Opcode::Diagnostic, Bytes::from_static(PING_PAYLOAD))
    }

    pub fn is_ping(&self) -> bool {
        self.is(Opcode::Diagnostic) && self.payload.as_ref() == PING_PAYLOAD
    }

    // ---- pseudo-terminal

    pub fn pty_data(data: impl Into<Bytes>) -> Self {
        Self::new(Opcode::PtyData, data)
    }

    pub fn pty_start(request: Option<&StartPtyRequest>) -> Result<Self, CodecError> {
        let payload = match request {
            Some(request) => Bytes::from(bincode::serialize(request)?),
            None => Bytes::new(),
        };
        Ok(Self::new(Opcode::PtyStart, payload))
    }

    pub fn parse_pty_start(&self) -> Result<StartPtyRequest, CodecError> {
        if self.payload.is_empty() {
            return Ok(StartPtyRequest::default());
        }
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn pty_started() -> Self {
        Self::bare(Opcode::PtyStart)
    }

    pub fn pty_close() -> Self {
        Self::bare(Opcode::PtyClose)
    }

    pub fn pty_resize(size: PtyResize) -> Self {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u16_le(size.cols);
        buf.put_u16_le(size.rows);
        buf.put_u16_le(size.width);
        buf.put_u16_le(size.height);
        Self::new(Opcode::PtyResize, buf.freeze())
    }

    pub fn parse_pty_resize(&self) -> Result<PtyResize, CodecError> {
        self.require(8)?;
        let mut buf = &self.payload[..];
        Ok(PtyResize {
            cols: buf.get_u16_le(),
            rows: buf.get_u16_le(),
            width: buf.get_u16_le(),
            height: buf.get_u16_le(),
        })
    }

    // ---- file transfer

    pub fn file_write(offset: i64, path: &str, data: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(16 + path.len() + data.len());
        buf.put_i64_le(offset);
        buf.put_i64_le(data.len() as i64);
        buf.put_slice(path.as_bytes());
        buf.put_slice(data);
        Self::new(Opcode::FileWrite, buf.freeze())
    }

    pub fn parse_file_write(&self) -> Result<FileWriteChunk, CodecError> {
        self.require(16)?;
        let mut buf = &self.payload[..16];
        let offset = buf.get_i64_le();
        let length = buf.get_i64_le();

        let length = usize::try_from(length).map_err(|_| CodecError::InvalidLength(self.opcode))?;
        let data_since = self
            .payload
            .len()
            .checked_sub(length)
            .filter(|since| *since >= 16)
            .ok_or(CodecError::InvalidLength(self.opcode))?;

        Ok(FileWriteChunk {
            offset,
            path: self.utf8(&self.payload[16..data_since])?,
            data: self.payload.slice(data_since..),
        })
    }

    pub fn file_write_ack(offset: i64, path: &str) -> Self {
        let mut buf = BytesMut::with_capacity(8 + path.len());
        buf.put_i64_le(offset);
        buf.put_slice(path.as_bytes());
        Self::new(Opcode::FileWrite, buf.freeze())
    }

    pub fn parse_file_write_ack(&self) -> Result<FileWriteAck, CodecError> {
        self.require(8)?;
        Ok(FileWriteAck {
            offset: (&self.payload[..8]).get_i64_le(),
            path: self.utf8(&self.payload[8..])?,
        })
    }

    pub fn file_stat(path: &str) -> Self {
        Self::new(Opcode::FileStat, Bytes::copy_from_slice(path.as_bytes()))
    }

    pub fn parse_file_stat(&self) -> Result<String, CodecError> {
        self.utf8(&self.payload)
    }

    pub fn file_info(info: &FileInfo) -> Result<Self, CodecError> {
        Ok(Self::new(Opcode::FileStat, bincode::serialize(info)?))
    }

    pub fn parse_file_info(&self) -> Result<FileInfo, CodecError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn file_read(offset: i64, length: i64, path: &str) -> Self {
        let mut buf = BytesMut::with_capacity(16 + path.len());
        buf.put_i64_le(offset);
        buf.put_i64_le(length);
        buf.put_slice(path.as_bytes());
        Self::new(Opcode::FileRead, buf.freeze())
    }

    pub fn parse_file_read(&self) -> Result<FileReadRequest, CodecError> {
        self.require(16)?;
        let mut buf = &self.payload[..16];
        Ok(FileReadRequest {
            offset: buf.get_i64_le(),
            length: buf.get_i64_le(),
            path: self.utf8(&self.payload[16..])?,
        })
    }

    pub fn file_chunk(offset: i64, path: &str, data: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(16 + path.len() + data.len());
        buf.put_i64_le(offset);
        buf.put_i64_le(data.len() as i64);
        buf.put_slice(path.as_bytes());
        buf.put_slice(data);
        Self::new(Opcode::FileRead, buf.freeze())
    }

    pub fn parse_file_chunk(&self) -> Result<FileChunk, CodecError> {
        // Same layout as a write chunk: offset, length, path, data
        let chunk = self.parse_file_write()?;
        Ok(FileChunk {
            offset: chunk.offset,
            path: chunk.path,
            data: chunk.data,
        })
    }

    // ---- channels

    pub fn tcp_open(id: ChannelId, port: u16, address: &str) -> Self {
        let mut buf = BytesMut::with_capacity(6 + address.len());
        buf.put_u32_le(id);
        buf.put_u16_le(port);
        buf.put_slice(address.as_bytes());
        Self::new(Opcode::TcpOpen, buf.freeze())
    }

    pub fn parse_tcp_open(&self) -> Result<TcpOpen, CodecError> {
        self.require(6)?;
        let mut buf = &self.payload[..6];
        Ok(TcpOpen {
            id: buf.get_u32_le(),
            port: buf.get_u16_le(),
            address: self.utf8(&self.payload[6..])?,
        })
    }

    pub fn tcp_dial_result(id: ChannelId, code: u8, message: &str) -> Self {
        let mut buf = BytesMut::with_capacity(5 + message.len());
        buf.put_u32_le(id);
        buf.put_u8(code);
        buf.put_slice(message.as_bytes());
        Self::new(Opcode::TcpOpen, buf.freeze())
    }

    pub fn parse_tcp_dial_result(&self) -> Result<TcpDialResult, CodecError> {
        self.require(5)?;
        Ok(TcpDialResult {
            id: self.channel_id()?,
            code: self.payload[4],
            message: String::from_utf8_lossy(&self.payload[5..]).into_owned(),
        })
    }

    pub fn channel_data(id: ChannelId, data: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(4 + data.len());
        buf.put_u32_le(id);
        buf.put_slice(data);
        Self::new(Opcode::ChannelData, buf.freeze())
    }

    /// Channel data for a WebSocket channel, prefixed with its message-type tag
    pub fn ws_data(id: ChannelId, tag: u8, data: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(5 + data.len());
        buf.put_u32_le(id);
        buf.put_u8(tag);
        buf.put_slice(data);
        Self::new(Opcode::ChannelData, buf.freeze())
    }

    pub fn parse_channel_data(&self) -> Result<ChannelData, CodecError> {
        Ok(ChannelData {
            id: self.channel_id()?,
            data: self.payload.slice(4..),
        })
    }

    pub fn channel_close(id: ChannelId) -> Self {
        Self::new(Opcode::ChannelClose, Bytes::copy_from_slice(&id.to_le_bytes()))
    }

    pub fn http_open(id: ChannelId, request: &ProxyHttpRequest) -> Result<Self, CodecError> {
        let body = bincode::serialize(request)?;
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32_le(id);
        buf.put_slice(&body);
        Ok(Self::new(Opcode::HttpOpen, buf.freeze()))
    }

    pub fn parse_http_open(&self) -> Result<HttpOpen, CodecError> {
        Ok(HttpOpen {
            id: self.channel_id()?,
            request: bincode::deserialize(&self.payload[4..])?,
        })
    }

    pub fn http_dial_result(
        id: ChannelId,
        response: &ProxyHttpResponse,
    ) -> Result<Self, CodecError> {
        let body = bincode::serialize(response)?;
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32_le(id);
        buf.put_slice(&body);
        Ok(Self::new(Opcode::HttpOpen, buf.freeze()))
    }

    pub fn parse_http_dial_result(&self) -> Result<HttpDialResult, CodecError> {
        Ok(HttpDialResult {
            id: self.channel_id()?,
            response: bincode::deserialize(&self.payload[4..])?,
        })
    }
}

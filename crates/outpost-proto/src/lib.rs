//! Outpost Protocol Definitions
//!
//! This crate defines the wire frames exchanged between the server and its
//! agents, the structured payloads carried inside them, and the codec of the
//! agent notify stream. It performs no I/O.

pub mod frame;
pub mod messages;
pub mod notify;
pub mod shell;
pub mod upgrade;
pub mod version;

pub use frame::{
    ws_tag, ChannelData, ChannelId, CodecError, FileChunk, FileReadRequest, FileWriteAck,
    FileWriteChunk, Frame, HttpDialResult, HttpOpen, Opcode, PtyResize, TcpDialResult, TcpOpen,
    DIAL_FAILED, DIAL_OK, PING_PAYLOAD,
};
pub use messages::*;
pub use notify::{NotifyCodec, NotifyError};

/// Read size used when pumping sockets and process output into frames
pub const READ_CHUNK_SIZE: usize = 1024;

/// Depth of every bounded inter-task queue
pub const QUEUE_DEPTH: usize = 5;

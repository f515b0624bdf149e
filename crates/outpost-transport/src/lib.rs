//! Outpost transport layer
//!
//! A [`Transport`] carries frames over one physical connection (a WebSocket
//! in production, an in-memory pair in tests). The [`ChannelRegistry`] tracks
//! the logical channels multiplexed over it.

pub mod error;
pub mod registry;
pub mod tls;
pub mod transport;
pub mod websocket;

pub use error::{ChannelError, TransportError, TransportResult};
pub use registry::{Channel, ChannelKind, ChannelRegistry, ChannelState};
pub use tls::{ClientWebSocket, WebSocketConfig};
pub use transport::{FrameReceiver, FrameSender, Transport};
pub use websocket::{WsEvent, WsMessage};

//! Codec for the agent notify stream
//!
//! Each record is `[length: u32 LE][payload: bincode AgentNotify][\r\n]`.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::AgentNotify;

/// Notify codec errors
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Notify record too large: {0} bytes")]
    TooLarge(usize),

    #[error("Notify record missing trailing CRLF")]
    MissingTerminator,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed, CRLF-terminated notify records
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyCodec;

impl NotifyCodec {
    /// Maximum record size (1MB)
    pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

    const TERMINATOR: &'static [u8] = b"\r\n";
}

impl Encoder<AgentNotify> for NotifyCodec {
    type Error = NotifyError;

    fn encode(&mut self, item: AgentNotify, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item)?;
        if payload.len() > Self::MAX_RECORD_SIZE {
            return Err(NotifyError::TooLarge(payload.len()));
        }

        dst.reserve(4 + payload.len() + Self::TERMINATOR.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_slice(Self::TERMINATOR);
        Ok(())
    }
}

impl Decoder for NotifyCodec {
    type Item = AgentNotify;
    type Error = NotifyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = (&src[..4]).get_u32_le() as usize;
        if length > Self::MAX_RECORD_SIZE {
            return Err(NotifyError::TooLarge(length));
        }

        let total = 4 + length + Self::TERMINATOR.len();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length);
        let terminator = src.split_to(Self::TERMINATOR.len());
        if terminator.as_ref() != Self::TERMINATOR {
            return Err(NotifyError::MissingTerminator);
        }

        Ok(Some(bincode::deserialize(&payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::NotifyKind;

    fn encoded(notify: AgentNotify) -> BytesMut {
        let mut buf = BytesMut::new();
        NotifyCodec.encode(notify, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_record_layout() {
        let buf = encoded(AgentNotify::ping());
        let length = (&buf[..4]).get_u32_le() as usize;
        assert_eq!(buf.len(), 4 + length + 2);
        assert_eq!(&buf[buf.len() - 2..], b"\r\n");
    }

    #[test]
    fn test_decode_incomplete() {
        let full = encoded(AgentNotify::new(NotifyKind::Pty, "token-1"));

        let mut buf = BytesMut::from(&full[..6]);
        assert!(NotifyCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[6..]);
        let notify = NotifyCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(notify.kind, NotifyKind::Pty);
        assert_eq!(notify.id, "token-1");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple() {
        let mut buf = encoded(AgentNotify::ping());
        buf.extend_from_slice(&encoded(AgentNotify::shell("t", "uptime")));

        let first = NotifyCodec.decode(&mut buf).unwrap().unwrap();
        let second = NotifyCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.kind, NotifyKind::Ping);
        assert_eq!(second.cmd, "uptime");
        assert!(NotifyCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_bad_terminator() {
        let mut buf = encoded(AgentNotify::ping());
        let last = buf.len() - 1;
        buf[last] = b'x';
        assert!(matches!(
            NotifyCodec.decode(&mut buf),
            Err(NotifyError::MissingTerminator)
        ));
    }

    #[test]
    fn test_decode_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX);
        assert!(matches!(
            NotifyCodec.decode(&mut buf),
            Err(NotifyError::TooLarge(_))
        ));
    }
}

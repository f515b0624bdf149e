//! Structured payloads carried inside frames and notify records

use serde::{Deserialize, Serialize};

/// A single HTTP header; names may repeat
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyHttpHeader {
    pub name: String,
    pub value: String,
}

impl ProxyHttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Request forwarded to the agent for an HTTP or WebSocket channel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyHttpRequest {
    pub method: String,
    /// Absolute URL; a `ws://` or `wss://` scheme selects a WebSocket dial
    pub url: String,
    pub headers: Vec<ProxyHttpHeader>,
    /// Host header override; empty keeps the URL host
    pub host: String,
    pub body: Vec<u8>,
}

impl ProxyHttpRequest {
    pub fn is_websocket(&self) -> bool {
        self.url.starts_with("ws://") || self.url.starts_with("wss://")
    }
}

/// Dial result for an HTTP or WebSocket channel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyHttpResponse {
    /// Non-empty when the upstream could not be reached
    pub connection_error: String,
    pub status_code: i32,
    pub headers: Vec<ProxyHttpHeader>,
    pub is_websocket: bool,
}

impl ProxyHttpResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            connection_error: message.into(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.connection_error.is_empty()
    }
}

/// Optional payload of a pseudo-terminal start frame
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartPtyRequest {
    pub cmd: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` entries
    pub env: Vec<String>,
    pub inherit_env: bool,
}

/// File metadata returned by a stat request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: i64,
    pub mode: u32,
    /// Modification time as unix seconds
    pub mtime: i64,
}

/// What an agent is asked to do when a notify record arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    Ping,
    Shell,
    /// Operator terminal: pty and file frames
    Pty,
    Upgrade,
    /// Broker session: proxy channel frames
    Proxy,
}

/// Record pushed to an agent over its notify stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentNotify {
    #[serde(rename = "type")]
    pub kind: NotifyKind,
    /// Rendezvous token the agent must dial back with
    pub id: String,
    pub cmd: String,
    pub has_stdin: bool,
    pub need_stdout: bool,
    pub need_stderr: bool,
}

impl AgentNotify {
    pub fn ping() -> Self {
        Self::new(NotifyKind::Ping, String::new())
    }

    pub fn new(kind: NotifyKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            cmd: String::new(),
            has_stdin: false,
            need_stdout: false,
            need_stderr: false,
        }
    }

    pub fn shell(id: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::new(NotifyKind::Shell, id)
        }
    }
}

/// Serialize a message with the wire encoding
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

/// Deserialize a message with the wire encoding
pub fn from_bytes<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_detection() {
        let mut request = ProxyHttpRequest {
            url: "ws://127.0.0.1/ws".to_string(),
            ..Default::default()
        };
        assert!(request.is_websocket());
        request.url = "wss://example.com".to_string();
        assert!(request.is_websocket());
        request.url = "https://example.com".to_string();
        assert!(!request.is_websocket());
    }

    #[test]
    fn test_failed_response() {
        let response = ProxyHttpResponse::failed("dial error: refused");
        assert!(!response.is_ok());
        assert_eq!(response.status_code, 0);
        assert!(ProxyHttpResponse::default().is_ok());
    }

    #[test]
    fn test_notify_serialization() {
        let mut notify = AgentNotify::shell("abc-1", "ls -la");
        notify.need_stdout = true;
        let bytes = to_bytes(&notify).unwrap();
        let decoded: AgentNotify = from_bytes(&bytes).unwrap();
        assert_eq!(decoded, notify);
        assert_eq!(decoded.kind, NotifyKind::Shell);
    }
}

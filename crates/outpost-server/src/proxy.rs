//! Proxy services: virtual hosts served through an agent
//!
//! Each registered host forwards its HTTP and WebSocket requests to a target
//! URL reachable from the agent. Requests share one broker connection per
//! service, re-created on demand after it ends.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use outpost_proto::{ws_tag, ProxyHttpHeader, ProxyHttpRequest};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{strip_headers, BrokerConfig, ConnectionToAgent, ProxyExchange, ProxyStream};
use crate::error::{BrokerError, RegistrationError};
use crate::hub::AgentHub;
use crate::registry::parse_instance_id;

/// Registration of a proxy service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub host: String,
    pub agent_name: String,
    #[serde(default)]
    pub agent_id: String,
    pub target: String,
    /// Host header sent upstream; empty keeps the target's host
    #[serde(default)]
    pub replace_host: String,
}

impl ServiceSpec {
    /// Trim the target, default its scheme and check an agent is named
    pub fn normalize(mut self) -> Result<Self, RegistrationError> {
        self.target = self.target.trim().to_string();
        if self.target.is_empty() {
            return Err(RegistrationError::MissingTarget);
        }
        if !self.target.starts_with("http://") && !self.target.starts_with("https://") {
            self.target = format!("http://{}", self.target);
        }
        if self.target.ends_with('/') {
            self.target.pop();
        }

        if self.agent_name.is_empty() && self.agent_id.is_empty() {
            return Err(RegistrationError::MissingAgent);
        }
        Ok(self)
    }
}

/// One virtual host
#[derive(Debug)]
pub struct ProxyService {
    spec: ServiceSpec,
    hub: AgentHub,
    broker: BrokerConfig,
    cancel: CancellationToken,
    connection: Mutex<Option<Arc<ConnectionToAgent>>>,
}

impl ProxyService {
    pub fn new(spec: ServiceSpec, hub: AgentHub, broker: BrokerConfig) -> Self {
        Self {
            spec,
            hub,
            broker,
            cancel: CancellationToken::new(),
            connection: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<ConnectionToAgent>>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reuse the live connection or create a new one, then wait for it
    pub async fn ensure_connected(&self) -> Result<Arc<ConnectionToAgent>, BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Aborted);
        }

        let connection = {
            let mut slot = self.slot();
            match slot.as_ref() {
                Some(connection) if !connection.is_disconnected() => connection.clone(),
                _ => {
                    let instance = parse_instance_id(Some(self.spec.agent_id.as_str()))?;
                    let connection = ConnectionToAgent::connect(
                        self.hub.clone(),
                        &self.spec.agent_name,
                        instance,
                        &self.cancel,
                        self.broker,
                    );
                    *slot = Some(connection.clone());
                    connection
                }
            }
        };

        if let Err(error) = connection.wait_ready().await {
            let mut slot = self.slot();
            if slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &connection))
            {
                *slot = None;
            }
            return Err(error);
        }

        Ok(connection)
    }

    /// Serve one client request through the agent
    pub async fn handle(&self, request: Request) -> Response {
        let connection = match self.ensure_connected().await {
            Ok(connection) => connection,
            Err(error) => return text_response(StatusCode::BAD_GATEWAY, error.to_string()),
        };

        let (mut parts, body) = request.into_parts();
        let upgrade = if is_websocket_request(&parts.headers) {
            WebSocketUpgrade::from_request_parts(&mut parts, &()).await.ok()
        } else {
            None
        };

        let proxy_request = match self.build_request(&parts, body, upgrade.is_some()).await {
            Ok(proxy_request) => proxy_request,
            Err(error) => return text_response(StatusCode::BAD_REQUEST, error),
        };

        let exchange = match connection.handle_request(proxy_request).await {
            Ok(exchange) => exchange,
            Err(error) => return text_response(StatusCode::BAD_GATEWAY, error.to_string()),
        };

        if exchange.response.is_websocket {
            match upgrade {
                Some(upgrade) => websocket_response(upgrade, exchange),
                None => text_response(
                    StatusCode::BAD_GATEWAY,
                    "upstream switched protocols on a plain request",
                ),
            }
        } else {
            http_response(exchange)
        }
    }

    async fn build_request(
        &self,
        parts: &Parts,
        body: Body,
        websocket: bool,
    ) -> Result<ProxyHttpRequest, String> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut url = format!("{}{}", self.spec.target, path_and_query);
        if websocket {
            url = url.replacen("http", "ws", 1);
        }

        let body = if websocket {
            Vec::new()
        } else {
            axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| e.to_string())?
                .to_vec()
        };

        Ok(ProxyHttpRequest {
            method: parts.method.to_string(),
            url,
            headers: to_proxy_headers(&parts.headers),
            host: self.spec.replace_host.clone(),
            body,
        })
    }

    /// Stop the service and its connection
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

/// Registered services keyed by host
#[derive(Debug)]
pub struct ProxyServices {
    services: DashMap<String, Arc<ProxyService>>,
    hub: AgentHub,
    broker: BrokerConfig,
    host_template: Option<String>,
}

impl ProxyServices {
    pub fn new(hub: AgentHub, broker: BrokerConfig, host_template: Option<String>) -> Self {
        Self {
            services: DashMap::new(),
            hub,
            broker,
            host_template,
        }
    }

    /// A bare name becomes a host through the `*` template
    pub fn expand_host(&self, host: &str) -> Result<String, RegistrationError> {
        if host.contains('.') {
            return Ok(host.to_string());
        }
        match &self.host_template {
            Some(template) if template.contains('*') => Ok(template.replace('*', host)),
            _ => Err(RegistrationError::InvalidHost),
        }
    }

    pub fn register(&self, spec: ServiceSpec) -> Result<Arc<ProxyService>, RegistrationError> {
        let spec = spec.normalize()?;
        match self.services.entry(spec.host.clone()) {
            Entry::Occupied(_) => Err(RegistrationError::HostExists),
            Entry::Vacant(entry) => {
                info!(
                    "register proxy service: {} --[{}]--> {}",
                    spec.host, spec.agent_name, spec.target
                );
                let service = Arc::new(ProxyService::new(spec, self.hub.clone(), self.broker));
                entry.insert(service.clone());
                Ok(service)
            }
        }
    }

    pub fn kill(&self, host: &str) -> Result<(), RegistrationError> {
        let (_, service) = self
            .services
            .remove(host)
            .ok_or(RegistrationError::NotFound)?;
        info!("kill proxy service: {}", host);
        service.dispose();
        Ok(())
    }

    pub fn get(&self, host: &str) -> Option<Arc<ProxyService>> {
        self.services.get(host).map(|service| service.clone())
    }

    pub fn list(&self) -> Vec<ServiceSpec> {
        let mut list: Vec<_> = self
            .services
            .iter()
            .map(|service| service.spec().clone())
            .collect();
        list.sort_by(|a, b| a.host.cmp(&b.host));
        list
    }
}

fn is_websocket_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// Request headers as forwarded; the Host header travels separately
fn to_proxy_headers(headers: &HeaderMap) -> Vec<ProxyHttpHeader> {
    headers
        .iter()
        .filter(|(name, _)| *name != header::HOST)
        .map(|(name, value)| {
            ProxyHttpHeader::new(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn append_headers(target: &mut HeaderMap, headers: Vec<ProxyHttpHeader>) {
    for proxy_header in headers {
        let name = HeaderName::from_bytes(proxy_header.name.as_bytes());
        let value = HeaderValue::from_str(&proxy_header.value);
        match (name, value) {
            (Ok(name), Ok(value)) => {
                target.append(name, value);
            }
            _ => debug!("Skipping invalid header '{}'", proxy_header.name),
        }
    }
}

fn text_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain")],
        message.into(),
    )
        .into_response()
}

/// Status and headers now, body streamed as the agent sends it
fn http_response(exchange: ProxyExchange) -> Response {
    let ProxyExchange { response, stream } = exchange;

    let status = u16::try_from(response.status_code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok());
    let Some(status) = status else {
        return text_response(
            StatusCode::BAD_GATEWAY,
            format!("bad response: status {}", response.status_code),
        );
    };

    let headers: Vec<_> = strip_headers(response.headers)
        .into_iter()
        .filter(|h| !h.name.eq_ignore_ascii_case("transfer-encoding"))
        .collect();

    let body = futures_util::stream::unfold(stream, |mut stream| async move {
        stream
            .next_data()
            .await
            .map(|data| (Ok::<Bytes, Infallible>(data), stream))
    });

    let mut reply = Response::new(Body::from_stream(body));
    *reply.status_mut() = status;
    append_headers(reply.headers_mut(), headers);
    reply
}

/// Upgrade the client and pump messages both ways
fn websocket_response(upgrade: WebSocketUpgrade, exchange: ProxyExchange) -> Response {
    let ProxyExchange { response, stream } = exchange;
    let mut reply = upgrade.on_upgrade(move |socket| pump_websocket(socket, stream));
    append_headers(reply.headers_mut(), response.headers);
    reply
}

async fn pump_websocket(socket: WebSocket, mut stream: ProxyStream) {
    let id = stream.id();
    let writer = stream.writer();
    let (mut sink, mut source) = socket.split();

    let to_client = async {
        while let Some(data) = stream.next_data().await {
            let Some((&tag, payload)) = data.split_first() else {
                continue;
            };
            let payload = Bytes::copy_from_slice(payload);
            let message = match tag {
                ws_tag::TEXT => Message::Text(String::from_utf8_lossy(&payload).into_owned().into()),
                ws_tag::BINARY => Message::Binary(payload),
                ws_tag::CLOSE => Message::Close(None),
                ws_tag::PING => Message::Ping(payload),
                ws_tag::PONG => Message::Pong(payload),
                other => {
                    debug!("[0x{:08x}] Unknown message tag {}", id, other);
                    continue;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    };

    let to_agent = async {
        while let Some(Ok(message)) = source.next().await {
            let (tag, data) = match message {
                Message::Text(text) => (ws_tag::TEXT, Bytes::copy_from_slice(text.as_str().as_bytes())),
                Message::Binary(data) => (ws_tag::BINARY, data),
                Message::Ping(data) => (ws_tag::PING, data),
                Message::Pong(data) => (ws_tag::PONG, data),
                Message::Close(_) => break,
            };
            if !writer.send_ws(tag, &data).await {
                break;
            }
        }
        debug!("[0x{:08x}] ws aborted by client", id);
    };

    tokio::select! {
        _ = to_client => {}
        _ = to_agent => {}
    }

    stream.close().await;
    info!("[0x{:08x}] ws totally closed", id);
}

//! HTTP and WebSocket channels against a local axum server

mod common;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use common::TestSession;
use outpost_proto::{ws_tag, Frame, Opcode, ProxyHttpHeader, ProxyHttpRequest, ProxyHttpResponse};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Producer {
    emitted: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

/// Flags the end of the event stream when the server drops it
struct StopGuard(Arc<AtomicBool>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

async fn echo(method: Method, body: String) -> impl IntoResponse {
    ([("x-test", "test")], format!("method: {}\nbody: {}\n", method, body))
}

async fn events(State(producer): State<Producer>) -> impl IntoResponse {
    let guard = StopGuard(producer.stopped.clone());
    let stream = futures::stream::unfold(guard, move |guard| {
        let emitted = producer.emitted.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            emitted.fetch_add(1, Ordering::SeqCst);
            Some((Ok::<_, Infallible>(Bytes::from_static(b"x")), guard))
        }
    });
    ([("content-type", "text/event-stream")], Body::from_stream(stream))
}

async fn socket(headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    if headers.get("x-test-client").map(|v| v.as_bytes()) != Some(b"test") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let mut response = ws.on_upgrade(serve_socket);
    response
        .headers_mut()
        .insert("x-test-server", HeaderValue::from_static("test"));
    response
}

async fn serve_socket(mut socket: WebSocket) {
    if socket
        .send(Message::Binary(Bytes::from_static(&[0x00, 0x01])))
        .await
        .is_err()
        || socket.send(Message::Text("hello".into())).await.is_err()
    {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) if text.as_str() == "bye" => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            Message::Text(text) => {
                let reply = format!("recv: {}", text.as_str());
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    return;
                }
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

async fn start_server(producer: Producer) -> SocketAddr {
    let app = Router::new()
        .route("/", any(echo))
        .route("/events", get(events))
        .route("/ws", get(socket))
        .with_state(producer);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn request(method: &str, url: String) -> ProxyHttpRequest {
    ProxyHttpRequest {
        method: method.to_string(),
        url,
        ..Default::default()
    }
}

async fn dial_result(session: &mut TestSession) -> ProxyHttpResponse {
    session
        .recv_op(Opcode::HttpOpen)
        .await
        .parse_http_dial_result()
        .unwrap()
        .response
}

/// Channel data up to the close frame
async fn body_until_close(session: &mut TestSession) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let frame = session.recv().await;
        if frame.is(Opcode::ChannelClose) {
            return body;
        }
        if frame.is(Opcode::ChannelData) {
            body.extend_from_slice(&frame.parse_channel_data().unwrap().data);
        }
    }
}

fn header<'a>(response: &'a ProxyHttpResponse, name: &str) -> Option<&'a str> {
    response
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

#[tokio::test]
async fn test_get_streams_response() {
    let addr = start_server(Producer::default()).await;
    let mut session = TestSession::proxy();

    let frame = Frame::http_open(1, &request("GET", format!("http://{}/", addr))).unwrap();
    session.send(frame).await;

    let response = dial_result(&mut session).await;
    assert!(response.is_ok(), "{}", response.connection_error);
    assert_eq!(response.status_code, 200);
    assert!(!response.is_websocket);
    assert_eq!(header(&response, "x-test"), Some("test"));

    let body = body_until_close(&mut session).await;
    assert_eq!(body, b"method: GET\nbody: \n");

    session.shutdown().await;
}

#[tokio::test]
async fn test_post_forwards_body() {
    let addr = start_server(Producer::default()).await;
    let mut session = TestSession::proxy();

    let mut post = request("POST", format!("http://{}/", addr));
    post.body = b"payload".to_vec();
    post.headers = vec![ProxyHttpHeader::new("Content-Type", "text/plain")];
    session.send(Frame::http_open(2, &post).unwrap()).await;

    let response = dial_result(&mut session).await;
    assert_eq!(response.status_code, 200);
    let body = body_until_close(&mut session).await;
    assert_eq!(body, b"method: POST\nbody: payload\n");

    session.shutdown().await;
}

#[tokio::test]
async fn test_close_aborts_event_stream() {
    let producer = Producer::default();
    let addr = start_server(producer.clone()).await;
    let mut session = TestSession::proxy();

    let open = Frame::http_open(3, &request("GET", format!("http://{}/events", addr))).unwrap();
    session.send(open).await;
    let response = dial_result(&mut session).await;
    assert_eq!(response.status_code, 200);

    let mut forwarded = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(150);
    while let Ok(frame) = tokio::time::timeout_at(deadline, session.server.recv()).await {
        let frame = frame.unwrap();
        if frame.is(Opcode::ChannelData) {
            forwarded += frame.parse_channel_data().unwrap().data.len();
        }
    }

    session.send(Frame::channel_close(3)).await;
    forwarded += body_until_close(&mut session).await.len();
    assert!(forwarded > 0);

    let stopped = tokio::time::timeout(common::WAIT, async {
        while !producer.stopped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "producer kept running after close");

    let emitted = producer.emitted.load(Ordering::SeqCst);
    assert!(emitted >= forwarded);
    assert!(
        emitted - forwarded <= 10,
        "emitted {} bytes, forwarded {}",
        emitted,
        forwarded
    );

    session.shutdown().await;
}

#[tokio::test]
async fn test_connect_error_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut session = TestSession::proxy();
    session
        .send(Frame::http_open(4, &request("GET", format!("http://{}/", addr))).unwrap())
        .await;
    let response = dial_result(&mut session).await;
    assert!(response.connection_error.starts_with("connect error: "));

    session
        .send(Frame::http_open(5, &request("GET", "::not a url".to_string())).unwrap())
        .await;
    let response = dial_result(&mut session).await;
    assert!(response.connection_error.starts_with("bad url: "));

    // Failed dials are not followed by a close frame
    session.send(Frame::ping()).await;
    assert!(session.recv().await.is_ping());

    session.shutdown().await;
}

#[tokio::test]
async fn test_websocket_channel() {
    let addr = start_server(Producer::default()).await;
    let mut session = TestSession::proxy();

    let mut open = request("GET", format!("ws://{}/ws", addr));
    open.headers = vec![ProxyHttpHeader::new("X-Test-Client", "test")];
    session.send(Frame::http_open(9, &open).unwrap()).await;

    let response = dial_result(&mut session).await;
    assert!(response.is_ok(), "{}", response.connection_error);
    assert!(response.is_websocket);
    assert_eq!(response.status_code, 101);
    assert_eq!(header(&response, "x-test-server"), Some("test"));

    let binary = session.recv_op(Opcode::ChannelData).await;
    assert_eq!(
        binary.parse_channel_data().unwrap().data.as_ref(),
        &[ws_tag::BINARY, 0x00, 0x01]
    );
    let text = session.recv_op(Opcode::ChannelData).await;
    assert_eq!(text.parse_channel_data().unwrap().data.as_ref(), b"\x01hello");

    session.send(Frame::ws_data(9, ws_tag::TEXT, b"ping!")).await;
    let echoed = session.recv_op(Opcode::ChannelData).await;
    assert_eq!(
        echoed.parse_channel_data().unwrap().data.as_ref(),
        b"\x01recv: ping!"
    );

    // A close echoed by the upstream may still be forwarded before 0x22
    session.send(Frame::channel_close(9)).await;
    body_until_close(&mut session).await;

    // The id can be reused once released
    session.send(Frame::http_open(9, &open).unwrap()).await;
    let response = dial_result(&mut session).await;
    assert!(response.is_ok(), "{}", response.connection_error);

    session.shutdown().await;
}

#[tokio::test]
async fn test_websocket_closed_by_upstream() {
    let addr = start_server(Producer::default()).await;
    let mut session = TestSession::proxy();

    let mut open = request("GET", format!("ws://{}/ws", addr));
    open.headers = vec![ProxyHttpHeader::new("X-Test-Client", "test")];
    session.send(Frame::http_open(11, &open).unwrap()).await;
    assert!(dial_result(&mut session).await.is_websocket);

    session.recv_op(Opcode::ChannelData).await;
    session.recv_op(Opcode::ChannelData).await;

    session.send(Frame::ws_data(11, ws_tag::TEXT, b"bye")).await;
    let close = session.recv_op(Opcode::ChannelData).await;
    assert_eq!(close.parse_channel_data().unwrap().data[0], ws_tag::CLOSE);
    let done = session.recv_op(Opcode::ChannelClose).await;
    assert_eq!(done.channel_id().unwrap(), 11);

    session.shutdown().await;
}

#[tokio::test]
async fn test_websocket_handshake_rejected() {
    let addr = start_server(Producer::default()).await;
    let mut session = TestSession::proxy();

    // Missing X-Test-Client makes the server refuse the upgrade
    let open = request("GET", format!("ws://{}/ws", addr));
    session.send(Frame::http_open(12, &open).unwrap()).await;
    let response = dial_result(&mut session).await;
    assert!(response.connection_error.starts_with("connect error: "));

    session.shutdown().await;
}

//! Proxy services end to end: client -> server -> agent -> upstream

mod common;

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use common::TestServer;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as ClientMessage;

async fn echo(method: Method, headers: HeaderMap, body: String) -> impl IntoResponse {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (
        [("x-test", "test"), ("x-upstream-host", host.as_str())],
        format!("method: {}\nbody: {}\n", method, body),
    )
        .into_response()
}

async fn socket(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(echo_socket)
}

async fn echo_socket(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                let reply = format!("echo: {}", text.as_str());
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    return;
                }
            }
            Message::Binary(data) => {
                if socket.send(Message::Binary(data)).await.is_err() {
                    return;
                }
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

async fn start_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/ws", get(socket))
        .route("/{*path}", any(echo))
        .route("/", any(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn register(server: &TestServer, host: &str, target: &str, replace_host: &str) {
    let response = reqwest::Client::new()
        .post(server.url(&format!("/api/proxy/{}", host)))
        .form(&[
            ("agent_name", "edge"),
            ("target", target),
            ("replace_host", replace_host),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_http_through_agent() {
    let upstream = start_upstream().await;
    let server = TestServer::start().await;
    let agent = server.spawn_agent("edge").await;
    register(&server, "app.test", &upstream.to_string(), "").await;

    let client = reqwest::Client::new();
    let response = client
        .post(server.url("/submit?x=1"))
        .header("host", "app.test")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-test"], "test");
    assert_eq!(
        response.text().await.unwrap(),
        "method: POST\nbody: payload\n"
    );

    // Paths under /api still belong to the proxied host
    let response = client
        .get(server.url("/api/client/"))
        .header("host", "app.test")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.text().await.unwrap(),
        "method: GET\nbody: \n"
    );

    // The connection to the agent is shared between requests
    assert_eq!(server.state.services.list().len(), 1);

    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_replace_host() {
    let upstream = start_upstream().await;
    let server = TestServer::start().await;
    let agent = server.spawn_agent("edge").await;
    register(&server, "app.test", &upstream.to_string(), "internal.example").await;

    let response = reqwest::Client::new()
        .get(server.url("/"))
        .header("host", "app.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-upstream-host"], "internal.example");

    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_websocket_through_agent() {
    let upstream = start_upstream().await;
    let server = TestServer::start().await;
    let agent = server.spawn_agent("edge").await;
    register(&server, "app.test", &format!("http://{}", upstream), "").await;

    let mut request = server.ws_url("/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("host", "app.test".parse().unwrap());
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    socket
        .send(ClientMessage::Text("ping".into()))
        .await
        .unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap(), "echo: ping");

    socket
        .send(ClientMessage::Binary(vec![1u8, 2, 3].into()))
        .await
        .unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(&reply.into_data()[..], &[1u8, 2, 3][..]);

    socket.close(None).await.unwrap();

    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_agent_is_bad_gateway() {
    let server = TestServer::start().await;
    register(&server, "app.test", "127.0.0.1:1", "").await;

    let response = reqwest::Client::new()
        .get(server.url("/"))
        .header("host", "app.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.text().await.unwrap(), "agent not found");

    server.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_target_is_bad_gateway() {
    let server = TestServer::start().await;
    let agent = server.spawn_agent("edge").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);
    register(&server, "app.test", &closed.to_string(), "").await;

    let response = reqwest::Client::new()
        .get(server.url("/"))
        .header("host", "app.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response
        .text()
        .await
        .unwrap()
        .starts_with("connection error:"));

    agent.stop().await;
    server.shutdown().await;
}

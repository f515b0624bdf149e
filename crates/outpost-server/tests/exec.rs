//! Shell exec through a real agent

mod common;

use bytes::{Buf, Bytes};
use common::TestServer;
use outpost_proto::shell::{self, output};
use outpost_proto::Frame;
use reqwest::StatusCode;

async fn exec(server: &TestServer, query: &[(&str, &str)]) -> (StatusCode, Bytes) {
    let response = reqwest::Client::new()
        .get(server.url("/api/client/edge/exec"))
        .query(query)
        .send()
        .await
        .unwrap();
    (response.status(), response.bytes().await.unwrap())
}

#[tokio::test]
async fn test_exec_streams_stdout() {
    let server = TestServer::start().await;
    let agent = server.spawn_agent("edge").await;

    let (status, body) = exec(&server, &[("cmd", "echo hello; echo hidden 1>&2")]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"hello\n");

    let (_, body) = exec(
        &server,
        &[
            ("cmd", "echo out; echo err 1>&2"),
            ("stdout", "0"),
            ("stderr", "1"),
        ],
    )
    .await;
    assert_eq!(body.as_ref(), b"err\n");

    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_exec_stdin() {
    let server = TestServer::start().await;
    let agent = server.spawn_agent("edge").await;

    let (_, body) = exec(&server, &[("cmd", "cat"), ("stdin", "from query")]).await;
    assert_eq!(body.as_ref(), b"from query");

    let response = reqwest::Client::new()
        .post(server.url("/api/client/edge/exec"))
        .query(&[("cmd", "tr a-z A-Z")])
        .body("from body")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"FROM BODY");

    // Without stdin the command sees end of input right away
    let (_, body) = exec(&server, &[("cmd", "cat; echo done")]).await;
    assert_eq!(body.as_ref(), b"done\n");

    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_exec_full_frames() {
    let server = TestServer::start().await;
    let agent = server.spawn_agent("edge").await;

    let (_, mut body) = exec(
        &server,
        &[("cmd", "printf out; printf err 1>&2; exit 3"), ("full", "1")],
    )
    .await;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;
    while body.has_remaining() {
        let length = body.get_u32_le() as usize;
        let frame = Frame::decode(body.split_to(length)).unwrap();
        match frame.opcode {
            output::STDOUT => stdout.extend_from_slice(&frame.payload),
            output::STDERR => stderr.extend_from_slice(&frame.payload),
            output::EXIT => exit_code = Some(shell::parse_exit(&frame).unwrap()),
            _ => {}
        }
    }

    assert_eq!(stdout, b"out");
    assert_eq!(stderr, b"err");
    assert_eq!(exit_code, Some(3));

    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_exec_rejections() {
    let server = TestServer::start().await;

    let (status, _) = exec(&server, &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = exec(&server, &[("cmd", "true")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("agent not found"));

    let agent = server.spawn_agent("edge").await;
    let (status, _) = exec(&server, &[("cmd", "true"), ("agent_id", "999")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    agent.stop().await;
    server.shutdown().await;
}

//! TCP channels against local listeners

mod common;

use common::TestSession;
use outpost_proto::{Frame, Opcode, DIAL_FAILED, DIAL_OK};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Echo server accepting any number of connections
async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn test_echo_through_channel() {
    let port = echo_server().await;
    let mut session = TestSession::proxy();

    session.send(Frame::tcp_open(1, port, "127.0.0.1")).await;
    let result = session
        .recv_op(Opcode::TcpOpen)
        .await
        .parse_tcp_dial_result()
        .unwrap();
    assert_eq!(result.id, 1);
    assert_eq!(result.code, DIAL_OK);
    assert!(result.message.starts_with("127.0.0.1:"));

    session
        .send(Frame::channel_data(1, &[0xde, 0xad, 0xbe, 0xef]))
        .await;
    let data = session
        .recv_op(Opcode::ChannelData)
        .await
        .parse_channel_data()
        .unwrap();
    assert_eq!(data.id, 1);
    assert_eq!(data.data.as_ref(), &[0xde, 0xad, 0xbe, 0xef]);

    session.send(Frame::channel_close(1)).await;
    let close = session.recv_op(Opcode::ChannelClose).await;
    assert_eq!(close.channel_id().unwrap(), 1);

    session.shutdown().await;
}

#[tokio::test]
async fn test_remote_close_sends_close_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"bye").await.unwrap();
        // Dropping the stream closes the remote side
    });

    let mut session = TestSession::proxy();
    session.send(Frame::tcp_open(7, port, "127.0.0.1")).await;
    let result = session
        .recv_op(Opcode::TcpOpen)
        .await
        .parse_tcp_dial_result()
        .unwrap();
    assert_eq!(result.code, DIAL_OK);

    let data = session.recv_op(Opcode::ChannelData).await;
    assert_eq!(data.parse_channel_data().unwrap().data.as_ref(), b"bye");

    let close = session.recv_op(Opcode::ChannelClose).await;
    assert_eq!(close.channel_id().unwrap(), 7);

    // The id is free again
    session.send(Frame::tcp_open(7, echo_server().await, "127.0.0.1")).await;
    let result = session
        .recv_op(Opcode::TcpOpen)
        .await
        .parse_tcp_dial_result()
        .unwrap();
    assert_eq!(result.code, DIAL_OK);

    session.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_id_is_refused() {
    let port = echo_server().await;
    let mut session = TestSession::proxy();

    session.send(Frame::tcp_open(2, port, "127.0.0.1")).await;
    let result = session
        .recv_op(Opcode::TcpOpen)
        .await
        .parse_tcp_dial_result()
        .unwrap();
    assert_eq!(result.code, DIAL_OK);

    session.send(Frame::tcp_open(2, port, "127.0.0.1")).await;
    let refused = session.recv().await.parse_tcp_dial_result().unwrap();
    assert_eq!(refused.id, 2);
    assert_eq!(refused.code, DIAL_FAILED);
    assert_eq!(refused.message, "connection id already exists");

    let diagnostic = session.recv().await;
    assert!(diagnostic.is(Opcode::Diagnostic));
    assert_eq!(diagnostic.text(), "tcp proxy 0x00000002 already opened");

    // The original channel is untouched
    session.send(Frame::channel_data(2, b"still open")).await;
    let data = session.recv_op(Opcode::ChannelData).await;
    assert_eq!(data.parse_channel_data().unwrap().data.as_ref(), b"still open");

    session.shutdown().await;
}

#[tokio::test]
async fn test_dial_failure_reports_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut session = TestSession::proxy();
    session.send(Frame::tcp_open(3, port, "127.0.0.1")).await;
    let result = session
        .recv_op(Opcode::TcpOpen)
        .await
        .parse_tcp_dial_result()
        .unwrap();
    assert_eq!(result.code, DIAL_FAILED);
    assert!(result.message.starts_with("dial error: "));

    // No close frame follows a failed dial
    session.send(Frame::ping()).await;
    assert!(session.recv().await.is_ping());

    session.shutdown().await;
}

#[tokio::test]
async fn test_unknown_id_gets_diagnostic() {
    let mut session = TestSession::proxy();

    session.send(Frame::channel_data(0x63, b"lost")).await;
    let frame = session.recv().await;
    assert!(frame.is(Opcode::Diagnostic));
    assert_eq!(frame.text(), "channel 0x00000063 not found");

    session.send(Frame::channel_close(0x63)).await;
    let frame = session.recv().await;
    assert_eq!(frame.text(), "channel 0x00000063 not found");

    session.shutdown().await;
}

#[tokio::test]
async fn test_session_end_closes_sockets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let remote = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        // Returns once the agent side drops the socket
        stream.read_to_end(&mut buf).await.is_ok()
    });

    let mut session = TestSession::proxy();
    session.send(Frame::tcp_open(4, port, "127.0.0.1")).await;
    session.recv_op(Opcode::TcpOpen).await;

    session.shutdown().await;
    let closed = tokio::time::timeout(common::WAIT, remote)
        .await
        .unwrap()
        .unwrap();
    assert!(closed);
}

#[tokio::test]
async fn test_close_aborts_stalled_channel() {
    // Accepts and holds the socket without ever reading it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (held_tx, held_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = held_rx.await;
        drop(stream);
    });

    let mut session = TestSession::proxy();
    session.send(Frame::tcp_open(1, port, "127.0.0.1")).await;
    let result = session
        .recv_op(Opcode::TcpOpen)
        .await
        .parse_tcp_dial_result()
        .unwrap();
    assert_eq!(result.code, DIAL_OK);

    // Well past what the socket buffers take
    let chunk = vec![0x5a; 64 * 1024];
    let flood = async {
        for _ in 0..512 {
            session.server.send(Frame::channel_data(1, &chunk)).await.unwrap();
        }
    };
    tokio::time::timeout(common::WAIT, flood)
        .await
        .expect("flooding one channel stalled the session");

    session.send(Frame::channel_close(1)).await;
    session.send(Frame::ping()).await;

    let mut closed = false;
    let mut pong = false;
    while !(closed && pong) {
        let frame = session.recv().await;
        if frame.is_ping() {
            pong = true;
        } else if frame.is(Opcode::ChannelClose) {
            assert_eq!(frame.channel_id().unwrap(), 1);
            closed = true;
        }
    }

    let _ = held_tx.send(());
    session.shutdown().await;
}

#[tokio::test]
async fn test_terminal_session_ignores_proxy_frames() {
    let port = echo_server().await;
    let mut session = TestSession::terminal();

    session.send(Frame::tcp_open(1, port, "127.0.0.1")).await;
    session.send(Frame::channel_data(1, b"ignored")).await;
    session.send(Frame::ping()).await;

    // No dial result and no "not found" diagnostic, only the echo
    assert!(session.recv().await.is_ping());

    session.shutdown().await;
}

//! Real terminals started through a session

#![cfg(unix)]

mod common;

use std::time::Duration;

use common::TestSession;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use outpost_proto::{Frame, Opcode, StartPtyRequest};

fn start_frame(script: &str) -> Frame {
    Frame::pty_start(Some(&StartPtyRequest {
        cmd: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: Vec::new(),
        inherit_env: true,
    }))
    .unwrap()
}

/// Terminal output until it contains `needle`
async fn read_output_until(session: &mut TestSession, needle: &str) -> String {
    let mut output = String::new();
    while !output.contains(needle) {
        let frame = session.recv_op(Opcode::PtyData).await;
        output.push_str(&String::from_utf8_lossy(&frame.payload));
    }
    output
}

#[tokio::test]
async fn test_start_output_and_close() {
    let mut session = TestSession::terminal();

    session.send(start_frame("echo hi; sleep 30")).await;
    let ack = session.recv_op(Opcode::PtyStart).await;
    assert!(ack.payload.is_empty());
    let output = read_output_until(&mut session, "hi\r\n").await;
    assert!(output.starts_with("hi"), "output: {:?}", output);

    // Only one terminal per session
    session.send(start_frame("echo second")).await;
    let refused = session.recv().await;
    assert!(refused.is(Opcode::Diagnostic));
    assert_eq!(refused.text(), "pty already opened");

    session.send(Frame::pty_close()).await;
    let closed = session.recv_op(Opcode::PtyClose).await;
    assert!(closed.payload.is_empty());

    // Exactly one close notification
    session.send(Frame::ping()).await;
    loop {
        let frame = session.recv().await;
        if frame.is_ping() {
            break;
        }
        assert!(!frame.is(Opcode::PtyClose), "second close notification");
    }

    // The slot is free again
    session.send(start_frame("echo again")).await;
    session.recv_op(Opcode::PtyStart).await;
    read_output_until(&mut session, "again").await;

    session.shutdown().await;
}

#[tokio::test]
async fn test_close_kills_the_process() {
    let mut session = TestSession::terminal();

    session.send(start_frame("echo pid=$$; sleep 30")).await;
    session.recv_op(Opcode::PtyStart).await;
    let output = read_output_until(&mut session, "\n").await;
    let pid: i32 = output
        .split("pid=")
        .nth(1)
        .and_then(|rest| rest.lines().next())
        .map(|line| line.trim().parse().unwrap())
        .expect("pid line");
    assert!(kill(Pid::from_raw(pid), None).is_ok());

    session.send(Frame::pty_close()).await;
    session.recv_op(Opcode::PtyClose).await;

    let gone = async {
        while kill(Pid::from_raw(pid), None).is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(common::WAIT, gone)
        .await
        .expect("terminal process still running after close");

    session.shutdown().await;
}

#[tokio::test]
async fn test_process_exit_notifies_once() {
    let mut session = TestSession::terminal();

    session.send(start_frame("echo bye")).await;
    session.recv_op(Opcode::PtyStart).await;

    // Output may still be in flight when the close arrives
    loop {
        let frame = session.recv().await;
        if frame.is(Opcode::PtyClose) {
            break;
        }
        assert!(frame.is(Opcode::PtyData) || frame.is(Opcode::Diagnostic));
    }

    session.send(Frame::pty_close()).await;
    session.send(Frame::ping()).await;
    loop {
        let frame = session.recv().await;
        if frame.is_ping() {
            break;
        }
        assert!(!frame.is(Opcode::PtyClose), "second close notification");
    }

    session.shutdown().await;
}

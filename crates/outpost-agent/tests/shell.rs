//! Shell exec sessions over an in-memory transport

#![cfg(unix)]

use std::time::Duration;

use bytes::Bytes;
use outpost_agent::shell;
use outpost_proto::shell::{input, output, parse_exit, Signal};
use outpost_proto::{shell as frames, AgentNotify, Frame};
use outpost_transport::Transport;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Output {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    debug: Vec<String>,
    exit: Option<i32>,
}

fn start(cmd: &str, stdin: bool, stdout: bool, stderr: bool) -> (Transport, JoinHandle<()>) {
    let (agent, server) = Transport::memory_pair();
    let mut task = AgentNotify::shell("token", cmd);
    task.has_stdin = stdin;
    task.need_stdout = stdout;
    task.need_stderr = stderr;
    (server, tokio::spawn(shell::run(agent, task)))
}

/// Everything the agent sends until it closes the transport
async fn collect(server: &mut Transport) -> Output {
    let mut out = Output::default();
    while let Some(frame) = timeout(WAIT, server.recv()).await.unwrap() {
        match frame.opcode {
            output::STDOUT => out.stdout.extend_from_slice(&frame.payload),
            output::STDERR => out.stderr.extend_from_slice(&frame.payload),
            output::DEBUG => out.debug.push(frame.text()),
            output::EXIT => out.exit = Some(parse_exit(&frame).unwrap()),
            other => panic!("unexpected frame 0x{:02x}", other),
        }
    }
    out
}

#[tokio::test]
async fn test_output_and_exit_code() {
    let (mut server, task) = start("echo hello; echo oops >&2; exit 3", false, true, true);
    let out = collect(&mut server).await;
    task.await.unwrap();

    assert_eq!(out.stdout, b"hello\n");
    assert_eq!(out.stderr, b"oops\n");
    assert_eq!(out.exit, Some(3));
}

#[tokio::test]
async fn test_unwanted_output_is_dropped() {
    let (mut server, task) = start("echo hello; echo oops >&2", false, false, true);
    let out = collect(&mut server).await;
    task.await.unwrap();

    assert!(out.stdout.is_empty());
    assert_eq!(out.stderr, b"oops\n");
    assert_eq!(out.exit, Some(0));
}

#[tokio::test]
async fn test_stdin_round_trip() {
    let (mut server, task) = start("cat", true, true, false);
    server.send(frames::stdin(b"abc")).await.unwrap();
    server.send(frames::close_stdin()).await.unwrap();

    let out = collect(&mut server).await;
    task.await.unwrap();

    assert_eq!(out.stdout, b"abc");
    assert_eq!(out.exit, Some(0));
}

#[tokio::test]
async fn test_kill_signal() {
    let (mut server, task) = start("exec sleep 30", false, true, true);
    server.send(frames::signal(Signal::Kill)).await.unwrap();

    let out = collect(&mut server).await;
    task.await.unwrap();

    // Killed by a signal, so there is no exit status
    assert_eq!(out.exit, Some(-1));
}

#[tokio::test]
async fn test_unknown_signal_is_reported() {
    let (mut server, task) = start("exec sleep 30", false, true, true);
    server
        .send(Frame::new(input::SIGNAL, Bytes::from_static(&[15, 0, 0, 0])))
        .await
        .unwrap();
    server.send(frames::signal(Signal::Interrupt)).await.unwrap();

    let out = collect(&mut server).await;
    task.await.unwrap();

    assert_eq!(out.debug, vec!["unknown signal: 15".to_string()]);
    assert_eq!(out.exit, Some(-1));
}

#[tokio::test]
async fn test_closed_transport_kills_command() {
    let (server, task) = start("exec sleep 30", false, true, true);
    server.close();
    timeout(WAIT, task).await.unwrap().unwrap();
}

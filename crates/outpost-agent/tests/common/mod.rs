//! Shared helpers for agent integration tests

#![allow(dead_code)]

use std::time::Duration;

use outpost_agent::{Role, Session, SessionOptions};
use outpost_proto::{Frame, NotifyKind, Opcode};
use outpost_transport::Transport;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// An agent session served over an in-memory transport
pub struct TestSession {
    pub server: Transport,
    pub task: JoinHandle<()>,
}

impl TestSession {
    /// A session as the broker requests it
    pub fn proxy() -> Self {
        Self::start(NotifyKind::Proxy)
    }

    /// A session as an operator terminal requests it
    pub fn terminal() -> Self {
        Self::start(NotifyKind::Pty)
    }

    fn start(kind: NotifyKind) -> Self {
        let (agent, server) = Transport::memory_pair();
        let task = tokio::spawn(async move {
            Session::serve(agent, Role::for_session(kind), &SessionOptions::default())
                .await
                .unwrap();
        });
        Self { server, task }
    }

    pub async fn send(&self, frame: Frame) {
        self.server.send(frame).await.unwrap();
    }

    /// Next frame, failing the test after [`WAIT`]
    pub async fn recv(&mut self) -> Frame {
        timeout(WAIT, self.server.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("transport closed")
    }

    /// Next frame with `opcode`, skipping diagnostics
    pub async fn recv_op(&mut self, opcode: Opcode) -> Frame {
        loop {
            let frame = self.recv().await;
            if frame.is(opcode) {
                return frame;
            }
            assert!(
                frame.is(Opcode::Diagnostic),
                "unexpected frame 0x{:02x}: {:?}",
                frame.opcode,
                frame.payload
            );
        }
    }

    pub async fn shutdown(self) {
        self.server.close();
        timeout(WAIT, self.task)
            .await
            .expect("session did not stop")
            .unwrap();
    }
}

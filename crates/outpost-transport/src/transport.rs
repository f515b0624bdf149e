//! Frame-level duplex transport
//!
//! A [`Transport`] is one physical connection seen as two bounded frame
//! queues plus a cancellation scope. Cancelling the scope closes both
//! directions and every channel derived from it.

use outpost_proto::{Frame, QUEUE_DEPTH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{TransportError, TransportResult};

/// Sending half of a transport
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::Sender<Frame>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Queue a frame, waiting for room in the bounded queue
    pub async fn send(&self, frame: Frame) -> TransportResult<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            result = self.tx.send(frame) => result.map_err(|_| TransportError::Closed),
        }
    }

    /// Queue a frame from a blocking thread
    pub fn blocking_send(&self, frame: Frame) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx
            .blocking_send(frame)
            .map_err(|_| TransportError::Closed)
    }

    /// Send a 0xFF diagnostic to the peer; failures are only logged
    pub async fn diagnostic(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        if self.send(Frame::diagnostic(message)).await.is_err() {
            debug!("Diagnostic dropped, transport closed: {}", message);
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Cancel the transport scope
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Receiving half of a transport
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
}

impl FrameReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<Frame>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Next inbound frame, `None` once the transport is closed
    ///
    /// Frames queued before the close are still returned.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.cancel.cancelled() => self.rx.try_recv().ok(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One physical connection carrying frames both ways
#[derive(Debug)]
pub struct Transport {
    pub sender: FrameSender,
    pub receiver: FrameReceiver,
}

impl Transport {
    pub(crate) fn from_parts(
        tx: mpsc::Sender<Frame>,
        rx: mpsc::Receiver<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sender: FrameSender::new(tx, cancel.clone()),
            receiver: FrameReceiver::new(rx, cancel),
        }
    }

    /// Two transports connected back to back, sharing one cancellation scope
    pub fn memory_pair() -> (Transport, Transport) {
        let cancel = CancellationToken::new();
        let (a_tx, b_rx) = mpsc::channel(QUEUE_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(QUEUE_DEPTH);
        (
            Transport::from_parts(a_tx, a_rx, cancel.clone()),
            Transport::from_parts(b_tx, b_rx, cancel),
        )
    }

    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.sender.cancel_token()
    }

    pub async fn send(&self, frame: Frame) -> TransportResult<()> {
        self.sender.send(frame).await
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_proto::Opcode;

    #[tokio::test]
    async fn test_memory_pair_delivers_in_order() {
        let (a, mut b) = Transport::memory_pair();

        for i in 0..3u32 {
            a.send(Frame::channel_data(1, &i.to_le_bytes())).await.unwrap();
        }

        for i in 0..3u32 {
            let frame = b.recv().await.unwrap();
            assert!(frame.is(Opcode::ChannelData));
            assert_eq!(frame.parse_channel_data().unwrap().data.as_ref(), &i.to_le_bytes());
        }
    }

    #[tokio::test]
    async fn test_cancel_closes_both_sides() {
        let (mut a, mut b) = Transport::memory_pair();
        b.close();

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(matches!(
            a.send(Frame::ping()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_sender_ends_peer() {
        let (a, mut b) = Transport::memory_pair();
        let (sender, _receiver) = a.split();
        drop(sender);
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_diagnostic_after_close_does_not_fail() {
        let (a, _b) = Transport::memory_pair();
        a.close();
        a.sender.diagnostic("late").await;
        assert!(a.sender.is_closed());
    }
}

//! Channel registry: logical streams multiplexed over one transport
//!
//! Every open channel owns an inbox fed by [`ChannelRegistry::deliver`] and a
//! forwarding task that moves the inbox into a bounded queue drained by
//! exactly one consumer, which keeps frames for the same id in arrival order.
//! Delivery never waits for the consumer, so a stalled channel cannot hold up
//! the transport's read loop. Entries are removed by [`ChannelRegistry::close`]
//! or when the [`Channel`] handle drops, whichever comes first.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use outpost_proto::{ChannelId, QUEUE_DEPTH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::ChannelError;
use crate::transport::FrameSender;

/// What a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Tcp,
    Http,
    WebSocket,
}

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Opening,
            1 => ChannelState::Open,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

#[derive(Debug)]
struct ChannelEntry {
    inbox: mpsc::UnboundedSender<Bytes>,
    generation: u64,
    kind: ChannelKind,
    state: Arc<AtomicU8>,
    closing: CancellationToken,
}

#[derive(Debug)]
struct RegistryInner {
    channels: DashMap<ChannelId, ChannelEntry>,
    next_generation: AtomicU64,
    sender: FrameSender,
}

/// Open channels of one transport, keyed by id
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new(sender: FrameSender) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                channels: DashMap::new(),
                next_generation: AtomicU64::new(1),
                sender,
            }),
        }
    }

    /// Register a new channel; an id already in use is refused untouched
    pub fn open(&self, id: ChannelId, kind: ChannelKind) -> Result<Channel, ChannelError> {
        match self.inner.channels.entry(id) {
            Entry::Occupied(_) => Err(ChannelError::AlreadyOpen(id)),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                let (inbox, inbox_rx) = mpsc::unbounded_channel();
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let state = Arc::new(AtomicU8::new(ChannelState::Opening as u8));
                let cancel = self.inner.sender.cancel_token().child_token();
                let closing = cancel.child_token();

                tokio::spawn(forward(id, inbox_rx, tx, cancel.clone()));
                vacant.insert(ChannelEntry {
                    inbox,
                    generation,
                    kind,
                    state: state.clone(),
                    closing: closing.clone(),
                });
                trace!("[0x{:08x}] Channel opened ({:?})", id, kind);

                Ok(Channel {
                    id,
                    kind,
                    generation,
                    rx,
                    cancel,
                    closing,
                    state,
                    registry: self.inner.clone(),
                })
            }
        }
    }

    /// Route inbound data to an open channel without waiting for its consumer
    ///
    /// An unknown id is reported to the peer as a diagnostic.
    pub async fn deliver(&self, id: ChannelId, payload: Bytes) {
        let queued = self
            .inner
            .channels
            .get(&id)
            .map(|entry| entry.inbox.send(payload).is_ok());

        match queued {
            Some(true) => {}
            Some(false) => trace!("[0x{:08x}] Channel consumer gone", id),
            None => self.not_found(id).await,
        }
    }

    /// Close a channel
    ///
    /// The consumer drains what is queued, then sees the end. Its
    /// [`Channel::closing`] token fires right away so work stuck on the local
    /// resource can give up.
    pub async fn close(&self, id: ChannelId) {
        match self.inner.channels.remove(&id) {
            Some((_, entry)) => {
                entry
                    .state
                    .store(ChannelState::Closing as u8, Ordering::SeqCst);
                entry.closing.cancel();
                debug!("[0x{:08x}] Channel closed by peer", id);
            }
            None => self.not_found(id).await,
        }
    }

    async fn not_found(&self, id: ChannelId) {
        debug!("[0x{:08x}] Channel not found", id);
        self.inner
            .sender
            .diagnostic(format!("channel 0x{:08x} not found", id))
            .await;
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.inner.channels.contains_key(&id)
    }

    pub fn kind(&self, id: ChannelId) -> Option<ChannelKind> {
        self.inner.channels.get(&id).map(|entry| entry.kind)
    }

    pub fn len(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.channels.is_empty()
    }

    /// Frame sender of the owning transport
    pub fn sender(&self) -> &FrameSender {
        &self.inner.sender
    }
}

/// Move a channel's inbox into its bounded queue, in order
///
/// Ends once the inbox is drained after a close, or when the channel is
/// cancelled.
async fn forward(
    id: ChannelId,
    mut inbox: mpsc::UnboundedReceiver<Bytes>,
    queue: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    while let Some(payload) = inbox.recv().await {
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = queue.send(payload) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    trace!("[0x{:08x}] Channel inbox done", id);
}

/// Consumer handle of one open channel
///
/// Dropping the handle cancels the channel and removes its registry entry,
/// unless the id has since been reused by a newer channel.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    kind: ChannelKind,
    generation: u64,
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    closing: CancellationToken,
    state: Arc<AtomicU8>,
    registry: Arc<RegistryInner>,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Next inbound payload; `None` once closed by the peer or cancelled
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            data = self.rx.recv() => data,
        }
    }

    /// Cancellation scope of this channel, a child of the transport's
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fires when the peer closes the channel, or when it is cancelled
    ///
    /// Queued data can still be read after it fires.
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Frame sender of the owning transport
    pub fn sender(&self) -> &FrameSender {
        &self.registry.sender
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.set_state(ChannelState::Closed);
        let generation = self.generation;
        self.registry
            .channels
            .remove_if(&self.id, |_, entry| entry.generation == generation);
    }
}

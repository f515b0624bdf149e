//! Multiplexed agent session: the frame dispatcher
//!
//! A session serves one transport. Inbound frames are routed through a fixed
//! 256-entry table built from the session's roles. Frames that must keep their
//! order (terminal input, channel data and channel close) are handled inline
//! on the read loop; everything else runs as a tracked task so the session can
//! wait for all of its work before it ends.

use outpost_proto::{Frame, NotifyKind, Opcode};
use outpost_transport::{ChannelRegistry, FrameReceiver, FrameSender, Transport, WebSocketConfig};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::error::AgentError;
use crate::pty::PtySlot;
use crate::{file, proxy, pty};

/// Groups of opcodes a session may serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Pty,
    FileTransfer,
    Proxy,
}

impl Role {
    /// Roles of a session started for a `kind` notification
    pub fn for_session(kind: NotifyKind) -> &'static [Role] {
        match kind {
            NotifyKind::Pty => &[Role::Pty, Role::FileTransfer],
            NotifyKind::Proxy => &[Role::Proxy],
            NotifyKind::Ping | NotifyKind::Shell | NotifyKind::Upgrade => &[],
        }
    }

    fn opcodes(self) -> &'static [Opcode] {
        match self {
            Role::Pty => &[
                Opcode::PtyData,
                Opcode::PtyStart,
                Opcode::PtyClose,
                Opcode::PtyResize,
            ],
            Role::FileTransfer => &[Opcode::FileWrite, Opcode::FileStat, Opcode::FileRead],
            Role::Proxy => &[
                Opcode::TcpOpen,
                Opcode::ChannelData,
                Opcode::ChannelClose,
                Opcode::HttpOpen,
            ],
        }
    }
}

/// Opcode byte to handler
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: [Option<Opcode>; 256],
}

impl RouteTable {
    /// Diagnostics are always routed; the rest comes from `roles`
    pub fn for_roles(roles: &[Role]) -> Self {
        let mut routes = [None; 256];
        routes[Opcode::Diagnostic.as_u8() as usize] = Some(Opcode::Diagnostic);
        for role in roles {
            for opcode in role.opcodes() {
                routes[opcode.as_u8() as usize] = Some(*opcode);
            }
        }
        Self { routes }
    }

    pub fn route(&self, opcode: u8) -> Option<Opcode> {
        self.routes[opcode as usize]
    }
}

/// Options shared by every session of an agent
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Accept invalid TLS certificates when proxying to upstreams
    pub insecure: bool,
}

/// State shared by the handlers of one session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub sender: FrameSender,
    pub channels: ChannelRegistry,
    pub http: reqwest::Client,
    pub websocket: WebSocketConfig,
    pub pty: PtySlot,
    pub tracker: TaskTracker,
}

/// One multiplexed session
pub struct Session {
    routes: RouteTable,
    ctx: SessionContext,
}

impl Session {
    pub fn new(
        sender: FrameSender,
        roles: &[Role],
        options: &SessionOptions,
    ) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.insecure)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let websocket = WebSocketConfig {
            insecure: options.insecure,
            user_agent: None,
        };

        Ok(Self {
            routes: RouteTable::for_roles(roles),
            ctx: SessionContext {
                channels: ChannelRegistry::new(sender.clone()),
                sender,
                http,
                websocket,
                pty: PtySlot::default(),
                tracker: TaskTracker::new(),
            },
        })
    }

    /// Serve `transport` with `roles` until it closes
    pub async fn serve(
        transport: Transport,
        roles: &[Role],
        options: &SessionOptions,
    ) -> Result<(), AgentError> {
        let (sender, receiver) = transport.split();
        Session::new(sender, roles, options)?.run(receiver).await;
        Ok(())
    }

    /// Dispatch frames until the read side ends, then cancel the session and
    /// wait for all of its tasks
    pub async fn run(self, mut receiver: FrameReceiver) {
        while let Some(frame) = receiver.recv().await {
            self.dispatch(frame).await;
        }

        debug!("Session read side ended, shutting down");
        self.ctx.sender.close();
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
        debug!("Session ended");
    }

    async fn dispatch(&self, frame: Frame) {
        let Some(route) = self.routes.route(frame.opcode) else {
            trace!("Ignoring unrouted opcode 0x{:02x}", frame.opcode);
            return;
        };

        let ctx = &self.ctx;
        match route {
            // Ordered, handled on the read loop
            Opcode::PtyData => pty::write(ctx, frame.payload).await,
            Opcode::ChannelData => proxy::deliver(ctx, &frame).await,
            Opcode::ChannelClose => proxy::close(ctx, &frame).await,
            Opcode::Diagnostic => diagnostic(ctx, &frame).await,

            // Channel registration is ordered, the drivers run as tasks
            Opcode::TcpOpen => proxy::tcp::open(ctx, &frame).await,
            Opcode::HttpOpen => proxy::http::open(ctx, &frame).await,

            Opcode::PtyStart => {
                ctx.tracker.spawn(pty::start(ctx.clone(), frame));
            }
            Opcode::PtyClose => pty::close(ctx),
            Opcode::PtyResize => {
                ctx.tracker.spawn(pty::resize(ctx.clone(), frame));
            }
            Opcode::FileWrite => {
                ctx.tracker.spawn(file::handle_write(ctx.sender.clone(), frame));
            }
            Opcode::FileStat => {
                ctx.tracker.spawn(file::handle_stat(ctx.sender.clone(), frame));
            }
            Opcode::FileRead => {
                ctx.tracker.spawn(file::handle_read(ctx.sender.clone(), frame));
            }
        }
    }
}

/// Echo liveness probes, log anything else
async fn diagnostic(ctx: &SessionContext, frame: &Frame) {
    if frame.is_ping() {
        let _ = ctx.sender.send(Frame::ping()).await;
        return;
    }
    info!("Peer diagnostic: {}", frame.text());
}

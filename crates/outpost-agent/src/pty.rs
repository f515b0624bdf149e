//! Pseudo-terminal handlers
//!
//! A session owns at most one terminal. Its output is pumped by a blocking
//! reader thread, its input by a blocking writer thread fed through a bounded
//! queue so keystrokes keep their order. A supervisor task tears the terminal
//! down when it exits, when the peer closes it, or when the session ends.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use outpost_proto::{Frame, StartPtyRequest, QUEUE_DEPTH, READ_CHUNK_SIZE};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::SessionContext;

#[cfg(windows)]
const DEFAULT_SHELL: &str = "cmd.exe";
#[cfg(not(windows))]
const DEFAULT_SHELL: &str = "sh";

/// A running terminal
pub struct PtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    input: mpsc::Sender<Bytes>,
    close: CancellationToken,
}

enum SlotState {
    Idle,
    Starting,
    Running(Arc<PtyHandle>),
}

/// The single terminal slot of a session
#[derive(Clone)]
pub struct PtySlot {
    state: Arc<Mutex<SlotState>>,
}

impl Default for PtySlot {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState::Idle)),
        }
    }
}

impl std::fmt::Debug for PtySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            SlotState::Idle => "idle",
            SlotState::Starting => "starting",
            SlotState::Running(_) => "running",
        };
        f.debug_struct("PtySlot").field("state", &state).finish()
    }
}

impl PtySlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the slot; false when a terminal is already open or starting
    fn claim(&self) -> bool {
        let mut state = self.lock();
        if matches!(*state, SlotState::Idle) {
            *state = SlotState::Starting;
            true
        } else {
            false
        }
    }

    fn set_running(&self, handle: Arc<PtyHandle>) {
        *self.lock() = SlotState::Running(handle);
    }

    fn reset(&self) {
        *self.lock() = SlotState::Idle;
    }

    fn running(&self) -> Option<Arc<PtyHandle>> {
        match &*self.lock() {
            SlotState::Running(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(*self.lock(), SlotState::Idle)
    }
}

/// Build the command line for a start request
pub fn build_command(request: &StartPtyRequest) -> CommandBuilder {
    let program = if request.cmd.is_empty() {
        DEFAULT_SHELL
    } else {
        request.cmd.as_str()
    };

    let mut cmd = CommandBuilder::new(program);
    cmd.args(&request.args);
    if !request.inherit_env {
        cmd.env_clear();
    }
    for entry in &request.env {
        match entry.split_once('=') {
            Some((key, value)) => cmd.env(key, value),
            None => cmd.env(entry, ""),
        }
    }
    cmd
}

pub async fn start(ctx: SessionContext, frame: Frame) {
    if !ctx.pty.claim() {
        ctx.sender.diagnostic("pty already opened").await;
        return;
    }

    let request = match frame.parse_pty_start() {
        Ok(request) => request,
        Err(e) => {
            ctx.pty.reset();
            ctx.sender.diagnostic(e.to_string()).await;
            return;
        }
    };

    let (master, child, reader, writer) = match spawn(&request) {
        Ok(parts) => parts,
        Err(e) => {
            ctx.pty.reset();
            warn!("Failed to start pty: {}", e);
            ctx.sender.diagnostic(e.to_string()).await;
            return;
        }
    };

    let close = ctx.sender.cancel_token().child_token();
    let (input, input_rx) = mpsc::channel(QUEUE_DEPTH);

    tokio::task::spawn_blocking(move || pump_input(writer, input_rx));
    ctx.pty.set_running(Arc::new(PtyHandle {
        master: Mutex::new(master),
        input,
        close: close.clone(),
    }));
    info!("Pty started: {}", program_name(&request));

    // The acknowledgment goes out before any output
    let _ = ctx.sender.send(Frame::pty_started()).await;
    let sender = ctx.sender.clone();
    let eof = close.clone();
    tokio::task::spawn_blocking(move || {
        pump_output(reader, |data| {
            sender
                .blocking_send(Frame::pty_data(Bytes::copy_from_slice(data)))
                .is_ok()
        });
        eof.cancel();
    });

    ctx.tracker.spawn(supervise(ctx.clone(), child, close));
}

type Spawned = (
    Box<dyn MasterPty + Send>,
    Box<dyn Child + Send + Sync>,
    Box<dyn Read + Send>,
    Box<dyn Write + Send>,
);

fn spawn(request: &StartPtyRequest) -> anyhow::Result<Spawned> {
    let pair = native_pty_system().openpty(PtySize {
        rows: 24,
        cols: 80,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let child = pair.slave.spawn_command(build_command(request))?;
    drop(pair.slave);

    let reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;
    Ok((pair.master, child, reader, writer))
}

fn program_name(request: &StartPtyRequest) -> &str {
    if request.cmd.is_empty() {
        DEFAULT_SHELL
    } else {
        &request.cmd
    }
}

fn pump_input(mut writer: Box<dyn Write + Send>, mut input: mpsc::Receiver<Bytes>) {
    while let Some(data) = input.blocking_recv() {
        if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
            break;
        }
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, mut emit: impl FnMut(&[u8]) -> bool) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if !emit(&buf[..n]) {
                    break;
                }
            }
        }
    }
}

async fn supervise(
    ctx: SessionContext,
    mut child: Box<dyn Child + Send + Sync>,
    close: CancellationToken,
) {
    close.cancelled().await;

    if let Err(e) = child.kill() {
        debug!("Pty child already gone: {}", e);
    }
    ctx.pty.reset();
    let _ = ctx.sender.send(Frame::pty_close()).await;

    match tokio::task::spawn_blocking(move || child.wait()).await {
        Ok(Ok(status)) => debug!("Pty child exited: {:?}", status),
        Ok(Err(e)) => debug!("Pty child wait failed: {}", e),
        Err(e) => debug!("Pty reaper panicked: {}", e),
    }
}

/// Forward terminal input; dropped when no terminal is open
pub async fn write(ctx: &SessionContext, data: Bytes) {
    if let Some(handle) = ctx.pty.running() {
        let _ = handle.input.send(data).await;
    }
}

pub fn close(ctx: &SessionContext) {
    if let Some(handle) = ctx.pty.running() {
        handle.close.cancel();
    }
}

pub async fn resize(ctx: SessionContext, frame: Frame) {
    let Some(handle) = ctx.pty.running() else {
        return;
    };

    let size = match frame.parse_pty_resize() {
        Ok(size) => size,
        Err(e) => return ctx.sender.diagnostic(e.to_string()).await,
    };

    let result = handle
        .master
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .resize(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: size.width,
            pixel_height: size.height,
        });

    if let Err(e) = result {
        ctx.sender
            .diagnostic(format!("pty resize failed: {}", e))
            .await;
    }
}

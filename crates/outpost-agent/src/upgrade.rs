//! Self-upgrade over a dedicated transport
//!
//! The running executable is moved aside to a timestamped backup and a new
//! one is streamed into its place in order. The new binary is started with the
//! same arguments; if it survives two seconds the backup is removed and this
//! process stops listening, otherwise everything is rolled back.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use outpost_proto::upgrade::{self, request};
use outpost_transport::{FrameReceiver, FrameSender, Transport};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a new executable must stay up to count as started
const STARTUP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("bad request")]
    BadRequest,

    #[error("bad request, cannot read info")]
    BadInfo,

    #[error("bad request, cannot read chunk")]
    BadChunk,

    #[error("bad request, offset mismatch")]
    OffsetMismatch,

    #[error("failed to make executable backup: {0}")]
    Backup(std::io::Error),

    #[error("failed to truncate temp file: {0}")]
    Truncate(std::io::Error),

    #[error("failed to write temp file: {0}")]
    Write(std::io::Error),

    #[error("failed to run executable: {0}")]
    Run(std::io::Error),

    #[error("executable exited with code {0}")]
    Exited(i32),

    #[error("transport closed")]
    Closed,
}

/// An executable being replaced
///
/// Dropped before [`ExecutableUpgrade::finish`] succeeds, it restores the
/// backup.
#[derive(Debug)]
pub struct ExecutableUpgrade {
    exec_path: PathBuf,
    backup_path: PathBuf,
    file: Option<fs::File>,
    finished: bool,
}

impl ExecutableUpgrade {
    /// Move `exec_path` to its backup and open a fresh file in its place
    pub async fn start_at(exec_path: PathBuf) -> Result<Self, UpgradeError> {
        let backup_path = backup_path_for(&exec_path, chrono::Local::now());
        fs::rename(&exec_path, &backup_path)
            .await
            .map_err(UpgradeError::Backup)?;

        let mut upgrade = Self {
            exec_path,
            backup_path,
            file: None,
            finished: false,
        };

        let permissions = fs::metadata(&upgrade.backup_path)
            .await
            .map_err(UpgradeError::Backup)?
            .permissions();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&upgrade.exec_path)
            .await
            .map_err(UpgradeError::Backup)?;
        fs::set_permissions(&upgrade.exec_path, permissions)
            .await
            .map_err(UpgradeError::Backup)?;

        upgrade.file = Some(file);
        debug!(
            "Moved {} to {}",
            upgrade.exec_path.display(),
            upgrade.backup_path.display()
        );
        Ok(upgrade)
    }

    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub async fn truncate(&mut self, size: u64) -> std::io::Result<()> {
        match &self.file {
            Some(file) => file.set_len(size).await,
            None => Err(closed_file()),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.file {
            Some(file) => file.write_all(data).await,
            None => Err(closed_file()),
        }
    }

    /// Start the new executable and keep it if it stays up
    pub async fn finish(mut self, args: &[OsString]) -> Result<(), UpgradeError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(UpgradeError::Write)?;
            file.sync_all().await.map_err(UpgradeError::Write)?;
            drop(file.into_std().await);
        }

        let mut child = Command::new(&self.exec_path)
            .args(args)
            .spawn()
            .map_err(UpgradeError::Run)?;

        tokio::select! {
            status = child.wait() => {
                let code = status.ok().and_then(|status| status.code()).unwrap_or(-1);
                return Err(UpgradeError::Exited(code));
            }
            _ = tokio::time::sleep(STARTUP_GRACE) => {}
        }

        self.finished = true;
        info!(
            "New executable {} is running (pid {:?})",
            self.exec_path.display(),
            child.id()
        );
        if let Err(e) = fs::remove_file(&self.backup_path).await {
            warn!(
                "Failed to remove backup {}: {}",
                self.backup_path.display(),
                e
            );
        }
        Ok(())
    }
}

impl Drop for ExecutableUpgrade {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.file.take();
        let _ = std::fs::remove_file(&self.exec_path);
        match std::fs::rename(&self.backup_path, &self.exec_path) {
            Ok(()) => warn!("Upgrade rolled back to {}", self.exec_path.display()),
            Err(e) => error!(
                "Failed to restore {} from {}: {}",
                self.exec_path.display(),
                self.backup_path.display(),
                e
            ),
        }
    }
}

/// `{dir}/{name}.temp.{YYYYMMDDHHMMSS}`
pub fn backup_path_for(exec_path: &Path, now: chrono::DateTime<chrono::Local>) -> PathBuf {
    let name = exec_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    exec_path.with_file_name(format!("{}.temp.{}", name, now.format("%Y%m%d%H%M%S")))
}

fn closed_file() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "file already closed")
}

/// Upgrade the running executable, restarting it with the current arguments
pub async fn run(transport: Transport, stop: CancellationToken) -> Result<(), UpgradeError> {
    let exec_path = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            let error = UpgradeError::Backup(e);
            transport.send(upgrade::error(error.to_string())).await.ok();
            transport.close();
            return Err(error);
        }
    };
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    run_with(transport, exec_path, args, stop).await
}

/// Replace `exec_path`; `stop` is cancelled once the new executable runs
pub async fn run_with(
    transport: Transport,
    exec_path: PathBuf,
    args: Vec<OsString>,
    stop: CancellationToken,
) -> Result<(), UpgradeError> {
    let (sender, mut receiver) = transport.split();

    let result = handshake(&sender, &mut receiver, exec_path, &args, &stop).await;
    if let Err(e) = &result {
        warn!("Upgrade failed: {}", e);
        let _ = sender.send(upgrade::error(e.to_string())).await;
    }

    sender.close();
    result
}

async fn handshake(
    sender: &FrameSender,
    receiver: &mut FrameReceiver,
    exec_path: PathBuf,
    args: &[OsString],
    stop: &CancellationToken,
) -> Result<(), UpgradeError> {
    let ready = receiver.recv().await.ok_or(UpgradeError::BadRequest)?;
    if ready.opcode != request::READY || !ready.payload.is_empty() {
        return Err(UpgradeError::BadRequest);
    }

    let mut upgrade = ExecutableUpgrade::start_at(exec_path).await?;
    send(sender, upgrade::path(&upgrade.exec_path().to_string_lossy())).await?;

    let info = receiver.recv().await.ok_or(UpgradeError::BadInfo)?;
    if info.opcode != request::SIZE || info.payload.len() != 8 {
        return Err(UpgradeError::BadInfo);
    }
    let total = upgrade::parse_u64(&info).map_err(|_| UpgradeError::BadInfo)?;
    upgrade
        .truncate(total)
        .await
        .map_err(UpgradeError::Truncate)?;
    info!(
        "Receiving {} bytes into {}",
        total,
        upgrade.exec_path().display()
    );

    let mut received = 0u64;
    while received < total {
        let frame = receiver.recv().await.ok_or(UpgradeError::BadChunk)?;
        if frame.opcode != request::CHUNK {
            return Err(UpgradeError::BadChunk);
        }
        let (offset, data) = upgrade::parse_chunk(&frame).map_err(|_| UpgradeError::BadChunk)?;
        if data.is_empty() {
            return Err(UpgradeError::BadChunk);
        }
        if offset != received {
            return Err(UpgradeError::OffsetMismatch);
        }

        upgrade.write(&data).await.map_err(UpgradeError::Write)?;
        received += data.len() as u64;
        send(sender, upgrade::ack(received)).await?;
    }

    send(sender, upgrade::done()).await?;
    upgrade.finish(args).await?;

    stop.cancel();
    send(sender, upgrade::started()).await?;
    Ok(())
}

async fn send(sender: &FrameSender, frame: outpost_proto::Frame) -> Result<(), UpgradeError> {
    sender.send(frame).await.map_err(|_| UpgradeError::Closed)
}

//! File transfer handlers
//!
//! Stateless: every request opens the file, does its work and closes it.
//! Failures are reported to the peer as diagnostics.

use std::io::SeekFrom;
use std::path::Path;

use outpost_proto::{FileInfo, Frame};
use outpost_transport::FrameSender;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Write `data` at `offset`, growing the file when needed
///
/// Empty `data` truncates the file to `offset` bytes instead.
pub async fn write_chunk(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;

    if data.is_empty() {
        return file.set_len(offset).await;
    }

    let required = offset + data.len() as u64;
    if required > file.metadata().await?.len() {
        file.set_len(required).await?;
    }

    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}

/// Read up to `max_length` bytes at `offset`; shorter at end of file
pub async fn read_chunk(path: &Path, offset: u64, max_length: u64) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut data = Vec::new();
    file.take(max_length).read_to_end(&mut data).await?;
    Ok(data)
}

pub async fn stat(path: &str) -> std::io::Result<FileInfo> {
    let metadata = fs::metadata(path).await?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default();

    Ok(FileInfo {
        path: path.to_string(),
        size: metadata.len() as i64,
        mode: file_mode(&metadata),
        mtime,
    })
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

fn offset_of(value: i64) -> std::io::Result<u64> {
    u64::try_from(value).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("negative offset {}", value),
        )
    })
}

pub async fn handle_write(sender: FrameSender, frame: Frame) {
    let chunk = match frame.parse_file_write() {
        Ok(chunk) => chunk,
        Err(e) => return sender.diagnostic(format!("bad file write: {}", e)).await,
    };

    let result = match offset_of(chunk.offset) {
        Ok(offset) => write_chunk(Path::new(&chunk.path), offset, &chunk.data).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            debug!(
                "Wrote {} bytes at {} to {}",
                chunk.data.len(),
                chunk.offset,
                chunk.path
            );
            let _ = sender
                .send(Frame::file_write_ack(chunk.offset, &chunk.path))
                .await;
        }
        Err(e) => {
            warn!("File write to {} failed: {}", chunk.path, e);
            sender.diagnostic(e.to_string()).await;
        }
    }
}

pub async fn handle_stat(sender: FrameSender, frame: Frame) {
    let path = match frame.parse_file_stat() {
        Ok(path) => path,
        Err(e) => return sender.diagnostic(format!("bad file stat: {}", e)).await,
    };

    let reply = match stat(&path).await {
        Ok(info) => Frame::file_info(&info).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    match reply {
        Ok(frame) => {
            let _ = sender.send(frame).await;
        }
        Err(message) => sender.diagnostic(message).await,
    }
}

pub async fn handle_read(sender: FrameSender, frame: Frame) {
    let request = match frame.parse_file_read() {
        Ok(request) => request,
        Err(e) => return sender.diagnostic(format!("bad file read: {}", e)).await,
    };

    let result = match (offset_of(request.offset), offset_of(request.length)) {
        (Ok(offset), Ok(length)) => read_chunk(Path::new(&request.path), offset, length).await,
        (Err(e), _) | (_, Err(e)) => Err(e),
    };

    match result {
        Ok(data) => {
            let _ = sender
                .send(Frame::file_chunk(request.offset, &request.path, &data))
                .await;
        }
        Err(e) => {
            warn!("File read from {} failed: {}", request.path, e);
            sender.diagnostic(e.to_string()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_extends_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");

        write_chunk(&path, 4, b"world").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"\0\0\0\0world");

        write_chunk(&path, 0, b"hey!").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hey!world");
    }

    #[tokio::test]
    async fn test_empty_write_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        write_chunk(&path, 3, b"").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"012");
    }

    #[tokio::test]
    async fn test_read_short_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(read_chunk(&path, 2, 3).await.unwrap(), b"234");
        assert_eq!(read_chunk(&path, 8, 100).await.unwrap(), b"89");
        assert!(read_chunk(&path, 20, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stat_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abc").unwrap();

        let info = stat(path.to_str().unwrap()).await.unwrap();
        assert_eq!(info.size, 3);
        assert!(info.mtime > 0);
        assert!(stat("/definitely/not/here").await.is_err());
    }
}

//! Bulk-transfer plumbing: staging the incoming snapshot on the replica
//! and streaming the finished snapshot file out of the primary.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// How much of the snapshot file is shoveled per write.
pub(crate) const TRANSFER_CHUNK: usize = 16 * 1024;

const TEMP_CREATE_ATTEMPTS: u32 = 5;
const TEMP_CREATE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Staging file for an in-flight snapshot download. Created exclusively
/// next to the canonical dump so [`TempSnapshotFile::persist`] is a rename
/// on the same filesystem; unlinked on drop unless persisted.
pub(crate) struct TempSnapshotFile {
    file: File,
    path: PathBuf,
    persisted: bool,
}

impl TempSnapshotFile {
    pub async fn create(dir: &Path) -> Result<Self> {
        let mut attempts = TEMP_CREATE_ATTEMPTS;
        loop {
            let epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let path = dir.join(format!("temp-{}.{}.rdb", epoch, std::process::id()));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o644)
                .open(&path)
                .await
            {
                Ok(file) => {
                    return Ok(Self {
                        file,
                        path,
                        persisted: false,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempts > 1 => {
                    attempts -= 1;
                    tokio::time::sleep(TEMP_CREATE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        Ok(())
    }

    /// Atomically install the staged file over the canonical dump path.
    pub async fn persist(mut self, dump_path: &Path) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        tokio::fs::rename(&self.path, dump_path).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempSnapshotFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Stream a finished snapshot to one replica: `$<size>\r\n` header, then
/// the file in [`TRANSFER_CHUNK`] slices. Any shortfall is fatal for this
/// replica; the caller drops it.
pub(crate) async fn send_snapshot(stream: &mut TcpStream, mut file: File, size: u64) -> Result<()> {
    stream
        .write_all(format!("${size}\r\n").as_bytes())
        .await?;
    let mut remaining = size;
    let mut chunk = vec![0u8; TRANSFER_CHUNK];
    while remaining > 0 {
        let want = remaining.min(TRANSFER_CHUNK as u64) as usize;
        let n = file.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "premature eof reading snapshot file",
            )));
        }
        stream.write_all(&chunk[..n]).await?;
        remaining -= n as u64;
    }
    stream.flush().await?;
    Ok(())
}

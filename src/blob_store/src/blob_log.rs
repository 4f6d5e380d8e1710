use cluster_lib::{StoreError, StoreResult};
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

pub const LOG_FILE_NAME: &str = "log_current";

const LOG_MAGIC: &[u8; 8] = b"BLOBLOG\0";
const LOG_VERSION: u16 = 1;

/// Size of the fixed log header: magic, version, declared capacity. This is
/// the smallest possible size of a non-empty store.
pub const LOG_HEADER_SIZE: u64 = 8 + 2 + 8;

/// Append-only blob log of one replica. The header is written once at
/// creation; all payload bytes follow it.
pub struct BlobLog {
    path: PathBuf,
    capacity_bytes: u64,
    file: Mutex<File>,
    size: AtomicU64,
}

impl BlobLog {
    pub async fn open(replica_dir: &Path, capacity_bytes: u64) -> StoreResult<Self> {
        let path = replica_dir.join(LOG_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::IoError(format!("open blob log failed: {}", e)))?;

        let metadata = file
            .metadata()
            .await
            .map_err(|e| StoreError::IoError(format!("stat blob log failed: {}", e)))?;
        let size = if metadata.len() == 0 {
            debug!("BlobLog: writing header for {}", path.to_string_lossy());
            file.write_all(LOG_MAGIC)
                .await
                .map_err(|e| StoreError::IoError(format!("write log header failed: {}", e)))?;
            file.write_all(&LOG_VERSION.to_be_bytes())
                .await
                .map_err(|e| StoreError::IoError(format!("write log header failed: {}", e)))?;
            file.write_all(&capacity_bytes.to_be_bytes())
                .await
                .map_err(|e| StoreError::IoError(format!("write log header failed: {}", e)))?;
            file.flush()
                .await
                .map_err(|e| StoreError::IoError(format!("flush log header failed: {}", e)))?;
            LOG_HEADER_SIZE
        } else {
            if metadata.len() < LOG_HEADER_SIZE {
                return Err(StoreError::InvalidState(format!(
                    "blob log {} shorter than its header",
                    path.to_string_lossy()
                )));
            }
            let mut magic = [0u8; 8];
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|e| StoreError::IoError(e.to_string()))?;
            file.read_exact(&mut magic)
                .await
                .map_err(|e| StoreError::IoError(format!("read log header failed: {}", e)))?;
            if &magic != LOG_MAGIC {
                return Err(StoreError::InvalidState(format!(
                    "blob log {} has bad magic",
                    path.to_string_lossy()
                )));
            }
            let mut version = [0u8; 2];
            file.read_exact(&mut version)
                .await
                .map_err(|e| StoreError::IoError(format!("read log header failed: {}", e)))?;
            if u16::from_be_bytes(version) != LOG_VERSION {
                return Err(StoreError::InvalidState(format!(
                    "blob log {} has unsupported version {}",
                    path.to_string_lossy(),
                    u16::from_be_bytes(version)
                )));
            }
            metadata.len()
        };

        Ok(Self {
            path,
            capacity_bytes,
            file: Mutex::new(file),
            size: AtomicU64::new(size),
        })
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn capacity_in_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Append `data` and return the offset it was written at.
    pub async fn append(&self, data: &[u8]) -> StoreResult<u64> {
        let current = self.size.load(Ordering::SeqCst);
        if current + data.len() as u64 > self.capacity_bytes {
            return Err(StoreError::IoError(format!(
                "blob log {} is full: {} + {} > {}",
                self.path.to_string_lossy(),
                current,
                data.len(),
                self.capacity_bytes
            )));
        }
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(current))
            .await
            .map_err(|e| StoreError::IoError(format!("seek blob log failed: {}", e)))?;
        file.write_all(data)
            .await
            .map_err(|e| StoreError::IoError(format!("append blob log failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| StoreError::IoError(format!("flush blob log failed: {}", e)))?;
        self.size.store(current + data.len() as u64, Ordering::SeqCst);
        Ok(current)
    }

    pub async fn read_at(&self, offset: u64, len: u64) -> StoreResult<Vec<u8>> {
        if offset < LOG_HEADER_SIZE || offset + len > self.size.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidParam(format!(
                "read range {}+{} outside blob log {}",
                offset,
                len,
                self.path.to_string_lossy()
            )));
        }
        let mut buffer = vec![0u8; len as usize];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| StoreError::IoError(format!("seek blob log failed: {}", e)))?;
        file.read_exact(&mut buffer)
            .await
            .map_err(|e| StoreError::IoError(format!("read blob log failed: {}", e)))?;
        Ok(buffer)
    }

    /// Force everything down to the device.
    pub async fn sync(&self) -> StoreResult<()> {
        let file = self.file.lock().await;
        file.sync_all()
            .await
            .map_err(|e| StoreError::IoError(format!("sync blob log failed: {}", e)))
    }
}

use crate::blob_log::BlobLog;
use crate::config::StoreConfig;
use crate::store_db::{BlobIndexEntry, BlobStoreDB};
use cluster_lib::{ReplicaId, ReplicaState, StoreError, StoreResult};
use fs2::FileExt;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Marker file signalling "this replica is mid-bootstrap". Survives process
/// restarts; cleared by the replication layer once the replica caught up.
pub const BOOTSTRAP_FILE_NAME: &str = "bootstrap_in_progress";
/// Marker file signalling "this replica is mid-decommission".
pub const DECOMMISSION_FILE_NAME: &str = "decommission_in_progress";
pub const STORE_DB_FILE_NAME: &str = "store.db";
const STORE_LOCK_FILE_NAME: &str = ".store_lock";

struct StateTrack {
    current: ReplicaState,
    previous: ReplicaState,
}

/// One replica's on-disk store: blob log, blob index DB and marker files in
/// the replica directory, plus the lifecycle flags the control plane reads
/// and writes.
pub struct BlobStore {
    replica: ReplicaId,
    config: StoreConfig,
    started: AtomicBool,
    disabled: AtomicBool,
    recover_from_decommission: AtomicBool,
    states: Mutex<StateTrack>,
    log: Mutex<Option<Arc<BlobLog>>>,
    db: Mutex<Option<Arc<BlobStoreDB>>>,
    lock_file: Mutex<Option<std::fs::File>>,
}

impl BlobStore {
    pub fn new(replica: ReplicaId, config: StoreConfig) -> Self {
        Self {
            replica,
            config,
            started: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            recover_from_decommission: AtomicBool::new(false),
            states: Mutex::new(StateTrack {
                current: ReplicaState::Offline,
                previous: ReplicaState::Offline,
            }),
            log: Mutex::new(None),
            db: Mutex::new(None),
            lock_file: Mutex::new(None),
        }
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    pub async fn start(&self) -> StoreResult<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidState(format!(
                "store {} already started",
                self.replica.partition_name()
            )));
        }
        let replica_dir = self.replica.replica_path().to_path_buf();
        tokio::fs::create_dir_all(&replica_dir)
            .await
            .map_err(|e| StoreError::IoError(format!("create replica dir failed: {}", e)))?;

        let lock_path = replica_dir.join(STORE_LOCK_FILE_NAME);
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StoreError::IoError(format!("open store lock failed: {}", e)))?;
        lock_file.try_lock_exclusive().map_err(|e| {
            StoreError::InvalidState(format!(
                "store {} is in use by another process: {}",
                self.replica.partition_name(),
                e
            ))
        })?;

        let db_path = replica_dir.join(STORE_DB_FILE_NAME);
        let db = Arc::new(BlobStoreDB::new(db_path.to_string_lossy().to_string())?);

        {
            let mut states = self.states.lock().unwrap();
            states.current = ReplicaState::Offline;
            states.previous = if self.config.store_persist_replica_state {
                // The state the store held before this boot.
                match db.load_replica_state()? {
                    Some((persisted_current, _)) => persisted_current,
                    None => ReplicaState::Offline,
                }
            } else {
                ReplicaState::Offline
            };
        }

        let log = Arc::new(
            BlobLog::open(&replica_dir, self.replica.capacity_in_bytes()).await?,
        );

        let decommission_marker = replica_dir.join(DECOMMISSION_FILE_NAME);
        if decommission_marker.exists() {
            info!(
                "store {} starts with a decommission marker, will recover from decommission",
                self.replica.partition_name()
            );
            self.recover_from_decommission.store(true, Ordering::SeqCst);
        }

        *self.log.lock().unwrap() = Some(log);
        *self.db.lock().unwrap() = Some(db);
        *self.lock_file.lock().unwrap() = Some(lock_file);
        self.started.store(true, Ordering::SeqCst);
        info!("store {} started", self.replica.partition_name());
        Ok(())
    }

    pub async fn shutdown(&self) -> StoreResult<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(StoreError::StoreNotStarted(format!(
                "store {}",
                self.replica.partition_name()
            )));
        }
        let log = self.log.lock().unwrap().clone();
        if let Some(log) = log {
            if let Err(e) = log.sync().await {
                warn!(
                    "store {}: syncing log during shutdown failed: {}",
                    self.replica.partition_name(),
                    e
                );
            }
        }
        self.set_current_state(ReplicaState::Offline)?;
        *self.log.lock().unwrap() = None;
        *self.db.lock().unwrap() = None;
        // Dropping the handle releases the advisory lock.
        *self.lock_file.lock().unwrap() = None;
        self.started.store(false, Ordering::SeqCst);
        info!("store {} shut down", self.replica.partition_name());
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn recover_from_decommission(&self) -> bool {
        self.recover_from_decommission.load(Ordering::SeqCst)
    }

    pub fn set_recover_from_decommission(&self, recover: bool) {
        self.recover_from_decommission.store(recover, Ordering::SeqCst);
    }

    pub fn get_current_state(&self) -> ReplicaState {
        self.states.lock().unwrap().current
    }

    pub fn get_previous_state(&self) -> ReplicaState {
        self.states.lock().unwrap().previous
    }

    pub fn set_current_state(&self, state: ReplicaState) -> StoreResult<()> {
        let (current, previous) = {
            let mut states = self.states.lock().unwrap();
            states.previous = states.current;
            states.current = state;
            (states.current, states.previous)
        };
        debug!(
            "store {}: state {} (previous {})",
            self.replica.partition_name(),
            current,
            previous
        );
        if self.config.store_persist_replica_state {
            let db = self.db.lock().unwrap().clone();
            if let Some(db) = db {
                db.save_replica_state(current, previous)?;
            }
        }
        Ok(())
    }

    pub fn get_size_in_bytes(&self) -> StoreResult<u64> {
        let log = self.log.lock().unwrap().clone().ok_or_else(|| {
            StoreError::StoreNotStarted(format!("store {}", self.replica.partition_name()))
        })?;
        Ok(log.size_in_bytes())
    }

    fn runtime(&self) -> StoreResult<(Arc<BlobLog>, Arc<BlobStoreDB>)> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(StoreError::StoreNotStarted(format!(
                "store {}",
                self.replica.partition_name()
            )));
        }
        if self.disabled.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidState(format!(
                "store {} is disabled",
                self.replica.partition_name()
            )));
        }
        let log = self.log.lock().unwrap().clone();
        let db = self.db.lock().unwrap().clone();
        match (log, db) {
            (Some(log), Some(db)) => Ok((log, db)),
            _ => Err(StoreError::StoreNotStarted(format!(
                "store {}",
                self.replica.partition_name()
            ))),
        }
    }

    /// Blobs are immutable: a second put of the same id is rejected.
    pub async fn put_blob(&self, blob_id: &str, data: &[u8]) -> StoreResult<()> {
        let (log, db) = self.runtime()?;
        match db.get_blob(blob_id) {
            Ok(_) => {
                return Err(StoreError::AlreadyExists(format!(
                    "blob already exists: {}",
                    blob_id
                )))
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let offset = match log.append(data).await {
            Ok(offset) => offset,
            Err(e) => {
                warn!(
                    "store {}: append failed, disabling store: {}",
                    self.replica.partition_name(),
                    e
                );
                self.disabled.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        db.set_blob(&BlobIndexEntry::new(blob_id, offset, data.len() as u64))
    }

    pub async fn get_blob(&self, blob_id: &str) -> StoreResult<Vec<u8>> {
        let (log, db) = self.runtime()?;
        let entry = db.get_blob(blob_id)?;
        log.read_at(entry.offset, entry.size).await
    }

    /// One compaction pass. Blobs are immutable and undeleted data never
    /// shrinks, so the pass amounts to forcing the log down to the device;
    /// the scheduling around it is what the control plane owns.
    pub async fn compact_once(&self) -> StoreResult<()> {
        let (log, _db) = self.runtime()?;
        log.sync().await?;
        debug!(
            "store {}: compaction pass complete, {} bytes",
            self.replica.partition_name(),
            log.size_in_bytes()
        );
        Ok(())
    }
}

fn marker_path(replica: &ReplicaId, marker: &str) -> PathBuf {
    replica.replica_path().join(marker)
}

pub async fn create_bootstrap_file_if_absent(replica: &ReplicaId) -> StoreResult<()> {
    let path = marker_path(replica, BOOTSTRAP_FILE_NAME);
    if !path.exists() {
        tokio::fs::File::create(&path)
            .await
            .map_err(|e| StoreError::IoError(format!("create bootstrap marker failed: {}", e)))?;
        info!(
            "bootstrap marker created for replica {}",
            replica.replica_path().to_string_lossy()
        );
    }
    Ok(())
}

pub async fn create_decommission_file_if_absent(replica: &ReplicaId) -> StoreResult<()> {
    let path = marker_path(replica, DECOMMISSION_FILE_NAME);
    if !path.exists() {
        tokio::fs::File::create(&path).await.map_err(|e| {
            StoreError::IoError(format!("create decommission marker failed: {}", e))
        })?;
        info!(
            "decommission marker created for replica {}",
            replica.replica_path().to_string_lossy()
        );
    }
    Ok(())
}

pub async fn delete_decommission_file(replica: &ReplicaId) -> StoreResult<()> {
    let path = marker_path(replica, DECOMMISSION_FILE_NAME);
    if path.exists() {
        tokio::fs::remove_file(&path).await.map_err(|e| {
            StoreError::IoError(format!("delete decommission marker failed: {}", e))
        })?;
        info!(
            "old decommission marker deleted for replica {}",
            replica.replica_path().to_string_lossy()
        );
    }
    Ok(())
}

pub fn decommission_file_exists(replica: &ReplicaId) -> bool {
    marker_path(replica, DECOMMISSION_FILE_NAME).exists()
}

pub fn bootstrap_file_exists(replica: &ReplicaId) -> bool {
    marker_path(replica, BOOTSTRAP_FILE_NAME).exists()
}

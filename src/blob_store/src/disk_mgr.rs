use crate::blob_store::BlobStore;
use crate::compaction::CompactionManager;
use crate::config::{DiskManagerConfig, StoreConfig};
use crate::metrics::StorageManagerMetrics;
use cluster_lib::{
    DiskId, PartitionId, ReplicaId, ReplicaStatusDelegate, StoreError, StoreResult,
};
use futures::future::join_all;
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// Owns every blob store resident on one disk: opens them in parallel at
/// start, watches over their compaction, and carries the disk-level health
/// the storage manager consults.
pub struct DiskManager {
    disk: DiskId,
    store_config: StoreConfig,
    disk_config: DiskManagerConfig,
    stores: Arc<RwLock<HashMap<PartitionId, Arc<BlobStore>>>>,
    compaction: CompactionManager,
    replica_status_delegates: Vec<Arc<ReplicaStatusDelegate>>,
    stopped_replicas: Arc<StdMutex<HashSet<String>>>,
    unexpected_dirs: StdMutex<Vec<PathBuf>>,
    metrics: Arc<StorageManagerMetrics>,
    running: AtomicBool,
}

impl DiskManager {
    pub fn new(
        disk: DiskId,
        replicas: Vec<ReplicaId>,
        store_config: StoreConfig,
        disk_config: DiskManagerConfig,
        replica_status_delegates: Vec<Arc<ReplicaStatusDelegate>>,
        stopped_replicas: Arc<StdMutex<HashSet<String>>>,
        metrics: Arc<StorageManagerMetrics>,
    ) -> Self {
        let mut store_map = HashMap::new();
        for replica in replicas {
            let partition = replica.partition_id();
            let store = Arc::new(BlobStore::new(replica, store_config.clone()));
            store_map.insert(partition, store);
        }
        let stores = Arc::new(RwLock::new(store_map));
        let compaction = CompactionManager::new(
            disk.mount_path().to_path_buf(),
            Duration::from_secs(store_config.store_compaction_check_interval_seconds),
            stores.clone(),
        );
        Self {
            disk,
            store_config,
            disk_config,
            stores,
            compaction,
            replica_status_delegates,
            stopped_replicas,
            unexpected_dirs: StdMutex::new(Vec::new()),
            metrics,
            running: AtomicBool::new(false),
        }
    }

    pub fn disk(&self) -> &DiskId {
        &self.disk
    }

    /// Open all owned stores in parallel. Individual store failures are
    /// contained: the store stays down (and the coordinator will drive its
    /// replica to ERROR), the disk manager itself keeps going.
    pub async fn start(&self) -> StoreResult<()> {
        let mount_path = self.disk.mount_path().to_path_buf();
        tokio::fs::create_dir_all(&mount_path)
            .await
            .map_err(|e| StoreError::IoError(format!("create mount dir failed: {}", e)))?;
        let reserve_dir =
            mount_path.join(&self.disk_config.disk_manager_reserve_file_dir_name);
        tokio::fs::create_dir_all(&reserve_dir)
            .await
            .map_err(|e| StoreError::IoError(format!("create reserve dir failed: {}", e)))?;

        let stopped = self.stopped_replicas.lock().unwrap().clone();
        let snapshot: Vec<(PartitionId, Arc<BlobStore>)> = self
            .stores
            .read()
            .await
            .iter()
            .map(|(partition, store)| (*partition, store.clone()))
            .collect();

        let mut handles = Vec::new();
        for (partition, store) in snapshot {
            if stopped.contains(&partition.to_path_string()) {
                info!(
                    "skip starting store {} on {}: replica is marked stopped",
                    partition,
                    mount_path.to_string_lossy()
                );
                continue;
            }
            handles.push(tokio::spawn(async move {
                (partition, store.start().await)
            }));
        }
        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((partition, Err(e))) => {
                    self.metrics.inc_store_start_failures();
                    error!(
                        "store {} on {} failed to start: {}",
                        partition,
                        mount_path.to_string_lossy(),
                        e
                    );
                }
                Err(e) => {
                    error!(
                        "store startup task on {} did not finish: {}",
                        mount_path.to_string_lossy(),
                        e
                    );
                }
            }
        }

        self.discover_unexpected_dirs().await?;
        self.compaction.start();
        self.running.store(true, Ordering::SeqCst);
        info!("disk manager for {} started", mount_path.to_string_lossy());
        Ok(())
    }

    async fn discover_unexpected_dirs(&self) -> StoreResult<()> {
        let mount_path = self.disk.mount_path();
        let owned: HashSet<String> = self
            .stores
            .read()
            .await
            .values()
            .map(|store| store.replica().partition_name())
            .collect();
        let mut unexpected = Vec::new();
        let mut entries = tokio::fs::read_dir(mount_path)
            .await
            .map_err(|e| StoreError::IoError(format!("scan mount dir failed: {}", e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::IoError(format!("scan mount dir failed: {}", e)))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StoreError::IoError(e.to_string()))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name == self.disk_config.disk_manager_reserve_file_dir_name
                || owned.contains(&name)
            {
                continue;
            }
            warn!(
                "unexpected dir {} found on {}",
                name,
                mount_path.to_string_lossy()
            );
            unexpected.push(entry.path());
        }
        *self.unexpected_dirs.lock().unwrap() = unexpected;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.compaction.shutdown().await;
        let snapshot: Vec<(PartitionId, Arc<BlobStore>)> = self
            .stores
            .read()
            .await
            .iter()
            .map(|(partition, store)| (*partition, store.clone()))
            .collect();
        let mut handles = Vec::new();
        for (partition, store) in snapshot {
            handles.push(tokio::spawn(async move {
                (partition, store.shutdown().await)
            }));
        }
        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((partition, Err(StoreError::StoreNotStarted(_)))) => {
                    info!("store {} was already down at disk shutdown", partition);
                }
                Ok((partition, Err(e))) => {
                    error!("store {} failed to shut down: {}", partition, e);
                }
                Err(e) => {
                    error!(
                        "store shutdown task on {} did not finish: {}",
                        self.disk.mount_path().to_string_lossy(),
                        e
                    );
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!(
            "disk manager for {} shut down",
            self.disk.mount_path().to_string_lossy()
        );
    }

    pub async fn get_store(
        &self,
        partition: PartitionId,
        skip_state_check: bool,
    ) -> Option<Arc<BlobStore>> {
        let stores = self.stores.read().await;
        let store = stores.get(&partition)?;
        if store.is_started() || skip_state_check {
            Some(store.clone())
        } else {
            None
        }
    }

    pub async fn owns_partition(&self, partition: PartitionId) -> bool {
        self.stores.read().await.contains_key(&partition)
    }

    /// Create and start a store for a replica newly assigned to this disk.
    pub async fn add_blob_store(&self, replica: &ReplicaId) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            warn!(
                "cannot add store {}: disk manager for {} is not running",
                replica.partition_name(),
                self.disk.mount_path().to_string_lossy()
            );
            return false;
        }
        let partition = replica.partition_id();
        {
            let stores = self.stores.read().await;
            if stores.contains_key(&partition) {
                warn!("store {} already exists on this disk", partition);
                return false;
            }
        }
        // A directory left behind by a failed earlier addition of this
        // replica must go before the brand-new store is created.
        let replica_dir = replica.replica_path();
        if replica_dir.is_dir() {
            info!(
                "deleting old store dir {} from a previous replica addition",
                replica_dir.to_string_lossy()
            );
            if let Err(e) = tokio::fs::remove_dir_all(replica_dir).await {
                error!(
                    "failed to delete old store dir {}: {}",
                    replica_dir.to_string_lossy(),
                    e
                );
                return false;
            }
        }
        let store = Arc::new(BlobStore::new(replica.clone(), self.store_config.clone()));
        if let Err(e) = store.start().await {
            self.metrics.inc_store_start_failures();
            error!("failed to start new store {}: {}", partition, e);
            return false;
        }
        // A freshly added replica has to catch up with its peers before it
        // serves traffic, so it starts its life mid-bootstrap.
        if let Err(e) = crate::blob_store::create_bootstrap_file_if_absent(replica).await {
            error!(
                "failed to create bootstrap marker for new store {}: {}",
                partition, e
            );
            if let Err(e) = store.shutdown().await {
                warn!("failed to shut down half-added store {}: {}", partition, e);
            }
            return false;
        }
        self.stores.write().await.insert(partition, store);
        info!(
            "store {} added to disk manager for {}",
            partition,
            self.disk.mount_path().to_string_lossy()
        );
        true
    }

    /// Shut the store down if needed and delete its directory tree.
    pub async fn remove_blob_store(&self, partition: PartitionId) -> StoreResult<()> {
        let store = {
            let stores = self.stores.read().await;
            stores.get(&partition).cloned().ok_or_else(|| {
                StoreError::NotFound(format!("store {} not found on this disk", partition))
            })?
        };
        self.compaction.control_compaction(partition, false);
        if store.is_started() {
            store.shutdown().await?;
        }
        self.stores.write().await.remove(&partition);
        // Forget any compaction-disable left over so a re-added replica of
        // this partition compacts again.
        self.compaction.control_compaction(partition, true);
        let replica_dir = store.replica().replica_path().to_path_buf();
        if replica_dir.exists() {
            tokio::fs::remove_dir_all(&replica_dir).await.map_err(|e| {
                StoreError::IoError(format!(
                    "delete replica dir {} failed: {}",
                    replica_dir.to_string_lossy(),
                    e
                ))
            })?;
        }
        info!("store {} removed and its directory deleted", partition);
        Ok(())
    }

    pub async fn start_blob_store(&self, partition: PartitionId) -> bool {
        let store = match self.get_store(partition, true).await {
            Some(store) => store,
            None => return false,
        };
        if store.is_started() {
            return true;
        }
        match store.start().await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to start store {}: {}", partition, e);
                false
            }
        }
    }

    pub async fn shutdown_blob_store(&self, partition: PartitionId) -> bool {
        let store = match self.get_store(partition, true).await {
            Some(store) => store,
            None => return false,
        };
        match store.shutdown().await {
            Ok(()) => true,
            // Shutting down an already-stopped store is a no-op.
            Err(StoreError::StoreNotStarted(_)) => true,
            Err(e) => {
                error!("failed to shut down store {}: {}", partition, e);
                false
            }
        }
    }

    /// Persist the stop flag through every replica-status delegate and keep
    /// the in-memory set in line. Returns the partitions that could not be
    /// updated.
    pub async fn set_blob_store_stopped_state(
        &self,
        partitions: &[PartitionId],
        stop: bool,
    ) -> Vec<PartitionId> {
        let mut failed = Vec::new();
        let mut replicas = Vec::new();
        {
            let stores = self.stores.read().await;
            for partition in partitions {
                match stores.get(partition) {
                    Some(store) => replicas.push(store.replica().clone()),
                    None => {
                        warn!("cannot update stop state of unknown store {}", partition);
                        failed.push(*partition);
                    }
                }
            }
        }
        if replicas.is_empty() {
            return failed;
        }
        let mut persisted = true;
        for delegate in &self.replica_status_delegates {
            let updated = if stop {
                delegate.mark_stopped(&replicas).await
            } else {
                delegate.unmark_stopped(&replicas).await
            };
            if !updated {
                persisted = false;
            }
        }
        if persisted {
            let mut stopped = self.stopped_replicas.lock().unwrap();
            for replica in &replicas {
                if stop {
                    stopped.insert(replica.partition_name());
                } else {
                    stopped.remove(&replica.partition_name());
                }
            }
        } else {
            failed.extend(replicas.iter().map(|r| r.partition_id()));
        }
        failed
    }

    pub async fn schedule_next_for_compaction(&self, partition: PartitionId) -> bool {
        if !self.owns_partition(partition).await {
            return false;
        }
        self.compaction.schedule_next(partition).await
    }

    pub async fn control_compaction_for_blob_store(
        &self,
        partition: PartitionId,
        enabled: bool,
    ) -> bool {
        if !self.owns_partition(partition).await {
            return false;
        }
        self.compaction.control_compaction(partition, enabled);
        true
    }

    pub async fn are_all_stores_down(&self) -> bool {
        let stores = self.stores.read().await;
        stores.values().all(|store| !store.is_started())
    }

    pub fn is_compaction_executor_running(&self) -> bool {
        self.compaction.is_running()
    }

    pub fn get_unexpected_dirs(&self) -> Vec<PathBuf> {
        self.unexpected_dirs.lock().unwrap().clone()
    }

    pub fn compaction_manager(&self) -> &CompactionManager {
        &self.compaction
    }
}

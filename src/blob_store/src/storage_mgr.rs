use crate::blob_store::BlobStore;
use crate::config::{DiskManagerConfig, StoreConfig};
use crate::disk_mgr::DiskManager;
use crate::metrics::StorageManagerMetrics;
use crate::state_listener::StorageManagerStateListener;
use cluster_lib::{
    ClusterMap, ClusterParticipant, DataNodeId, DiskId, PartitionId, ReplicaId,
    ReplicaStatusDelegate, ReplicaSyncUpManager, ServerErrorCode, StateModelListenerType,
    StoreError, StoreResult,
};
use futures::future::join_all;
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::RwLock;

/// The per-node control plane: owns every disk manager, routes partition
/// state transitions coming from the cluster participants, and keeps the
/// node's replica maps consistent with what the disks actually hold.
pub struct StorageManager {
    store_config: StoreConfig,
    disk_config: DiskManagerConfig,
    cluster_map: Arc<dyn ClusterMap>,
    current_node: DataNodeId,
    participants: Vec<Arc<dyn ClusterParticipant>>,
    primary_participant: Option<Arc<dyn ClusterParticipant>>,
    replica_sync_up_manager: Option<Arc<dyn ReplicaSyncUpManager>>,
    replica_status_delegates: Vec<Arc<ReplicaStatusDelegate>>,
    stopped_replicas: Arc<StdMutex<HashSet<String>>>,
    partition_to_disk_manager: RwLock<HashMap<PartitionId, Arc<DiskManager>>>,
    disk_to_disk_manager: RwLock<HashMap<DiskId, Arc<DiskManager>>>,
    partition_name_to_replica: RwLock<HashMap<String, ReplicaId>>,
    unexpected_dirs: StdMutex<HashSet<PathBuf>>,
    metrics: Arc<StorageManagerMetrics>,
}

impl StorageManager {
    /// The first participant, if any, is the primary: only its listener may
    /// mutate internal store state, and only it supplies the replica
    /// sync-up manager.
    pub async fn new(
        store_config: StoreConfig,
        disk_config: DiskManagerConfig,
        cluster_map: Arc<dyn ClusterMap>,
        current_node: DataNodeId,
        participants: Vec<Arc<dyn ClusterParticipant>>,
    ) -> StoreResult<Arc<Self>> {
        verify_configs(&store_config, &disk_config)?;

        let primary_participant = participants.first().cloned();
        let replica_sync_up_manager = primary_participant
            .as_ref()
            .and_then(|p| p.get_replica_sync_up_manager());

        let mut replica_status_delegates = Vec::new();
        let mut stopped_replicas = HashSet::new();
        for participant in &participants {
            let delegate = Arc::new(ReplicaStatusDelegate::new(participant.clone()));
            stopped_replicas.extend(delegate.get_stopped_replicas().await);
            replica_status_delegates.push(delegate);
        }
        let stopped_replicas = Arc::new(StdMutex::new(stopped_replicas));
        let metrics = Arc::new(StorageManagerMetrics::default());

        let mut partition_name_to_replica = HashMap::new();
        let mut disk_to_replicas: HashMap<DiskId, Vec<ReplicaId>> = HashMap::new();
        for replica in cluster_map.get_replica_ids(&current_node) {
            partition_name_to_replica.insert(replica.partition_name(), replica.clone());
            disk_to_replicas
                .entry(replica.disk_id().clone())
                .or_default()
                .push(replica);
        }

        let mut disk_to_disk_manager = HashMap::new();
        let mut partition_to_disk_manager = HashMap::new();
        for (disk, replicas) in disk_to_replicas {
            let partitions: Vec<PartitionId> =
                replicas.iter().map(|r| r.partition_id()).collect();
            let disk_manager = Arc::new(DiskManager::new(
                disk.clone(),
                replicas,
                store_config.clone(),
                disk_config.clone(),
                replica_status_delegates.clone(),
                stopped_replicas.clone(),
                metrics.clone(),
            ));
            disk_to_disk_manager.insert(disk, disk_manager.clone());
            for partition in partitions {
                partition_to_disk_manager.insert(partition, disk_manager.clone());
            }
        }

        Ok(Arc::new(Self {
            store_config,
            disk_config,
            cluster_map,
            current_node,
            participants,
            primary_participant,
            replica_sync_up_manager,
            replica_status_delegates,
            stopped_replicas,
            partition_to_disk_manager: RwLock::new(partition_to_disk_manager),
            disk_to_disk_manager: RwLock::new(disk_to_disk_manager),
            partition_name_to_replica: RwLock::new(partition_name_to_replica),
            unexpected_dirs: StdMutex::new(HashSet::new()),
            metrics,
        }))
    }

    /// Start every disk manager concurrently, then register with the
    /// participants. Not re-entrant: call once per manager.
    pub async fn start(self: &Arc<Self>) -> StoreResult<()> {
        let started_at = Instant::now();
        info!("starting storage manager");

        let disk_managers: Vec<Arc<DiskManager>> = self
            .disk_to_disk_manager
            .read()
            .await
            .values()
            .cloned()
            .collect();
        let mut handles = Vec::new();
        for disk_manager in disk_managers {
            handles.push(tokio::spawn(async move {
                let mount = disk_manager.disk().mount_path().to_path_buf();
                (mount, disk_manager.start().await)
            }));
        }
        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((mount, Err(e))) => {
                    // One bad disk must not keep the others from serving.
                    error!(
                        "disk manager for {} failed to start: {}",
                        mount.to_string_lossy(),
                        e
                    );
                }
                Err(e) => {
                    error!("disk manager startup task did not finish: {}", e);
                }
            }
        }

        let local_partitions: HashSet<String> = self
            .partition_name_to_replica
            .read()
            .await
            .keys()
            .cloned()
            .collect();
        for (index, participant) in self.participants.iter().enumerate() {
            let listener =
                StorageManagerStateListener::new(Arc::downgrade(self), index == 0);
            participant
                .register_partition_state_change_listener(
                    StateModelListenerType::StorageManagerListener,
                    listener,
                )
                .await;
            if let Err(e) = participant
                .set_initial_local_partitions(local_partitions.clone())
                .await
            {
                warn!("seeding initial local partitions failed: {}", e);
            }
        }

        let mut collected = Vec::new();
        for disk_manager in self.disk_to_disk_manager.read().await.values() {
            collected.extend(disk_manager.get_unexpected_dirs());
        }
        self.unexpected_dirs.lock().unwrap().extend(collected);

        self.metrics
            .record_start_time_ms(started_at.elapsed().as_millis() as u64);
        info!("starting storage manager complete");
        Ok(())
    }

    /// Shut every disk manager down concurrently. Individual failures are
    /// logged, never propagated.
    pub async fn shutdown(&self) {
        let started_at = Instant::now();
        info!("shutting down storage manager");
        let disk_managers: Vec<Arc<DiskManager>> = self
            .disk_to_disk_manager
            .read()
            .await
            .values()
            .cloned()
            .collect();
        let mut handles = Vec::new();
        for disk_manager in disk_managers {
            handles.push(tokio::spawn(async move {
                disk_manager.shutdown().await;
            }));
        }
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!("disk manager shutdown task did not finish: {}", e);
            }
        }
        self.metrics
            .record_shutdown_time_ms(started_at.elapsed().as_millis() as u64);
        info!("shutting down storage manager complete");
    }

    pub async fn get_store(
        &self,
        partition: PartitionId,
        skip_state_check: bool,
    ) -> Option<Arc<BlobStore>> {
        let disk_manager = self
            .partition_to_disk_manager
            .read()
            .await
            .get(&partition)
            .cloned()?;
        disk_manager.get_store(partition, skip_state_check).await
    }

    pub async fn get_replica(&self, partition_name: &str) -> Option<ReplicaId> {
        self.partition_name_to_replica
            .read()
            .await
            .get(partition_name)
            .cloned()
    }

    pub async fn get_local_partitions(&self) -> Vec<PartitionId> {
        self.partition_to_disk_manager
            .read()
            .await
            .keys()
            .copied()
            .collect()
    }

    pub async fn check_local_partition_status(
        &self,
        partition: PartitionId,
        local_replica: Option<&ReplicaId>,
    ) -> ServerErrorCode {
        if self.get_store(partition, false).await.is_some() {
            return ServerErrorCode::NoError;
        }
        match local_replica {
            Some(replica) => {
                if !self.is_disk_available(replica.disk_id()).await {
                    ServerErrorCode::DiskUnavailable
                } else {
                    ServerErrorCode::ReplicaUnavailable
                }
            }
            None => ServerErrorCode::PartitionUnknown,
        }
    }

    /// A disk is available when a disk manager exists for it and at least
    /// one of its stores is up.
    pub async fn is_disk_available(&self, disk: &DiskId) -> bool {
        let disk_manager = self.disk_to_disk_manager.read().await.get(disk).cloned();
        match disk_manager {
            Some(disk_manager) => !disk_manager.are_all_stores_down().await,
            None => false,
        }
    }

    pub async fn schedule_next_for_compaction(&self, partition: PartitionId) -> bool {
        match self.disk_manager_for(partition).await {
            Some(disk_manager) => disk_manager.schedule_next_for_compaction(partition).await,
            None => false,
        }
    }

    pub async fn control_compaction_for_blob_store(
        &self,
        partition: PartitionId,
        enabled: bool,
    ) -> bool {
        match self.disk_manager_for(partition).await {
            Some(disk_manager) => {
                disk_manager
                    .control_compaction_for_blob_store(partition, enabled)
                    .await
            }
            None => false,
        }
    }

    pub async fn start_blob_store(&self, partition: PartitionId) -> bool {
        match self.disk_manager_for(partition).await {
            Some(disk_manager) => disk_manager.start_blob_store(partition).await,
            None => false,
        }
    }

    pub async fn shutdown_blob_store(&self, partition: PartitionId) -> bool {
        match self.disk_manager_for(partition).await {
            Some(disk_manager) => disk_manager.shutdown_blob_store(partition).await,
            None => false,
        }
    }

    /// Add a store for a replica newly assigned to this node. The maps are
    /// published only after the disk manager reports success, so readers
    /// never observe a store this manager claims but the disk does not hold.
    pub async fn add_blob_store(&self, replica: &ReplicaId) -> bool {
        let partition = replica.partition_id();
        if self
            .partition_to_disk_manager
            .read()
            .await
            .contains_key(&partition)
        {
            info!(
                "{} already exists in storage manager, rejecting adding store request",
                partition
            );
            return false;
        }
        let disk = replica.disk_id().clone();
        let existing = self.disk_to_disk_manager.read().await.get(&disk).cloned();
        let disk_manager = match existing {
            Some(disk_manager) => disk_manager,
            None => {
                let mut disk_map = self.disk_to_disk_manager.write().await;
                match disk_map.get(&disk) {
                    Some(disk_manager) => disk_manager.clone(),
                    None => {
                        info!(
                            "creating new disk manager on {} for new added store",
                            disk.mount_path().to_string_lossy()
                        );
                        let disk_manager = Arc::new(DiskManager::new(
                            disk.clone(),
                            Vec::new(),
                            self.store_config.clone(),
                            self.disk_config.clone(),
                            self.replica_status_delegates.clone(),
                            self.stopped_replicas.clone(),
                            self.metrics.clone(),
                        ));
                        if let Err(e) = disk_manager.start().await {
                            error!(
                                "error while starting the new disk manager for {}: {}",
                                disk.mount_path().to_string_lossy(),
                                e
                            );
                            return false;
                        }
                        disk_map.insert(disk.clone(), disk_manager.clone());
                        disk_manager
                    }
                }
            }
        };
        if !disk_manager.add_blob_store(replica).await {
            error!("failed to add new store into disk manager");
            return false;
        }
        self.partition_to_disk_manager
            .write()
            .await
            .insert(partition, disk_manager);
        self.partition_name_to_replica
            .write()
            .await
            .insert(replica.partition_name(), replica.clone());
        info!("new store {} is successfully added into storage manager", partition);
        true
    }

    /// Remove the store and its on-disk directory, then prune the maps. The
    /// partition map entry goes strictly before the name map entry so that
    /// no reader ever sees a disk manager for a replica this node disowned.
    pub async fn remove_blob_store(&self, partition: PartitionId) -> StoreResult<bool> {
        let disk_manager = self
            .partition_to_disk_manager
            .read()
            .await
            .get(&partition)
            .cloned();
        let disk_manager = match disk_manager {
            Some(disk_manager) => disk_manager,
            None => {
                info!("store {} is not found in storage manager", partition);
                return Ok(false);
            }
        };
        disk_manager.remove_blob_store(partition).await?;
        self.partition_to_disk_manager
            .write()
            .await
            .remove(&partition);
        self.partition_name_to_replica
            .write()
            .await
            .remove(&partition.to_path_string());
        info!("store {} is successfully removed from storage manager", partition);
        Ok(true)
    }

    pub async fn set_blob_store_stopped_state(
        &self,
        partitions: &[PartitionId],
        stop: bool,
    ) -> Vec<PartitionId> {
        let mut failed = Vec::new();
        let mut groups: HashMap<PathBuf, (Arc<DiskManager>, Vec<PartitionId>)> = HashMap::new();
        {
            let map = self.partition_to_disk_manager.read().await;
            for partition in partitions {
                match map.get(partition) {
                    Some(disk_manager) => {
                        groups
                            .entry(disk_manager.disk().mount_path().to_path_buf())
                            .or_insert_with(|| (disk_manager.clone(), Vec::new()))
                            .1
                            .push(*partition);
                    }
                    None => failed.push(*partition),
                }
            }
        }
        for (_, (disk_manager, group)) in groups {
            failed.extend(
                disk_manager
                    .set_blob_store_stopped_state(&group, stop)
                    .await,
            );
        }
        failed
    }

    pub fn get_stopped_replicas(&self) -> HashSet<String> {
        self.stopped_replicas.lock().unwrap().clone()
    }

    pub fn get_unexpected_dirs(&self) -> Vec<PathBuf> {
        self.unexpected_dirs.lock().unwrap().iter().cloned().collect()
    }

    pub async fn disk_manager_count(&self) -> usize {
        self.disk_to_disk_manager.read().await.len()
    }

    pub fn metrics(&self) -> &Arc<StorageManagerMetrics> {
        &self.metrics
    }

    pub(crate) async fn disk_manager_for(
        &self,
        partition: PartitionId,
    ) -> Option<Arc<DiskManager>> {
        self.partition_to_disk_manager
            .read()
            .await
            .get(&partition)
            .cloned()
    }

    pub(crate) fn cluster_map(&self) -> &Arc<dyn ClusterMap> {
        &self.cluster_map
    }

    pub(crate) fn current_node(&self) -> &DataNodeId {
        &self.current_node
    }

    pub(crate) fn primary_participant(&self) -> Option<&Arc<dyn ClusterParticipant>> {
        self.primary_participant.as_ref()
    }

    pub(crate) fn sync_up_manager(&self) -> Option<&Arc<dyn ReplicaSyncUpManager>> {
        self.replica_sync_up_manager.as_ref()
    }

    pub(crate) async fn prune_replica_name(&self, partition_name: &str) {
        self.partition_name_to_replica
            .write()
            .await
            .remove(partition_name);
    }

    /// Delete any leftover directory of a replica the coordinator already
    /// dropped from its own config before this node could finish the
    /// decommission.
    pub(crate) async fn maybe_delete_residual_directory(
        &self,
        partition_name: &str,
    ) -> StoreResult<()> {
        let candidates: Vec<PathBuf> = self
            .unexpected_dirs
            .lock()
            .unwrap()
            .iter()
            .filter(|dir| {
                dir.file_name()
                    .map(|name| name.to_string_lossy() == partition_name)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for dir in candidates {
            info!(
                "deleting residual directory {} associated with removed store {}",
                dir.to_string_lossy(),
                partition_name
            );
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
                StoreError::IoError(format!(
                    "couldn't delete directory {}: {}",
                    dir.to_string_lossy(),
                    e
                ))
            })?;
            self.unexpected_dirs.lock().unwrap().remove(&dir);
        }
        Ok(())
    }
}

/// Hard deletes must never reach the part of the log that has not been
/// flushed yet, so the deleted-message retention window has to stay ahead of
/// the flush interval.
fn verify_configs(
    store_config: &StoreConfig,
    disk_config: &DiskManagerConfig,
) -> StoreResult<()> {
    if store_config.store_enable_hard_delete
        && store_config.store_deleted_message_retention_minutes
            < store_config.store_data_flush_interval_seconds / 60 + 1
    {
        return Err(StoreError::Initialization(
            "deleted-message retention must be greater than the flush interval when hard \
             delete is enabled"
                .to_string(),
        ));
    }
    if disk_config.disk_manager_reserve_file_dir_name.is_empty() {
        return Err(StoreError::Initialization(
            "reserve file directory name is empty".to_string(),
        ));
    }
    Ok(())
}

use crate::blob_log::LOG_HEADER_SIZE;
use crate::blob_store::{
    create_bootstrap_file_if_absent, create_decommission_file_if_absent,
    decommission_file_exists, delete_decommission_file,
};
use crate::storage_mgr::StorageManager;
use async_trait::async_trait;
use cluster_lib::{
    PartitionStateChangeListener, ReplicaState, StateModelListenerType, StateTransitionError,
    TransitionResult,
};
use log::{error, info};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// The storage manager's partition-state listener. One instance is
/// registered per cluster participant; only the instance bound to the
/// primary participant writes internal store state, because the replication
/// manager listens to the primary alone and store state written by a
/// secondary would be left stuck in BOOTSTRAP.
pub struct StorageManagerStateListener {
    storage_manager: Weak<StorageManager>,
    is_primary: bool,
}

impl StorageManagerStateListener {
    pub fn new(storage_manager: Weak<StorageManager>, is_primary: bool) -> Arc<Self> {
        Arc::new(Self {
            storage_manager,
            is_primary,
        })
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    fn manager(&self) -> TransitionResult<Arc<StorageManager>> {
        self.storage_manager.upgrade().ok_or_else(|| {
            StateTransitionError::ReplicaOperationFailure(
                "storage manager is no longer alive".to_string(),
            )
        })
    }

    /// Repeat the standby-to-inactive and inactive-to-offline legs of a
    /// decommission that was cut short, waiting on the sync-up barriers in
    /// between so peer replicas catch up before the replica is dropped.
    async fn resume_decommission(
        &self,
        storage_manager: &Arc<StorageManager>,
        partition_name: &str,
    ) -> TransitionResult<()> {
        info!("resuming decommission on replica {}", partition_name);
        // Disable compaction before anything else so the position of the
        // last PUT in the store cannot move.
        self.on_become_inactive_from_standby(partition_name).await?;

        let replication_listener = match storage_manager.primary_participant() {
            Some(primary) => primary
                .get_partition_state_change_listeners()
                .await
                .get(&StateModelListenerType::ReplicationManagerListener)
                .cloned(),
            None => None,
        };
        if let (Some(replication), Some(sync_up)) =
            (replication_listener, storage_manager.sync_up_manager())
        {
            replication
                .on_become_inactive_from_standby(partition_name)
                .await?;
            sync_up
                .wait_deactivation_completed(partition_name)
                .await
                .map_err(|e| {
                    StateTransitionError::ReplicaOperationFailure(format!(
                        "deactivation of {} did not complete: {}",
                        partition_name, e
                    ))
                })?;
            replication
                .on_become_offline_from_inactive(partition_name)
                .await?;
            sync_up
                .wait_disconnection_completed(partition_name)
                .await
                .map_err(|e| {
                    StateTransitionError::ReplicaOperationFailure(format!(
                        "disconnection of {} did not complete: {}",
                        partition_name, e
                    ))
                })?;
        }
        self.on_become_offline_from_inactive(partition_name).await?;
        info!(
            "decommission on replica {} is almost done, dropping it from current node",
            partition_name
        );
        Ok(())
    }
}

#[async_trait]
impl PartitionStateChangeListener for StorageManagerStateListener {
    async fn on_become_bootstrap_from_offline(
        &self,
        partition_name: &str,
    ) -> TransitionResult<()> {
        let storage_manager = self.manager()?;
        let store = match storage_manager.get_replica(partition_name).await {
            None => {
                // Either the first time this replica lands on the node, or a
                // previous addition failed before the coordinator-side
                // config was updated. Both are handled by adding the store.
                let replica_to_add = storage_manager
                    .cluster_map()
                    .get_bootstrap_replica(partition_name, storage_manager.current_node())
                    .ok_or_else(|| {
                        error!(
                            "no new replica found for partition {} in cluster map",
                            partition_name
                        );
                        StateTransitionError::ReplicaNotFound(format!(
                            "new replica {} is not found in clustermap for {}",
                            partition_name,
                            storage_manager.current_node()
                        ))
                    })?;
                if !storage_manager.add_blob_store(&replica_to_add).await {
                    // The cluster map decreased the disk's available bytes
                    // when it allocated this replica; give them back.
                    replica_to_add
                        .disk_id()
                        .increase_available_space(replica_to_add.capacity_in_bytes());
                    error!(
                        "failed to add store {} into storage manager",
                        partition_name
                    );
                    return Err(StateTransitionError::ReplicaOperationFailure(format!(
                        "failed to add store {} into storage manager",
                        partition_name
                    )));
                }
                if let Some(primary) = storage_manager.primary_participant() {
                    match primary
                        .update_data_node_info_in_cluster(&replica_to_add, true)
                        .await
                    {
                        Ok(true) => info!(
                            "partition {} is successfully added into the data node config",
                            partition_name
                        ),
                        Ok(false) => {
                            error!(
                                "failed to add partition {} into the data node config",
                                partition_name
                            );
                            return Err(StateTransitionError::ClusterUpdateFailure(format!(
                                "failed to add partition {} into the data node config",
                                partition_name
                            )));
                        }
                        Err(e) => {
                            return Err(StateTransitionError::ClusterUpdateFailure(
                                e.to_string(),
                            ))
                        }
                    }
                }
                // A successful add guarantees the store resolves started.
                storage_manager
                    .get_store(replica_to_add.partition_id(), false)
                    .await
                    .ok_or_else(|| {
                        StateTransitionError::ReplicaOperationFailure(format!(
                            "store {} was added but cannot be resolved",
                            partition_name
                        ))
                    })?
            }
            Some(replica) => {
                let store = storage_manager
                    .get_store(replica.partition_id(), false)
                    .await
                    .ok_or_else(|| {
                        StateTransitionError::StoreNotStarted(format!(
                            "store {} didn't start correctly, replica should be set to ERROR state",
                            partition_name
                        ))
                    })?;
                if decommission_file_exists(&replica) {
                    // An abbreviated coordinator lifecycle can re-enter
                    // bootstrap from the inactive side; a stale
                    // decommission marker must not taint this bootstrap.
                    delete_decommission_file(&replica).await.map_err(|e| {
                        StateTransitionError::ReplicaOperationFailure(e.to_string())
                    })?;
                    store.set_recover_from_decommission(false);
                }
                let used = store.get_size_in_bytes().map_err(|e| {
                    StateTransitionError::ReplicaOperationFailure(e.to_string())
                })?;
                if used <= LOG_HEADER_SIZE {
                    info!(
                        "store {} has used capacity {} <= {} bytes, consider it recently \
                         created and make it go through bootstrap",
                        partition_name, used, LOG_HEADER_SIZE
                    );
                    create_bootstrap_file_if_absent(&replica).await.map_err(|e| {
                        error!(
                            "failed to create bootstrap file for store {}",
                            partition_name
                        );
                        StateTransitionError::ReplicaOperationFailure(format!(
                            "failed to create bootstrap file for {}: {}",
                            partition_name, e
                        ))
                    })?;
                }
                store
            }
        };
        if self.is_primary {
            let current = store.get_current_state();
            if current != ReplicaState::Leader && current != ReplicaState::Standby {
                store
                    .set_current_state(ReplicaState::Bootstrap)
                    .map_err(|e| {
                        StateTransitionError::ReplicaOperationFailure(e.to_string())
                    })?;
            }
        }
        Ok(())
    }

    async fn on_become_standby_from_bootstrap(
        &self,
        _partition_name: &str,
    ) -> TransitionResult<()> {
        Ok(())
    }

    async fn on_become_leader_from_standby(&self, _partition_name: &str) -> TransitionResult<()> {
        Ok(())
    }

    async fn on_become_standby_from_leader(&self, _partition_name: &str) -> TransitionResult<()> {
        Ok(())
    }

    async fn on_become_inactive_from_standby(
        &self,
        partition_name: &str,
    ) -> TransitionResult<()> {
        let storage_manager = self.manager()?;
        let replica = storage_manager
            .get_replica(partition_name)
            .await
            .ok_or_else(|| {
                StateTransitionError::ReplicaNotFound(format!(
                    "replica {} is not found on current node",
                    partition_name
                ))
            })?;
        let store = storage_manager
            .get_store(replica.partition_id(), true)
            .await
            .ok_or_else(|| {
                StateTransitionError::ReplicaNotFound(format!(
                    "store {} is not found on current node",
                    partition_name
                ))
            })?;
        if store.is_disabled() {
            return Err(StateTransitionError::ReplicaOperationFailure(format!(
                "store {} is already disabled due to I/O error or by admin operation",
                partition_name
            )));
        }
        if !store.is_started() {
            return Err(StateTransitionError::StoreNotStarted(format!(
                "store {} is not started",
                partition_name
            )));
        }
        create_decommission_file_if_absent(&replica)
            .await
            .map_err(|e| {
                error!(
                    "creating decommission file for replica {} failed: {}",
                    partition_name, e
                );
                StateTransitionError::ReplicaOperationFailure(format!(
                    "couldn't create decommission file for replica {}",
                    partition_name
                ))
            })?;
        if self.is_primary {
            store
                .set_current_state(ReplicaState::Inactive)
                .map_err(|e| StateTransitionError::ReplicaOperationFailure(e.to_string()))?;
            info!("store {} is set to INACTIVE", partition_name);
        }
        if !storage_manager
            .control_compaction_for_blob_store(replica.partition_id(), false)
            .await
        {
            error!("failed to disable compaction on store {}", partition_name);
            // The only way compaction control can fail is the disk manager
            // no longer owning the partition.
            return Err(StateTransitionError::ReplicaNotFound(format!(
                "couldn't disable compaction on replica {}",
                partition_name
            )));
        }
        info!(
            "compaction is successfully disabled on store {}",
            partition_name
        );
        Ok(())
    }

    async fn on_become_offline_from_inactive(
        &self,
        _partition_name: &str,
    ) -> TransitionResult<()> {
        // The replication manager owns this leg of the decommission.
        Ok(())
    }

    async fn on_become_dropped_from_offline(&self, partition_name: &str) -> TransitionResult<()> {
        let storage_manager = self.manager()?;
        let replica = match storage_manager.get_replica(partition_name).await {
            Some(replica) => replica,
            None => {
                // The node may have crashed right after the coordinator
                // dropped the replica from its config; only residue on disk
                // is left to clean.
                if let Err(e) = storage_manager
                    .maybe_delete_residual_directory(partition_name)
                    .await
                {
                    error!(
                        "deleting residual dir of replica {} failed: {}",
                        partition_name, e
                    );
                    storage_manager.metrics().inc_resume_decommission_errors();
                    return Err(StateTransitionError::ReplicaOperationFailure(format!(
                        "failed to delete residual dir of store {}",
                        partition_name
                    )));
                }
                return Ok(());
            }
        };
        let partition = replica.partition_id();
        // Skip the state check: the store may have been stopped by an
        // earlier transition, or still be running if the last decommission
        // attempt failed and the coordinator reset the replica to OFFLINE.
        let store = storage_manager
            .get_store(partition, true)
            .await
            .ok_or_else(|| {
                StateTransitionError::ReplicaNotFound(format!(
                    "store {} is not found on current node",
                    partition_name
                ))
            })?;

        let full_auto = storage_manager
            .cluster_map()
            .is_data_node_in_full_auto_mode(storage_manager.current_node());
        if store.recover_from_decommission()
            || (full_auto && store.get_previous_state() == ReplicaState::Offline)
        {
            if let Err(e) = self
                .resume_decommission(&storage_manager, partition_name)
                .await
            {
                error!(
                    "resuming decommission on replica {} failed: {}",
                    partition_name, e
                );
                storage_manager.metrics().inc_resume_decommission_errors();
                return Err(StateTransitionError::ReplicaOperationFailure(format!(
                    "exception occurred when resuming decommission on replica {}",
                    partition_name
                )));
            }
        }

        if !storage_manager.shutdown_blob_store(partition).await {
            return Err(StateTransitionError::ReplicaOperationFailure(format!(
                "failed to shutdown store {}",
                partition_name
            )));
        }
        info!(
            "store {} is successfully shut down during offline-to-dropped transition",
            partition_name
        );

        if let Some(primary) = storage_manager.primary_participant() {
            match primary
                .update_data_node_info_in_cluster(&replica, false)
                .await
            {
                Ok(true) => info!(
                    "partition {} is successfully removed from the data node config",
                    partition_name
                ),
                Ok(false) => {
                    error!(
                        "failed to remove partition {} from the data node config",
                        partition_name
                    );
                    return Err(StateTransitionError::ClusterUpdateFailure(format!(
                        "failed to remove partition {} from the data node config",
                        partition_name
                    )));
                }
                Err(e) => {
                    return Err(StateTransitionError::ClusterUpdateFailure(e.to_string()))
                }
            }
        }

        let listeners = match storage_manager.primary_participant() {
            Some(primary) => primary.get_partition_state_change_listeners().await,
            None => HashMap::new(),
        };
        info!(
            "invoking state listeners to remove replica {} from stats and replication manager",
            partition_name
        );
        if let Some(stats) = listeners.get(&StateModelListenerType::StatsManagerListener) {
            stats.on_become_dropped_from_offline(partition_name).await?;
        }
        if let Some(replication) =
            listeners.get(&StateModelListenerType::ReplicationManagerListener)
        {
            replication
                .on_become_dropped_from_offline(partition_name)
                .await?;
        }

        match storage_manager.remove_blob_store(partition).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(StateTransitionError::ReplicaOperationFailure(format!(
                    "failed to remove store {} from storage manager",
                    partition_name
                )))
            }
            Err(e) => {
                return Err(StateTransitionError::ReplicaOperationFailure(format!(
                    "failed to delete directory for store {}: {}",
                    partition_name, e
                )))
            }
        }
        storage_manager.prune_replica_name(partition_name).await;
        info!(
            "partition {} is successfully dropped on current node",
            partition_name
        );
        Ok(())
    }
}

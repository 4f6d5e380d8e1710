use crate::{
    dispatch_state_transition, ClusterParticipant, DataNodeId, PartitionStateChangeListener,
    ReplicaId, ReplicaState, ReplicaSyncUpManager, StateModelListenerType, StateTransitionError,
    StoreError, StoreResult,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, Notify, RwLock};

pub const DATA_NODE_CONFIG_FILE_NAME: &str = "data_node_config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct DataNodeConfigFile {
    local_partitions: BTreeSet<String>,
    stopped_replicas: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierState {
    Pending,
    Completed,
    Aborted,
}

struct SyncBarrier {
    notify: Notify,
    state: StdMutex<BarrierState>,
}

impl SyncBarrier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
            state: StdMutex::new(BarrierState::Pending),
        })
    }

    fn resolve(&self, state: BarrierState) {
        *self.state.lock().unwrap() = state;
        self.notify.notify_waiters();
    }

    async fn wait(&self, partition_name: &str) -> StoreResult<()> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                match *state {
                    BarrierState::Completed => {
                        // Consume the completion so a later decommission of
                        // the same partition blocks again.
                        *state = BarrierState::Pending;
                        return Ok(());
                    }
                    BarrierState::Aborted => {
                        return Err(StoreError::InvalidState(format!(
                            "sync-up barrier aborted for partition {}",
                            partition_name
                        )));
                    }
                    BarrierState::Pending => {}
                }
            }
            notified.await;
        }
    }
}

/// In-process sync-up barriers for deactivation and disconnection. Peers are
/// simulated by whoever calls the `complete_*` methods (the replication
/// layer in production, the test harness in tests).
pub struct LocalReplicaSyncUpManager {
    deactivation: StdMutex<HashMap<String, Arc<SyncBarrier>>>,
    disconnection: StdMutex<HashMap<String, Arc<SyncBarrier>>>,
}

impl LocalReplicaSyncUpManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deactivation: StdMutex::new(HashMap::new()),
            disconnection: StdMutex::new(HashMap::new()),
        })
    }

    fn barrier(
        map: &StdMutex<HashMap<String, Arc<SyncBarrier>>>,
        partition_name: &str,
    ) -> Arc<SyncBarrier> {
        let mut guard = map.lock().unwrap();
        guard
            .entry(partition_name.to_string())
            .or_insert_with(SyncBarrier::new)
            .clone()
    }

    pub fn complete_deactivation(&self, partition_name: &str) {
        Self::barrier(&self.deactivation, partition_name).resolve(BarrierState::Completed);
    }

    pub fn complete_disconnection(&self, partition_name: &str) {
        Self::barrier(&self.disconnection, partition_name).resolve(BarrierState::Completed);
    }

    /// Abort both barriers of a partition, waking any waiter with an error.
    /// Used when the node shuts down mid-decommission.
    pub fn abort_sync_up(&self, partition_name: &str) {
        Self::barrier(&self.deactivation, partition_name).resolve(BarrierState::Aborted);
        Self::barrier(&self.disconnection, partition_name).resolve(BarrierState::Aborted);
    }
}

#[async_trait]
impl ReplicaSyncUpManager for LocalReplicaSyncUpManager {
    async fn wait_deactivation_completed(&self, partition_name: &str) -> StoreResult<()> {
        Self::barrier(&self.deactivation, partition_name)
            .wait(partition_name)
            .await
    }

    async fn wait_disconnection_completed(&self, partition_name: &str) -> StoreResult<()> {
        Self::barrier(&self.disconnection, partition_name)
            .wait(partition_name)
            .await
    }
}

/// A participant backed by a JSON data-node config file instead of a remote
/// coordination service. The daemon runs with one of these; tests run with
/// one or two.
pub struct LocalClusterParticipant {
    node: DataNodeId,
    config_path: PathBuf,
    state: Mutex<DataNodeConfigFile>,
    listeners: RwLock<HashMap<StateModelListenerType, Arc<dyn PartitionStateChangeListener>>>,
    sync_up: Arc<LocalReplicaSyncUpManager>,
}

impl LocalClusterParticipant {
    pub async fn new(node: DataNodeId, config_dir: &Path) -> StoreResult<Arc<Self>> {
        tokio::fs::create_dir_all(config_dir)
            .await
            .map_err(|e| StoreError::IoError(format!("create participant dir failed: {}", e)))?;
        let config_path = config_dir.join(DATA_NODE_CONFIG_FILE_NAME);
        let state = if config_path.exists() {
            let config_str = tokio::fs::read_to_string(&config_path).await.map_err(|e| {
                warn!("LocalClusterParticipant: read config failed: {}", e);
                StoreError::IoError(format!("read data node config failed: {}", e))
            })?;
            serde_json::from_str::<DataNodeConfigFile>(&config_str).map_err(|e| {
                warn!("LocalClusterParticipant: parse config failed: {}", e);
                StoreError::InvalidParam(format!("data node config invalid: {}", e))
            })?
        } else {
            let state = DataNodeConfigFile::default();
            let config_str = serde_json::to_string_pretty(&state)
                .map_err(|e| StoreError::InvalidParam(e.to_string()))?;
            tokio::fs::write(&config_path, config_str).await.map_err(|e| {
                StoreError::IoError(format!("write data node config failed: {}", e))
            })?;
            state
        };
        debug!(
            "LocalClusterParticipant: loaded {} local partitions, {} stopped replicas",
            state.local_partitions.len(),
            state.stopped_replicas.len()
        );
        Ok(Arc::new(Self {
            node,
            config_path,
            state: Mutex::new(state),
            listeners: RwLock::new(HashMap::new()),
            sync_up: LocalReplicaSyncUpManager::new(),
        }))
    }

    pub fn sync_up_manager(&self) -> Arc<LocalReplicaSyncUpManager> {
        self.sync_up.clone()
    }

    async fn persist(&self, state: &DataNodeConfigFile) -> StoreResult<()> {
        let config_str = serde_json::to_string_pretty(state)
            .map_err(|e| StoreError::InvalidParam(e.to_string()))?;
        tokio::fs::write(&self.config_path, config_str)
            .await
            .map_err(|e| StoreError::IoError(format!("persist data node config failed: {}", e)))
    }

    /// Deliver one textual state transition to every registered listener,
    /// in listener-type order. The first failing listener fails the
    /// transition; the coordinator then drives this replica to ERROR.
    pub async fn process_state_transition(
        &self,
        partition_name: &str,
        from: ReplicaState,
        to: ReplicaState,
    ) -> Result<(), StateTransitionError> {
        let listeners = self.listeners.read().await;
        let order = [
            StateModelListenerType::StorageManagerListener,
            StateModelListenerType::ReplicationManagerListener,
            StateModelListenerType::StatsManagerListener,
        ];
        for listener_type in order {
            if let Some(listener) = listeners.get(&listener_type) {
                if let Err(e) =
                    dispatch_state_transition(listener.as_ref(), partition_name, from, to).await
                {
                    warn!(
                        "state transition {}-{} failed on {:?} for partition {}: {}",
                        from, to, listener_type, partition_name, e
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterParticipant for LocalClusterParticipant {
    async fn register_partition_state_change_listener(
        &self,
        listener_type: StateModelListenerType,
        listener: Arc<dyn PartitionStateChangeListener>,
    ) {
        info!("LocalClusterParticipant: registering {:?}", listener_type);
        self.listeners.write().await.insert(listener_type, listener);
    }

    async fn set_initial_local_partitions(&self, partitions: HashSet<String>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.local_partitions = partitions.into_iter().collect();
        self.persist(&state).await
    }

    async fn update_data_node_info_in_cluster(
        &self,
        replica: &ReplicaId,
        add: bool,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let name = replica.partition_name();
        if add {
            state.local_partitions.insert(name);
        } else {
            state.local_partitions.remove(&name);
        }
        self.persist(&state).await?;
        Ok(true)
    }

    fn get_replica_sync_up_manager(&self) -> Option<Arc<dyn ReplicaSyncUpManager>> {
        Some(self.sync_up.clone())
    }

    async fn get_partition_state_change_listeners(
        &self,
    ) -> HashMap<StateModelListenerType, Arc<dyn PartitionStateChangeListener>> {
        self.listeners.read().await.clone()
    }

    async fn set_replica_stopped_state(
        &self,
        replicas: &[ReplicaId],
        stopped: bool,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        for replica in replicas {
            let name = replica.partition_name();
            if stopped {
                state.stopped_replicas.insert(name);
            } else {
                state.stopped_replicas.remove(&name);
            }
        }
        self.persist(&state).await?;
        Ok(true)
    }

    async fn get_stopped_replicas(&self) -> HashSet<String> {
        self.state
            .lock()
            .await
            .stopped_replicas
            .iter()
            .cloned()
            .collect()
    }

    fn local_node(&self) -> &DataNodeId {
        &self.node
    }
}

use async_trait::async_trait;
use cluster_lib::{
    ClusterParticipant, DataNodeId, PartitionStateChangeListener, ReplicaId,
    ReplicaSyncUpManager, StateModelListenerType, StoreError, StoreResult, TransitionResult,
};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;

static LOG_INIT: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn log_init() {
    Lazy::force(&LOG_INIT);
}

pub fn test_node() -> DataNodeId {
    DataNodeId::new("localhost", 6667)
}

pub type EventLog = Arc<StdMutex<Vec<String>>>;

pub fn new_event_log() -> EventLog {
    Arc::new(StdMutex::new(Vec::new()))
}

pub fn events_snapshot(events: &EventLog) -> Vec<String> {
    events.lock().unwrap().clone()
}

/// In-memory participant with a shared ordered event log, used to observe
/// call sequences across the participant, the extra listeners and the
/// sync-up manager.
pub struct MockParticipant {
    node: DataNodeId,
    listeners: RwLock<HashMap<StateModelListenerType, Arc<dyn PartitionStateChangeListener>>>,
    stopped: StdMutex<HashSet<String>>,
    initial_partitions: StdMutex<HashSet<String>>,
    pub events: EventLog,
    sync_up: Option<Arc<dyn ReplicaSyncUpManager>>,
    pub fail_stop_state_update: AtomicBool,
    pub fail_data_node_update: AtomicBool,
}

impl MockParticipant {
    pub fn new(events: EventLog, sync_up: Option<Arc<dyn ReplicaSyncUpManager>>) -> Arc<Self> {
        Arc::new(Self {
            node: test_node(),
            listeners: RwLock::new(HashMap::new()),
            stopped: StdMutex::new(HashSet::new()),
            initial_partitions: StdMutex::new(HashSet::new()),
            events,
            sync_up,
            fail_stop_state_update: AtomicBool::new(false),
            fail_data_node_update: AtomicBool::new(false),
        })
    }

    pub fn initial_partitions(&self) -> HashSet<String> {
        self.initial_partitions.lock().unwrap().clone()
    }

    pub fn stopped_replicas_snapshot(&self) -> HashSet<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn preset_stopped(&self, names: &[&str]) {
        let mut stopped = self.stopped.lock().unwrap();
        for name in names {
            stopped.insert(name.to_string());
        }
    }

    pub async fn storage_listener(&self) -> Arc<dyn PartitionStateChangeListener> {
        self.listeners
            .read()
            .await
            .get(&StateModelListenerType::StorageManagerListener)
            .cloned()
            .expect("storage manager listener registered")
    }
}

#[async_trait]
impl ClusterParticipant for MockParticipant {
    async fn register_partition_state_change_listener(
        &self,
        listener_type: StateModelListenerType,
        listener: Arc<dyn PartitionStateChangeListener>,
    ) {
        self.listeners.write().await.insert(listener_type, listener);
    }

    async fn set_initial_local_partitions(&self, partitions: HashSet<String>) -> StoreResult<()> {
        *self.initial_partitions.lock().unwrap() = partitions;
        Ok(())
    }

    async fn update_data_node_info_in_cluster(
        &self,
        replica: &ReplicaId,
        add: bool,
    ) -> StoreResult<bool> {
        if self.fail_data_node_update.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.events.lock().unwrap().push(format!(
            "participant.update_data_node_info:{}:{}",
            if add { "add" } else { "remove" },
            replica.partition_name()
        ));
        Ok(true)
    }

    fn get_replica_sync_up_manager(&self) -> Option<Arc<dyn ReplicaSyncUpManager>> {
        self.sync_up.clone()
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
        if self.fail_stop_state_update.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut set = self.stopped.lock().unwrap();
        for replica in replicas {
            if stopped {
                set.insert(replica.partition_name());
            } else {
                set.remove(&replica.partition_name());
            }
        }
        Ok(true)
    }

    async fn get_stopped_replicas(&self) -> HashSet<String> {
        self.stopped.lock().unwrap().clone()
    }

    fn local_node(&self) -> &DataNodeId {
        &self.node
    }
}

/// Listener standing in for the replication or stats manager; records every
/// callback into the shared event log.
pub struct RecordingListener {
    tag: &'static str,
    events: EventLog,
}

impl RecordingListener {
    pub fn new(tag: &'static str, events: EventLog) -> Arc<Self> {
        Arc::new(Self { tag, events })
    }

    fn record(&self, transition: &str, name: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}.{}:{}", self.tag, transition, name));
    }
}

#[async_trait]
impl PartitionStateChangeListener for RecordingListener {
    async fn on_become_bootstrap_from_offline(&self, name: &str) -> TransitionResult<()> {
        self.record("bootstrap_from_offline", name);
        Ok(())
    }
    async fn on_become_standby_from_bootstrap(&self, name: &str) -> TransitionResult<()> {
        self.record("standby_from_bootstrap", name);
        Ok(())
    }
    async fn on_become_leader_from_standby(&self, name: &str) -> TransitionResult<()> {
        self.record("leader_from_standby", name);
        Ok(())
    }
    async fn on_become_standby_from_leader(&self, name: &str) -> TransitionResult<()> {
        self.record("standby_from_leader", name);
        Ok(())
    }
    async fn on_become_inactive_from_standby(&self, name: &str) -> TransitionResult<()> {
        self.record("inactive_from_standby", name);
        Ok(())
    }
    async fn on_become_offline_from_inactive(&self, name: &str) -> TransitionResult<()> {
        self.record("offline_from_inactive", name);
        Ok(())
    }
    async fn on_become_dropped_from_offline(&self, name: &str) -> TransitionResult<()> {
        self.record("dropped_from_offline", name);
        Ok(())
    }
}

/// Sync-up manager that records its waits and resolves through an inner
/// local barrier, so tests can block a decommission and release it.
pub struct RecordingSyncUpManager {
    inner: Arc<cluster_lib::LocalReplicaSyncUpManager>,
    events: EventLog,
}

impl RecordingSyncUpManager {
    pub fn new(events: EventLog) -> Arc<Self> {
        Arc::new(Self {
            inner: cluster_lib::LocalReplicaSyncUpManager::new(),
            events,
        })
    }

    pub fn complete_deactivation(&self, name: &str) {
        self.inner.complete_deactivation(name);
    }

    pub fn complete_disconnection(&self, name: &str) {
        self.inner.complete_disconnection(name);
    }

    pub fn abort_sync_up(&self, name: &str) {
        self.inner.abort_sync_up(name);
    }
}

#[async_trait]
impl ReplicaSyncUpManager for RecordingSyncUpManager {
    async fn wait_deactivation_completed(&self, name: &str) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("syncup.wait_deactivation:{}", name));
        self.inner.wait_deactivation_completed(name).await
    }

    async fn wait_disconnection_completed(&self, name: &str) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("syncup.wait_disconnection:{}", name));
        self.inner.wait_disconnection_completed(name).await
    }
}
